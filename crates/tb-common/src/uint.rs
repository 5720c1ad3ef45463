//! Fixed-width unsigned integers with a little-endian byte layout
//!
//! These are the wire representation of every integer field exchanged with the
//! engine. 128-bit fields cross the C boundary as a pair of 64-bit words, which is
//! why every width can be split into `high` and `low` halves.
//!
//! # Invariants
//! - Value always fits the width (enforced at construction)
//! - Bytes are little-endian and exactly `BYTES` long
//! - Ordering is by unsigned value, not by byte order
//!
//! Arithmetic that can leave the range is exposed as `try_*` methods returning
//! [`UIntError::Range`]. Bitwise `& | ^` and `>>` cannot leave the range and are
//! plain operators. True division and complement are not offered at all:
//!
//! ```compile_fail
//! use tb_common::UInt64;
//! let _ = UInt64::new(4) / UInt64::new(2);
//! ```
//!
//! ```compile_fail
//! use tb_common::UInt16;
//! let _ = !UInt16::new(1);
//! ```

use crate::error::{UIntError, UIntResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Shr};

macro_rules! fixed_uint {
    ($(#[$meta:meta])* $name:ident, $prim:ty, $half:ty, $bytes:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(transparent)]
        pub struct $name([u8; $bytes]);

        impl $name {
            /// Width in bits
            pub const BITS: u32 = <$prim>::BITS;
            /// Width in bytes
            pub const BYTES: usize = $bytes;
            /// Zero
            pub const ZERO: Self = Self([0; $bytes]);
            /// Largest representable value
            pub const MAX: Self = Self([0xff; $bytes]);

            /// Create from a value of exactly this width
            #[inline(always)]
            pub const fn new(value: $prim) -> Self {
                Self(value.to_le_bytes())
            }

            /// Create from any integer, rejecting negative or too-wide values
            pub fn try_new<T>(value: T) -> UIntResult<Self>
            where
                T: TryInto<$prim>,
            {
                value
                    .try_into()
                    .map(Self::new)
                    .map_err(|_| UIntError::Range { bits: Self::BITS })
            }

            /// Create from an exact-length little-endian buffer
            pub fn from_bytes(bytes: &[u8]) -> UIntResult<Self> {
                let array: [u8; $bytes] = bytes.try_into().map_err(|_| UIntError::Length {
                    expected: $bytes,
                    actual: bytes.len(),
                })?;
                Ok(Self(array))
            }

            /// Create from a (high, low) pair of half-width words
            pub fn from_words(high: u128, low: u128) -> UIntResult<Self> {
                let half_max = <$half>::MAX as u128;
                if high > half_max || low > half_max {
                    return Err(UIntError::Range { bits: Self::BITS / 2 });
                }
                Ok(Self::new(((high as $prim) << (Self::BITS / 2)) | low as $prim))
            }

            /// Integer value
            #[inline(always)]
            pub const fn get(&self) -> $prim {
                <$prim>::from_le_bytes(self.0)
            }

            /// Little-endian bytes
            #[inline(always)]
            pub const fn to_bytes(self) -> [u8; $bytes] {
                self.0
            }

            /// Borrow the little-endian bytes
            #[inline(always)]
            pub const fn as_bytes(&self) -> &[u8; $bytes] {
                &self.0
            }

            /// Upper half-width word
            pub const fn high(&self) -> $half {
                (self.get() >> (Self::BITS / 2)) as $half
            }

            /// Lower half-width word
            pub const fn low(&self) -> $half {
                self.get() as $half
            }

            /// `(high, low)` words
            pub const fn words(&self) -> ($half, $half) {
                (self.high(), self.low())
            }

            /// Zero-padded hexadecimal form of the value
            pub fn to_hex(&self) -> String {
                let mut be = self.to_bytes();
                be.reverse();
                hex::encode(be)
            }

            /// Whether the value is zero
            pub const fn is_zero(&self) -> bool {
                self.get() == 0
            }

            /// Sum, failing on overflow
            pub fn try_add(self, rhs: Self) -> UIntResult<Self> {
                self.get().checked_add(rhs.get()).map(Self::new).ok_or(Self::range())
            }

            /// Difference, failing if it would go negative
            pub fn try_sub(self, rhs: Self) -> UIntResult<Self> {
                self.get().checked_sub(rhs.get()).map(Self::new).ok_or(Self::range())
            }

            /// Product, failing on overflow
            pub fn try_mul(self, rhs: Self) -> UIntResult<Self> {
                self.get().checked_mul(rhs.get()).map(Self::new).ok_or(Self::range())
            }

            /// Floor division
            pub fn try_div(self, rhs: Self) -> UIntResult<Self> {
                self.get()
                    .checked_div(rhs.get())
                    .map(Self::new)
                    .ok_or(UIntError::DivisionByZero)
            }

            /// Remainder of floor division
            pub fn try_rem(self, rhs: Self) -> UIntResult<Self> {
                self.get()
                    .checked_rem(rhs.get())
                    .map(Self::new)
                    .ok_or(UIntError::DivisionByZero)
            }

            /// Left shift, failing if any set bit would be shifted out
            pub fn try_shl(self, bits: u32) -> UIntResult<Self> {
                let value = self.get();
                if value == 0 {
                    return Ok(Self::ZERO);
                }
                if bits >= Self::BITS || value.leading_zeros() < bits {
                    return Err(Self::range());
                }
                Ok(Self::new(value << bits))
            }

            const fn range() -> UIntError {
                UIntError::Range { bits: Self::BITS }
            }
        }

        impl From<$prim> for $name {
            fn from(value: $prim) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for $prim {
            fn from(value: $name) -> Self {
                value.get()
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.get().cmp(&other.get())
            }
        }

        impl PartialEq<$prim> for $name {
            fn eq(&self, other: &$prim) -> bool {
                self.get() == *other
            }
        }

        impl PartialOrd<$prim> for $name {
            fn partial_cmp(&self, other: &$prim) -> Option<Ordering> {
                Some(self.get().cmp(other))
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self::new(self.get() & rhs.get())
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self::new(self.get() | rhs.get())
            }
        }

        impl BitXor for $name {
            type Output = Self;
            fn bitxor(self, rhs: Self) -> Self {
                Self::new(self.get() ^ rhs.get())
            }
        }

        impl Shr<u32> for $name {
            type Output = Self;
            fn shr(self, bits: u32) -> Self {
                Self::new(self.get().checked_shr(bits).unwrap_or(0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.get())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.get(), f)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.get(), f)
            }
        }

        impl fmt::UpperHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::UpperHex::fmt(&self.get(), f)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.get().serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                <$prim>::deserialize(deserializer).map(Self::new)
            }
        }
    };
}

fixed_uint!(
    /// 16-bit unsigned integer
    UInt16, u16, u8, 2
);

fixed_uint!(
    /// 32-bit unsigned integer
    UInt32, u32, u16, 4
);

fixed_uint!(
    /// 64-bit unsigned integer
    UInt64, u64, u32, 8
);

fixed_uint!(
    /// 128-bit unsigned integer
    ///
    /// Identifiers, amounts and balances. Crosses the C boundary as
    /// `{ low: u64, high: u64 }`.
    UInt128, u128, u64, 16
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    macro_rules! width_tests {
        ($module:ident, $name:ident, $prim:ty, $wide:ty) => {
            mod $module {
                use super::*;

                proptest! {
                    #[test]
                    fn test_bytes_round_trip(value in any::<$prim>()) {
                        let u = $name::new(value);
                        let back = $name::from_bytes(&u.to_bytes()).unwrap();
                        prop_assert_eq!(back, u);
                        prop_assert_eq!(back.get(), value);
                        prop_assert_eq!(u.to_bytes(), value.to_le_bytes());
                    }

                    #[test]
                    fn test_words_round_trip(value in any::<$prim>()) {
                        let u = $name::new(value);
                        let (high, low) = u.words();
                        prop_assert_eq!($name::from_words(high as u128, low as u128).unwrap(), u);
                    }

                    #[test]
                    fn test_order_matches_value(a in any::<$prim>(), b in any::<$prim>()) {
                        prop_assert_eq!($name::new(a).cmp(&$name::new(b)), a.cmp(&b));
                    }
                }

                #[test]
                fn test_init_bounds() {
                    for value in [0, <$prim>::MAX] {
                        let u = $name::new(value);
                        assert_eq!(u.get(), value);
                        assert_eq!(u.to_string(), value.to_string());
                        assert_eq!(u.to_hex(), format!("{:0w$x}", value, w = $name::BYTES * 2));
                    }

                    assert_eq!($name::try_new(-1i64), Err(UIntError::Range { bits: $name::BITS }));
                    assert_eq!($name::try_new(<$prim>::MAX).unwrap(), $name::MAX);
                }

                #[test]
                fn test_one_past_max_rejected() {
                    let too_wide: $wide = (<$prim>::MAX as $wide) + 1;
                    assert!(matches!($name::try_new(too_wide), Err(UIntError::Range { .. })));
                }

                #[test]
                fn test_from_bytes_length() {
                    let short = vec![0u8; $name::BYTES - 1];
                    let long = vec![0u8; $name::BYTES + 1];
                    assert_eq!(
                        $name::from_bytes(&short),
                        Err(UIntError::Length { expected: $name::BYTES, actual: $name::BYTES - 1 })
                    );
                    assert!($name::from_bytes(&long).is_err());
                }

                #[test]
                fn test_from_words_range() {
                    let max = $name::MAX;
                    let (high, low) = max.words();
                    assert_eq!($name::from_words(high as u128, low as u128).unwrap(), max);
                    let too_wide = (high as u128) + 1;
                    assert!($name::from_words(too_wide, 0).is_err());
                    assert!($name::from_words(0, too_wide).is_err());
                }

                #[test]
                fn test_operators() {
                    let v: $prim = <$prim>::MAX / 2;
                    let u = $name::new(v);
                    let one = $name::new(1);
                    let two = $name::new(2);

                    assert_eq!(u, v);
                    assert!(u < $name::new(v + 1));
                    assert!(u > $name::new(v - 1));
                    assert_eq!(u.try_add(one).unwrap(), v + 1);
                    assert_eq!(u.try_sub(one).unwrap(), v - 1);
                    assert_eq!(u.try_mul(two).unwrap(), v * 2);
                    assert_eq!(u.try_div(two).unwrap(), v / 2);
                    assert_eq!(u.try_rem(two).unwrap(), v % 2);
                    assert_eq!(u.try_shl(1).unwrap(), v << 1);
                    assert_eq!(u >> 1, v >> 1);
                    assert_eq!(u & one, v & 1);
                    assert_eq!(u | one, v | 1);
                    assert_eq!(u ^ one, v ^ 1);
                }

                #[test]
                fn test_operators_leave_range() {
                    let one = $name::new(1);
                    assert!($name::MAX.try_add(one).is_err());
                    assert!($name::ZERO.try_sub(one).is_err());
                    assert!($name::MAX.try_mul($name::new(2)).is_err());
                    assert!($name::MAX.try_shl(1).is_err());
                    assert_eq!(one.try_div($name::ZERO), Err(UIntError::DivisionByZero));
                    assert_eq!(one.try_rem($name::ZERO), Err(UIntError::DivisionByZero));
                    assert_eq!($name::ZERO.try_shl($name::BITS + 3).unwrap(), $name::ZERO);
                }
            }
        };
    }

    width_tests!(uint16, UInt16, u16, u32);
    width_tests!(uint32, UInt32, u32, u64);
    width_tests!(uint64, UInt64, u64, u128);

    mod uint128 {
        use super::*;

        proptest! {
            #[test]
            fn test_bytes_round_trip(value in any::<u128>()) {
                let u = UInt128::new(value);
                prop_assert_eq!(UInt128::from_bytes(u.as_bytes()).unwrap().get(), value);
                prop_assert_eq!(((u.high() as u128) << 64) | u.low() as u128, value);
            }
        }

        #[test]
        fn test_range() {
            assert!(UInt128::try_new(-1i128).is_err());
            assert_eq!(UInt128::try_new(u128::MAX).unwrap(), UInt128::MAX);
            assert!(UInt128::from_words(1 << 64, 0).is_err());
            assert!(UInt128::from_bytes(&[0u8; 17]).is_err());
        }

        #[test]
        fn test_words_layout() {
            let u = UInt128::from_words(0x0102_0304_0506_0708, 0x1112_1314_1516_1718).unwrap();
            assert_eq!(u.low(), 0x1112_1314_1516_1718);
            assert_eq!(u.high(), 0x0102_0304_0506_0708);
            assert_eq!(u.as_bytes()[0], 0x18);
            assert_eq!(u.as_bytes()[15], 0x01);
            assert_eq!(format!("{:x}", u), "1020304050607081112131415161718");
            assert_eq!(u.to_hex(), "01020304050607081112131415161718");
        }
    }
}
