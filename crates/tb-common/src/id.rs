//! Monotonic 128-bit identifiers
//!
//! Universally unique, sortable identifiers modelled on ULID. Read as a
//! little-endian 128-bit integer the layout is:
//!
//! ```text
//! byte  0        8    10   12        16
//!       ├────────┼────┼────┼─────────┤
//!       │tail low│tail│ ts │ ts >> 16│
//!       │  u64   │ hi │ lo │   u32   │
//!       └────────┴────┴────┴─────────┘
//! ```
//!
//! The millisecond timestamp occupies the most significant bits, so the
//! integer value (not the byte order) is monotonic.

use crate::error::{IdError, IdResult};
use crate::uint::UInt128;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::OnceLock;

/// Wall-clock source in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    /// Current time in milliseconds
    fn now_ms(&self) -> u64;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline(always)]
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Cryptographically strong random byte source
pub trait EntropySource: Send + Sync {
    /// Fill `dest` entirely or fail
    fn fill(&self, dest: &mut [u8]) -> IdResult<()>;
}

/// Operating-system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> IdResult<()> {
        rand::rngs::OsRng
            .try_fill_bytes(dest)
            .map_err(|e| IdError::EntropyUnavailable(e.to_string()))
    }
}

/// 80-bit random tail, incremented in place as a little-endian counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RandomTail {
    low: u64,
    high: u16,
}

impl RandomTail {
    /// Width in bytes
    pub const BYTES: usize = 10;

    /// Read from ten little-endian bytes
    pub fn from_bytes(bytes: [u8; Self::BYTES]) -> Self {
        let mut low = [0u8; 8];
        low.copy_from_slice(&bytes[..8]);
        Self {
            low: u64::from_le_bytes(low),
            high: u16::from_le_bytes([bytes[8], bytes[9]]),
        }
    }

    /// Add one, carrying from the low word into the high word
    pub fn increment(&mut self) -> IdResult<()> {
        let (low, carry) = self.low.overflowing_add(1);
        let high = if carry {
            self.high.checked_add(1).ok_or(IdError::EntropyExhausted)?
        } else {
            self.high
        };
        self.low = low;
        self.high = high;
        Ok(())
    }

    /// Low 64-bit word
    pub const fn low(&self) -> u64 {
        self.low
    }

    /// High 16-bit word
    pub const fn high(&self) -> u16 {
        self.high
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_timestamp_ms: u64,
    last_random: RandomTail,
}

/// Thread-safe monotonic identifier generator
///
/// # Invariants
/// - Every identifier is strictly greater than any identifier this generator
///   returned before it, for callers on any thread
/// - State only moves forward; it is never reset
pub struct IdGenerator<C = SystemClock, E = OsEntropy> {
    clock: C,
    entropy: E,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Generator backed by the system clock and OS entropy
    pub fn new() -> Self {
        Self::with_sources(SystemClock, OsEntropy)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock, E: EntropySource> IdGenerator<C, E> {
    /// Generator with an injected clock and entropy source
    pub fn with_sources(clock: C, entropy: E) -> Self {
        Self {
            clock,
            entropy,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Next identifier
    pub fn next_id(&self) -> IdResult<UInt128> {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();

        let (timestamp, tail) = if now <= state.last_timestamp_ms {
            // Clock stalled or went backwards: stay on the watermark.
            let mut tail = state.last_random;
            if let Err(e) = tail.increment() {
                tracing::error!(timestamp_ms = state.last_timestamp_ms, "identifier random tail exhausted");
                return Err(e);
            }
            (state.last_timestamp_ms, tail)
        } else {
            let mut bytes = [0u8; RandomTail::BYTES];
            if let Err(e) = self.entropy.fill(&mut bytes) {
                tracing::error!(error = %e, "identifier entropy unavailable");
                return Err(e);
            }
            (now, RandomTail::from_bytes(bytes))
        };

        state.last_timestamp_ms = timestamp;
        state.last_random = tail;
        drop(state);

        Ok(compose(timestamp, tail))
    }
}

/// Anything that hands out identifiers
///
/// Lets owners of a generator swap in another clock or entropy source without
/// carrying the generator's type parameters.
pub trait IdSource: Send + Sync {
    /// Next identifier, strictly greater than the previous one
    fn next_id(&self) -> IdResult<UInt128>;
}

impl<C: Clock, E: EntropySource> IdSource for IdGenerator<C, E> {
    fn next_id(&self) -> IdResult<UInt128> {
        IdGenerator::<C, E>::next_id(self)
    }
}

fn compose(timestamp_ms: u64, tail: RandomTail) -> UInt128 {
    let mut bytes = [0u8; UInt128::BYTES];
    bytes[..8].copy_from_slice(&tail.low().to_le_bytes());
    bytes[8..10].copy_from_slice(&tail.high().to_le_bytes());
    bytes[10..12].copy_from_slice(&((timestamp_ms & 0xffff) as u16).to_le_bytes());
    bytes[12..].copy_from_slice(&((timestamp_ms >> 16) as u32).to_le_bytes());
    UInt128::new(u128::from_le_bytes(bytes))
}

static DEFAULT_GENERATOR: OnceLock<IdGenerator> = OnceLock::new();

/// Next identifier from the process-wide default generator
///
/// Safe to call from any thread; monotonicity is sequentially consistent
/// across all callers of this function.
pub fn id() -> IdResult<UInt128> {
    DEFAULT_GENERATOR.get_or_init(IdGenerator::new).next_id()
}
