//! Error types for tb-common

use thiserror::Error;

/// Fixed-width integer error
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UIntError {
    /// Value is negative, wider than the target, or an operation left the range
    #[error("value out of range for a {bits}-bit unsigned integer")]
    Range {
        /// Width that was exceeded
        bits: u32,
    },

    /// Byte buffer does not match the width exactly
    #[error("expected {expected} bytes, got {actual}")]
    Length {
        /// Required length in bytes
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// Floor division or remainder by zero
    #[error("division by zero")]
    DivisionByZero,
}

/// Identifier generation error
///
/// Both variants are resource exhaustion: callers should treat them as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The OS random source could not provide bytes
    #[error("random source unavailable: {0}")]
    EntropyUnavailable(String),

    /// The 80-bit random tail overflowed within a single millisecond
    #[error("random bits overflow on monotonic increment")]
    EntropyExhausted,
}

/// Result type for integer operations
pub type UIntResult<T> = Result<T, UIntError>;

/// Result type for identifier generation
pub type IdResult<T> = Result<T, IdError>;
