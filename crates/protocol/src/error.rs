//! Protocol error types

use thiserror::Error;

/// Errors raised while building AOA control requests or parsing wire values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Identification string contains a byte outside 7-bit ASCII
    #[error("Identification string {slot} is not 7-bit ASCII: {value:?}")]
    NonAscii { slot: &'static str, value: String },

    /// Identification string contains an embedded NUL
    #[error("Identification string {slot} contains an interior NUL byte")]
    InteriorNul { slot: &'static str },

    /// Encoded string does not fit in a single control transfer
    #[error("Identification string {slot} too long: {len} bytes (max: {max})")]
    StringTooLong {
        slot: &'static str,
        len: usize,
        max: usize,
    },

    /// String slot outside the six defined identification slots
    #[error("Unknown identification string slot: {0}")]
    UnknownSlot(u16),

    /// Device filter could not be parsed
    #[error("Invalid device filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
