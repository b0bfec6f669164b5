//! Error types for OTS module

use std::error;
use std::fmt;
use std::io;
use std::string::FromUtf8Error;

/// Maximum recursion depth for timestamp operations
pub const RECURSION_LIMIT: usize = 256;

/// Maximum length of a pending attestation URI
pub const MAX_URI_LEN: usize = 1000;

/// Maximum length of operation data
pub const MAX_OP_LENGTH: usize = 4096;

/// Error type for OTS module operations
#[derive(Debug)]
pub enum OtsError {
    /// Recursion limit exceeded
    StackOverflow,
    /// Invalid character in pending attestation URI
    InvalidUriChar(char),
    /// Unrecognized operation tag
    BadOpTag(u8),
    /// Byte vector length out of range
    BadLength {
        /// Minimum allowed length
        min: usize,
        /// Maximum allowed length
        max: usize,
        /// Actual value
        val: usize,
    },
    /// UTF-8 decoding error
    Utf8(FromUtf8Error),
    /// I/O error
    Io(io::Error),
}

impl fmt::Display for OtsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => write!(f, "recursion limit of {} exceeded", RECURSION_LIMIT),
            Self::InvalidUriChar(c) => write!(f, "invalid character '{}' in URI", c),
            Self::BadOpTag(tag) => write!(f, "unrecognized operation tag: 0x{:02x}", tag),
            Self::BadLength { min, max, val } => {
                write!(f, "length {} is out of range (expected {}-{} inclusive)", val, min, max)
            }
            Self::Utf8(e) => write!(f, "UTF-8 decoding error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl error::Error for OtsError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Utf8(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OtsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<FromUtf8Error> for OtsError {
    fn from(e: FromUtf8Error) -> Self {
        Self::Utf8(e)
    }
}

/// Result type alias for OTS operations
pub type Result<T> = std::result::Result<T, OtsError>;
