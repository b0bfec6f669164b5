//! Attestation types for OpenTimestamps
//!
//! An attestation is a claim that some data existed at some time.

use std::fmt;
use std::io::{Read, Write};

use super::error::{OtsError, Result, MAX_URI_LEN};
use super::ser::{Deserializer, Serializer};

/// Size in bytes of the tag identifying the attestation type
pub const TAG_SIZE: usize = 8;

/// Tag indicating a Bitcoin attestation
pub const BITCOIN_TAG: &[u8] = b"\x05\x88\x96\x0d\x73\xd7\x19\x01";

/// Tag indicating a pending attestation
pub const PENDING_TAG: &[u8] = b"\x83\xdf\xe3\x0d\x2e\xf9\x0c\x8e";

/// An attestation that some data existed at some time
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Attestation {
    /// An attestation from a Bitcoin blockheader.
    /// This consists of a blockheight and nothing more.
    Bitcoin {
        /// The Bitcoin block height
        height: usize,
    },
    /// An attestation from some server.
    /// The server should be expected to keep anything it attests to forever.
    Pending {
        /// The URI where the attestation can be updated
        uri: String,
    },
    /// An unknown attestation type that we store as-is
    Unknown {
        /// The attestation type tag
        tag: Vec<u8>,
        /// The attestation data
        data: Vec<u8>,
    },
}

impl Attestation {
    /// Deserialize an arbitrary attestation
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The tag is invalid
    /// - The URI contains invalid characters
    /// - Deserialization fails
    pub fn deserialize<R: Read>(deser: &mut Deserializer<R>) -> Result<Self> {
        let tag = deser.read_fixed_bytes(TAG_SIZE)?;
        let len = deser.read_uint()?;

        if tag == BITCOIN_TAG {
            let height = deser.read_uint()?;
            Ok(Self::Bitcoin { height })
        } else if tag == PENDING_TAG {
            // This validation logic ensures URI contains only safe characters
            let uri_bytes = deser.read_bytes(0, MAX_URI_LEN)?;
            let uri_string = String::from_utf8(uri_bytes)?;
            for ch in uri_string.chars() {
                match ch {
                    'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' | '/' | ':' => {}
                    x => return Err(OtsError::InvalidUriChar(x)),
                }
            }
            Ok(Self::Pending { uri: uri_string })
        } else {
            Ok(Self::Unknown { tag, data: deser.read_fixed_bytes(len)? })
        }
    }

    /// Serialize an attestation
    ///
    /// # Errors
    ///
    /// Returns an error if the write operation fails
    pub fn serialize<W: Write>(&self, ser: &mut Serializer<W>) -> Result<()> {
        let mut byte_ser = Serializer::new(Vec::new());
        match *self {
            Self::Bitcoin { height } => {
                ser.write_fixed_bytes(BITCOIN_TAG)?;
                byte_ser.write_uint(height)?;
                ser.write_bytes(&byte_ser.into_inner())
            }
            Self::Pending { ref uri } => {
                ser.write_fixed_bytes(PENDING_TAG)?;
                byte_ser.write_bytes(uri.as_bytes())?;
                ser.write_bytes(&byte_ser.into_inner())
            }
            Self::Unknown { ref tag, ref data } => {
                ser.write_fixed_bytes(tag)?;
                ser.write_bytes(data)
            }
        }
    }
}

impl fmt::Display for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bitcoin { height } => write!(f, "Bitcoin block {}", height),
            Self::Pending { uri } => write!(f, "Pending: update URI {}", uri),
            Self::Unknown { tag, data } => {
                write!(f, "unknown attestation type {}: {}", hex::encode(tag), hex::encode(data))
            }
        }
    }
}
