//! Binary framing of requests and responses.
//!
//! All numbers are little endian. GUIDs (activity id and GUID tokens) use the mixed-endian layout
//!  where the first three groups are little endian.
//!
//! Request frame:
//! ```ascii
//!  0: total length (u32) - includes this length field and the metadata, but not the body
//!  4: resource type (u16)
//!  6: operation type (u16)
//!  8: activity id (16 bytes)
//! 24: metadata tokens
//!  *: body length (u32) and body - only if the PayloadPresent token is 1
//! ```
//!
//! Response frame:
//! ```ascii
//!  0: total length (u32) - includes this length field and the metadata, but not the body
//!  4: status (u32)
//!  8: activity id (16 bytes)
//! 24: metadata tokens
//!  *: body length (u32) and body - only if the PayloadPresent token is 1
//! ```
//!
//! Token:
//! ```ascii
//! 0: identifier (u16)
//! 2: token type (u8)
//! 3: value - fixed width for numbers and GUIDs, length prefixed for strings and byte strings
//! ```

pub mod context;
pub mod header_table;
pub mod request;
pub mod resource;
pub mod response;
pub mod token;

use bytes::Buf;
use crate::wire::token::TokenType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer ended: {needed} bytes required, {remaining} available")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown token type code {code:#04x} for token {id:#06x}")]
    UnknownTokenType { id: u16, code: u8 },
    #[error("token {id:#06x} is not valid UTF-8")]
    InvalidUtf8 { id: u16 },
    #[error("value of {len} bytes does not fit the length prefix of {token_type:?}")]
    ValueTooLong { token_type: TokenType, len: usize },
    #[error("frame length {len} is outside the valid range [{min}, {max}]")]
    InvalidFrameLength { len: usize, min: usize, max: usize },
    #[error("body length {len} exceeds the ceiling of {max}")]
    BodyTooLarge { len: usize, max: usize },
    #[error("mandatory response token {0} is missing")]
    MissingMandatoryToken(&'static str),
    #[error("token {id:#06x} has type {actual:?}, expected {expected:?}")]
    TokenTypeMismatch { id: u16, expected: TokenType, actual: TokenType },
    #[error("invalid value {value:?} for request header {name}")]
    InvalidHeaderValue { name: String, value: String },
}

impl WireError {
    /// true for errors that leave the byte stream in an undefined position, i.e. that make it
    ///  impossible to find the next frame boundary
    pub fn is_framing_error(&self) -> bool {
        matches!(self, WireError::InvalidFrameLength { .. } | WireError::BodyTooLarge { .. })
    }
}

pub(crate) fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated { needed, remaining: buf.remaining() });
    }
    Ok(())
}
