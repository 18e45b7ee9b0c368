use std::fmt::{Display, Formatter, Write};
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::{ensure_remaining, WireError};

/// Size of a token's identifier and type code, preceding the value
pub const TOKEN_PREFIX_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TokenType {
    Byte = 0x00,
    UShort = 0x01,
    ULong = 0x02,
    Long = 0x03,
    ULongLong = 0x04,
    LongLong = 0x05,
    Guid = 0x06,
    SmallString = 0x07,
    String = 0x08,
    ULongString = 0x09,
    SmallBytes = 0x0A,
    Bytes = 0x0B,
    ULongBytes = 0x0C,
    Float = 0x0D,
    Double = 0x0E,
    Invalid = 0xFF,
}

impl TokenType {
    /// width of fixed-size values, `None` for length prefixed values
    pub fn fixed_width(self) -> Option<usize> {
        use TokenType::*;
        match self {
            Byte => Some(1),
            UShort => Some(2),
            ULong | Long | Float => Some(4),
            ULongLong | LongLong | Double => Some(8),
            Guid => Some(16),
            SmallString | String | ULongString | SmallBytes | Bytes | ULongBytes | Invalid => None,
        }
    }

    /// width of the length prefix of strings and byte strings, `None` for fixed-size values
    pub fn length_prefix_width(self) -> Option<usize> {
        use TokenType::*;
        match self {
            SmallString | SmallBytes => Some(1),
            String | Bytes => Some(2),
            ULongString | ULongBytes => Some(4),
            _ => None,
        }
    }

    pub fn max_variable_len(self) -> usize {
        match self.length_prefix_width() {
            Some(1) => u8::MAX.safe_cast(),
            Some(2) => u16::MAX.safe_cast(),
            Some(_) => u32::MAX.safe_cast(),
            None => 0,
        }
    }

    fn read_length_prefix(self, buf: &mut &[u8]) -> Result<usize, WireError> {
        let width = self.length_prefix_width().unwrap_or(0);
        ensure_remaining(&*buf, width)?;
        Ok(match width {
            1 => buf.get_u8().safe_cast(),
            2 => buf.get_u16_le().safe_cast(),
            _ => buf.get_u32_le().safe_cast(),
        })
    }

    fn write_length_prefix(self, len: usize, buf: &mut impl BufMut) {
        match self.length_prefix_width() {
            Some(1) => buf.put_u8(len.prechecked_cast()),
            Some(2) => buf.put_u16_le(len.prechecked_cast()),
            _ => buf.put_u32_le(len.prechecked_cast()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Byte(u8),
    UShort(u16),
    ULong(u32),
    Long(i32),
    ULongLong(u64),
    LongLong(i64),
    Guid(Uuid),
    SmallString(String),
    String(String),
    ULongString(String),
    SmallBytes(Bytes),
    Bytes(Bytes),
    ULongBytes(Bytes),
    Float(f32),
    Double(f64),
}

impl TokenValue {
    pub fn token_type(&self) -> TokenType {
        match self {
            TokenValue::Byte(_) => TokenType::Byte,
            TokenValue::UShort(_) => TokenType::UShort,
            TokenValue::ULong(_) => TokenType::ULong,
            TokenValue::Long(_) => TokenType::Long,
            TokenValue::ULongLong(_) => TokenType::ULongLong,
            TokenValue::LongLong(_) => TokenType::LongLong,
            TokenValue::Guid(_) => TokenType::Guid,
            TokenValue::SmallString(_) => TokenType::SmallString,
            TokenValue::String(_) => TokenType::String,
            TokenValue::ULongString(_) => TokenType::ULongString,
            TokenValue::SmallBytes(_) => TokenType::SmallBytes,
            TokenValue::Bytes(_) => TokenType::Bytes,
            TokenValue::ULongBytes(_) => TokenType::ULongBytes,
            TokenValue::Float(_) => TokenType::Float,
            TokenValue::Double(_) => TokenType::Double,
        }
    }

    /// Creates a string value in the length class of the given type. Returns `None` if the type
    ///  is not a string type.
    pub fn string_of_type(token_type: TokenType, s: String) -> Option<TokenValue> {
        match token_type {
            TokenType::SmallString => Some(TokenValue::SmallString(s)),
            TokenType::String => Some(TokenValue::String(s)),
            TokenType::ULongString => Some(TokenValue::ULongString(s)),
            _ => None,
        }
    }

    pub fn bytes_of_type(token_type: TokenType, b: Bytes) -> Option<TokenValue> {
        match token_type {
            TokenType::SmallBytes => Some(TokenValue::SmallBytes(b)),
            TokenType::Bytes => Some(TokenValue::Bytes(b)),
            TokenType::ULongBytes => Some(TokenValue::ULongBytes(b)),
            _ => None,
        }
    }

    fn variable_payload(&self) -> Option<&[u8]> {
        match self {
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => Some(s.as_bytes()),
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => Some(b.as_ref()),
            _ => None,
        }
    }

    /// encoded length of the value, including a length prefix but excluding the token's
    ///  identifier and type
    pub fn encoded_len(&self) -> usize {
        let token_type = self.token_type();
        match (token_type.fixed_width(), self.variable_payload()) {
            (Some(width), _) => width,
            (None, Some(payload)) => token_type.length_prefix_width().unwrap_or(0) + payload.len(),
            (None, None) => 0,
        }
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if let Some(payload) = self.variable_payload() {
            let token_type = self.token_type();
            if payload.len() > token_type.max_variable_len() {
                return Err(WireError::ValueTooLong { token_type, len: payload.len() });
            }
        }
        Ok(())
    }

    /// NB: callers must call [TokenValue::validate] first
    fn encode_unchecked(&self, buf: &mut impl BufMut) {
        match self {
            TokenValue::Byte(v) => buf.put_u8(*v),
            TokenValue::UShort(v) => buf.put_u16_le(*v),
            TokenValue::ULong(v) => buf.put_u32_le(*v),
            TokenValue::Long(v) => buf.put_i32_le(*v),
            TokenValue::ULongLong(v) => buf.put_u64_le(*v),
            TokenValue::LongLong(v) => buf.put_i64_le(*v),
            TokenValue::Guid(v) => buf.put_slice(&v.to_bytes_le()),
            TokenValue::Float(v) => buf.put_f32_le(*v),
            TokenValue::Double(v) => buf.put_f64_le(*v),
            _ => {
                if let Some(payload) = self.variable_payload() {
                    self.token_type().write_length_prefix(payload.len(), buf);
                    buf.put_slice(payload);
                }
            }
        }
    }

    pub fn decode(id: u16, token_type: TokenType, buf: &mut &[u8]) -> Result<TokenValue, WireError> {
        if let Some(width) = token_type.fixed_width() {
            ensure_remaining(&*buf, width)?;
        }

        let value = match token_type {
            TokenType::Byte => TokenValue::Byte(buf.get_u8()),
            TokenType::UShort => TokenValue::UShort(buf.get_u16_le()),
            TokenType::ULong => TokenValue::ULong(buf.get_u32_le()),
            TokenType::Long => TokenValue::Long(buf.get_i32_le()),
            TokenType::ULongLong => TokenValue::ULongLong(buf.get_u64_le()),
            TokenType::LongLong => TokenValue::LongLong(buf.get_i64_le()),
            TokenType::Float => TokenValue::Float(buf.get_f32_le()),
            TokenType::Double => TokenValue::Double(buf.get_f64_le()),
            TokenType::Guid => {
                let mut raw = [0u8; 16];
                buf.copy_to_slice(&mut raw);
                TokenValue::Guid(Uuid::from_bytes_le(raw))
            }
            TokenType::SmallString | TokenType::String | TokenType::ULongString => {
                let payload = read_variable(token_type, buf)?;
                let s = std::str::from_utf8(payload)
                    .map_err(|_| WireError::InvalidUtf8 { id })?;
                TokenValue::string_of_type(token_type, s.to_string())
                    .ok_or(WireError::UnknownTokenType { id, code: token_type.into() })?
            }
            TokenType::SmallBytes | TokenType::Bytes | TokenType::ULongBytes => {
                let payload = read_variable(token_type, buf)?;
                TokenValue::bytes_of_type(token_type, Bytes::copy_from_slice(payload))
                    .ok_or(WireError::UnknownTokenType { id, code: token_type.into() })?
            }
            TokenType::Invalid => return Err(WireError::UnknownTokenType { id, code: token_type.into() }),
        };
        Ok(value)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            TokenValue::Byte(v) => Some(*v as u64),
            TokenValue::UShort(v) => Some(*v as u64),
            TokenValue::ULong(v) => Some(*v as u64),
            TokenValue::ULongLong(v) => Some(*v),
            TokenValue::Long(v) => u64::try_from(*v).ok(),
            TokenValue::LongLong(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TokenValue::Long(v) => Some(*v as i64),
            TokenValue::LongLong(v) => Some(*v),
            TokenValue::ULongLong(v) => i64::try_from(*v).ok(),
            _ => self.as_u64().map(|v| v as i64),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TokenValue::Float(v) => Some(*v as f64),
            TokenValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => Some(b),
            _ => None,
        }
    }
}

impl Display for TokenValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenValue::Byte(v) => write!(f, "{}", v),
            TokenValue::UShort(v) => write!(f, "{}", v),
            TokenValue::ULong(v) => write!(f, "{}", v),
            TokenValue::Long(v) => write!(f, "{}", v),
            TokenValue::ULongLong(v) => write!(f, "{}", v),
            TokenValue::LongLong(v) => write!(f, "{}", v),
            TokenValue::Guid(v) => write!(f, "{}", v),
            TokenValue::Float(v) => write!(f, "{}", v),
            TokenValue::Double(v) => write!(f, "{}", v),
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => f.write_str(s),
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => f.write_str(&to_hex(b)),
        }
    }
}

fn read_variable<'a>(token_type: TokenType, buf: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    let len = token_type.read_length_prefix(buf)?;
    ensure_remaining(&*buf, len)?;
    let (payload, rest) = buf.split_at(len);
    *buf = rest;
    Ok(payload)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: u16,
    pub value: TokenValue,
}

impl Token {
    pub fn new(id: u16, value: TokenValue) -> Token {
        Token { id, value }
    }

    pub fn encoded_len(&self) -> usize {
        TOKEN_PREFIX_LEN + self.value.encoded_len()
    }

    /// Fails without writing anything if the value does not fit the type's length prefix
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<(), WireError> {
        self.value.validate()?;
        buf.put_u16_le(self.id);
        buf.put_u8(self.value.token_type().into());
        self.value.encode_unchecked(buf);
        Ok(())
    }
}

/// A token whose value was located in the metadata, but not decoded yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawToken<'a> {
    pub id: u16,
    pub token_type: TokenType,
    /// the encoded value, including a length prefix for variable length types
    pub encoded_value: &'a [u8],
}

impl<'a> RawToken<'a> {
    pub fn decode(&self) -> Result<TokenValue, WireError> {
        let mut buf = self.encoded_value;
        TokenValue::decode(self.id, self.token_type, &mut buf)
    }
}

/// Scans a metadata section token by token. Values are located based on their type alone, so
///  tokens with unknown identifiers are skipped without being interpreted.
///
/// The iterator stops after the first error.
pub struct TokenReader<'a> {
    buf: &'a [u8],
}

impl<'a> TokenReader<'a> {
    pub fn new(metadata: &'a [u8]) -> TokenReader<'a> {
        TokenReader { buf: metadata }
    }

    fn read_next(&mut self) -> Result<RawToken<'a>, WireError> {
        let mut buf = self.buf;
        ensure_remaining(&buf, TOKEN_PREFIX_LEN)?;
        let id = buf.get_u16_le();
        let code = buf.get_u8();
        let token_type = match TokenType::try_from(code) {
            Ok(TokenType::Invalid) | Err(_) => return Err(WireError::UnknownTokenType { id, code }),
            Ok(t) => t,
        };

        let value_start = buf;
        let value_len = match token_type.fixed_width() {
            Some(width) => width,
            None => {
                let prefix_width = token_type.length_prefix_width().unwrap_or(0);
                prefix_width + token_type.read_length_prefix(&mut buf)?
            }
        };
        ensure_remaining(&value_start, value_len)?;

        let (encoded_value, rest) = value_start.split_at(value_len);
        self.buf = rest;
        Ok(RawToken { id, token_type, encoded_value })
    }
}

impl<'a> Iterator for TokenReader<'a> {
    type Item = Result<RawToken<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        let result = self.read_next();
        if result.is_err() {
            self.buf = &[];
        }
        Some(result)
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut result = String::with_capacity(2 * bytes.len());
    for b in bytes {
        let _ = write!(result, "{:02x}", b);
    }
    result
}
