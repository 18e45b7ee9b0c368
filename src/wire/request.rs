use std::collections::BTreeMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;
use uuid::Uuid;
use crate::config::MIN_HEADER_LEN;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::header_table::RequestHeader;
use crate::wire::resource::{ConsistencyLevel, IndexingDirective, MigrateCollectionDirective, OperationType, ResourceType};
use crate::wire::token::{Token, TokenType, TokenValue};
use crate::wire::{ensure_remaining, WireError};

/// A logical request as handed to the transport by the layers above it
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    /// logical headers by name, converted to tokens according to their declared token type.
    ///  Names without a token are ignored.
    pub headers: Vec<(String, String)>,
    /// tokens passed through as they are, e.g. binary resource ids
    pub tokens: Vec<Token>,
    pub body: Option<Bytes>,
}

impl ServiceRequest {
    pub fn new(resource_type: ResourceType, operation_type: OperationType) -> ServiceRequest {
        ServiceRequest {
            resource_type,
            operation_type,
            headers: vec![],
            tokens: vec![],
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_token(mut self, header: RequestHeader, value: TokenValue) -> Self {
        self.tokens.push(Token::new(header.id(), value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Writes a request's header and metadata to `buf`, returning the body (if any) that goes after
///  it.
///
/// The transport's own tokens (payload present, replica path and transport request id) take
///  precedence over values for the same identifiers provided by the request.
pub fn encode_request(
    request: &ServiceRequest,
    replica_path: &str,
    activity_id: Uuid,
    transport_request_id: u32,
    buf: &mut BytesMut,
) -> Result<Option<Bytes>, WireError> {
    if let Some(body) = &request.body {
        if body.len() > u32::MAX as usize {
            return Err(WireError::BodyTooLarge { len: body.len(), max: u32::MAX as usize });
        }
    }

    let mut tokens = BTreeMap::new();
    for (name, value) in &request.headers {
        match RequestHeader::from_header_name(name) {
            Some(header) => {
                tokens.insert(header.id(), header_token(header, value)?);
            }
            None => trace!("ignoring request header {:?} without token representation", name),
        }
    }
    for token in &request.tokens {
        if let Some(header) = RequestHeader::from_id(token.id) {
            if header.token_type() != token.value.token_type() {
                return Err(WireError::TokenTypeMismatch {
                    id: token.id,
                    expected: header.token_type(),
                    actual: token.value.token_type(),
                });
            }
        }
        tokens.insert(token.id, token.value.clone());
    }

    tokens.insert(RequestHeader::PayloadPresent.id(), TokenValue::Byte(request.body.is_some().into()));
    tokens.insert(RequestHeader::ReplicaPath.id(), TokenValue::String(replica_path.to_string()));
    tokens.insert(RequestHeader::TransportRequestId.id(), TokenValue::ULong(transport_request_id));

    for value in tokens.values() {
        value.validate()?;
    }

    let start = buf.len();
    buf.put_u32_le(0); // patched below
    buf.put_u16_le(request.resource_type.into());
    buf.put_u16_le(request.operation_type.into());
    buf.put_slice(&activity_id.to_bytes_le());
    for (id, value) in tokens {
        Token::new(id, value).encode(buf)?;
    }

    let total_len = buf.len() - start;
    if total_len > u32::MAX as usize {
        return Err(WireError::InvalidFrameLength { len: total_len, min: MIN_HEADER_LEN, max: u32::MAX as usize });
    }
    let total_len: u32 = total_len.prechecked_cast();
    buf[start..start + 4].copy_from_slice(&total_len.to_le_bytes());

    Ok(request.body.clone())
}

/// Converts a logical header value to a token value of the header's declared type
pub fn header_token(header: RequestHeader, value: &str) -> Result<TokenValue, WireError> {
    let invalid = || WireError::InvalidHeaderValue {
        name: header.header_name().unwrap_or("?").to_string(),
        value: value.to_string(),
    };
    let trimmed = value.trim();

    let result = match header {
        RequestHeader::ConsistencyLevel => TokenValue::Byte(ConsistencyLevel::from_name(trimmed).ok_or_else(invalid)?.into()),
        RequestHeader::IndexingDirective => TokenValue::Byte(IndexingDirective::from_name(trimmed).ok_or_else(invalid)?.into()),
        RequestHeader::MigrateCollectionDirective => TokenValue::Byte(MigrateCollectionDirective::from_name(trimmed).ok_or_else(invalid)?.into()),
        // -1 requests a server-chosen page size
        RequestHeader::PageSize if trimmed == "-1" => TokenValue::ULong(u32::MAX),
        _ => match header.token_type() {
            TokenType::Byte => TokenValue::Byte(parse_bool(trimmed).ok_or_else(invalid)?.into()),
            TokenType::UShort => TokenValue::UShort(trimmed.parse().map_err(|_| invalid())?),
            TokenType::ULong => TokenValue::ULong(trimmed.parse().map_err(|_| invalid())?),
            TokenType::Long => TokenValue::Long(trimmed.parse().map_err(|_| invalid())?),
            TokenType::ULongLong => TokenValue::ULongLong(trimmed.parse().map_err(|_| invalid())?),
            TokenType::LongLong => TokenValue::LongLong(trimmed.parse().map_err(|_| invalid())?),
            TokenType::Float => TokenValue::Float(trimmed.parse().map_err(|_| invalid())?),
            TokenType::Double => TokenValue::Double(trimmed.parse().map_err(|_| invalid())?),
            TokenType::Guid => TokenValue::Guid(Uuid::parse_str(trimmed).map_err(|_| invalid())?),
            t @ (TokenType::SmallString | TokenType::String | TokenType::ULongString) =>
                TokenValue::string_of_type(t, value.to_string()).ok_or_else(invalid)?,
            t @ (TokenType::SmallBytes | TokenType::Bytes | TokenType::ULongBytes) =>
                TokenValue::bytes_of_type(t, Bytes::copy_from_slice(value.as_bytes())).ok_or_else(invalid)?,
            TokenType::Invalid => return Err(invalid()),
        },
    };

    result.validate().map_err(|_| invalid())?;
    Ok(result)
}

fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    }
    else if s.eq_ignore_ascii_case("false") {
        Some(false)
    }
    else {
        None
    }
}

/// The fixed part of a request frame, i.e. what a server reads before the metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrameHeader {
    pub total_length: u32,
    pub resource_type: u16,
    pub operation_type: u16,
    pub activity_id: Uuid,
}

impl RequestFrameHeader {
    pub fn decode(buf: &mut impl Buf) -> Result<RequestFrameHeader, WireError> {
        ensure_remaining(buf, MIN_HEADER_LEN)?;
        let total_length = buf.get_u32_le();
        let resource_type = buf.get_u16_le();
        let operation_type = buf.get_u16_le();
        let mut raw_id = [0u8; 16];
        buf.copy_to_slice(&mut raw_id);

        Ok(RequestFrameHeader {
            total_length,
            resource_type,
            operation_type,
            activity_id: Uuid::from_bytes_le(raw_id),
        })
    }
}
