use bytes::{BufMut, BytesMut};
use uuid::Uuid;
use crate::error::NegotiationFailure;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::header_table::{ContextRequestToken, ContextResponseToken};
use crate::wire::resource::{OperationType, ResourceType};
use crate::wire::response::ResponseFrameHeader;
use crate::wire::token::{Token, TokenReader, TokenValue};
use crate::wire::WireError;

pub const PROTOCOL_VERSION: u32 = 1;

/// The first frame on every connection, identifying the client to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    pub client_version: String,
    pub user_agent: String,
}

impl ContextRequest {
    pub fn encode(&self, activity_id: Uuid, buf: &mut BytesMut) -> Result<(), WireError> {
        let tokens = [
            Token::new(ContextRequestToken::ProtocolVersion.id(), TokenValue::ULong(PROTOCOL_VERSION)),
            Token::new(ContextRequestToken::ClientVersion.id(), TokenValue::SmallString(self.client_version.clone())),
            Token::new(ContextRequestToken::UserAgent.id(), TokenValue::SmallString(self.user_agent.clone())),
        ];
        for token in &tokens {
            token.value.validate()?;
        }

        let start = buf.len();
        buf.put_u32_le(0); // patched below
        buf.put_u16_le(ResourceType::Connection.into());
        buf.put_u16_le(OperationType::Connection.into());
        buf.put_slice(&activity_id.to_bytes_le());
        for token in &tokens {
            token.encode(buf)?;
        }

        let total_len: u32 = (buf.len() - start).prechecked_cast();
        buf[start..start + 4].copy_from_slice(&total_len.to_le_bytes());
        Ok(())
    }
}

/// What the server tells about itself in a successful context negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextResponse {
    pub protocol_version: Option<u32>,
    pub client_version: Option<String>,
    pub server_agent: Option<String>,
    pub server_version: Option<String>,
    pub idle_timeout_secs: Option<u32>,
    pub unauthenticated_timeout_secs: Option<u32>,
}

impl ContextResponse {
    pub fn decode(metadata: &[u8]) -> Result<ContextResponse, WireError> {
        let mut result = ContextResponse::default();

        for token in TokenReader::new(metadata) {
            let token = token?;
            let Some(known) = ContextResponseToken::from_id(token.id) else {
                continue;
            };
            let value = token.decode()?;
            let as_u32 = || value.as_u64().and_then(|v| u32::try_from(v).ok());
            let as_string = || value.as_str().map(str::to_string);

            match known {
                ContextResponseToken::ProtocolVersion => result.protocol_version = as_u32(),
                ContextResponseToken::ClientVersion => result.client_version = as_string(),
                ContextResponseToken::ServerAgent => result.server_agent = as_string(),
                ContextResponseToken::ServerVersion => result.server_version = as_string(),
                ContextResponseToken::IdleTimeoutInSeconds => result.idle_timeout_secs = as_u32(),
                ContextResponseToken::UnauthenticatedTimeoutInSeconds => result.unauthenticated_timeout_secs = as_u32(),
            }
        }
        Ok(result)
    }
}

/// Turns a rejected negotiation into the details reported to the caller. The required
///  versions are the ones the server advertises in its response.
pub fn negotiation_failure(header: &ResponseFrameHeader, context: &ContextResponse, body: &[u8]) -> NegotiationFailure {
    NegotiationFailure {
        status: header.status,
        required_client_version: context.client_version.clone(),
        required_protocol_version: context.protocol_version,
        server_agent: context.server_agent.clone(),
        server_message: String::from_utf8_lossy(body).into_owned(),
    }
}
