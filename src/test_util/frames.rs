use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;
use crate::config::MIN_HEADER_LEN;
use crate::wire::header_table::{RequestHeader, ResponseHeader};
use crate::wire::request::RequestFrameHeader;
use crate::wire::resource::ResourceType;
use crate::wire::token::{Token, TokenReader, TokenValue};

/// A response frame: fixed header and the given tokens, followed by a length prefixed body if
///  `body` is present. No tokens are added.
pub fn encode_frame(status: u32, activity_id: Uuid, tokens: &[Token], body: Option<&[u8]>) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(0);
    buf.put_u32_le(status);
    buf.put_slice(&activity_id.to_bytes_le());
    for token in tokens {
        token.encode(&mut buf).unwrap();
    }
    let total_len = buf.len() as u32;
    buf[..4].copy_from_slice(&total_len.to_le_bytes());

    if let Some(body) = body {
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(body);
    }
    buf
}

/// A regular response frame, including the two tokens every response carries
pub fn encode_response(status: u32, activity_id: Uuid, transport_request_id: u32, tokens: &[Token], body: Option<&[u8]>) -> BytesMut {
    let mut all_tokens = vec![
        Token::new(ResponseHeader::PayloadPresent.id(), TokenValue::Byte(body.is_some().into())),
        Token::new(ResponseHeader::TransportRequestId.id(), TokenValue::ULong(transport_request_id)),
    ];
    all_tokens.extend_from_slice(tokens);
    encode_frame(status, activity_id, &all_tokens, body)
}

/// A request frame as seen by a server
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub header: RequestFrameHeader,
    pub tokens: FxHashMap<u16, TokenValue>,
    pub body: Option<Bytes>,
}

impl ParsedRequest {
    pub fn is_context_request(&self) -> bool {
        self.header.resource_type == u16::from(ResourceType::Connection)
    }

    pub fn transport_request_id(&self) -> Option<u32> {
        self.tokens.get(&RequestHeader::TransportRequestId.id())
            .and_then(TokenValue::as_u64)
            .map(|v| v as u32)
    }
}

/// Reads the next request frame. Returns `None` if the stream ends cleanly before a frame starts.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<ParsedRequest>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let total_len = u32::from_le_bytes(len_buf) as usize;
    assert!(total_len >= MIN_HEADER_LEN, "request frame shorter than its header");

    let mut raw = vec![0u8; total_len];
    raw[..4].copy_from_slice(&len_buf);
    reader.read_exact(&mut raw[4..]).await?;

    let header = RequestFrameHeader::decode(&mut &raw[..]).unwrap();
    let tokens = TokenReader::new(&raw[MIN_HEADER_LEN..])
        .map(|t| {
            let t = t.unwrap();
            (t.id, t.decode().unwrap())
        })
        .collect::<FxHashMap<_, _>>();

    let mut result = ParsedRequest { header, tokens, body: None };
    let payload_present = !result.is_context_request()
        && result.tokens.get(&RequestHeader::PayloadPresent.id()) == Some(&TokenValue::Byte(1));
    if payload_present {
        reader.read_exact(&mut len_buf).await?;
        let mut body = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        reader.read_exact(&mut body).await?;
        result.body = Some(body.into());
    }
    Ok(Some(result))
}
