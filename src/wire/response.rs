use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use uuid::Uuid;
use crate::config::MIN_HEADER_LEN;
use crate::util::safe_converter::SafeCast;
use crate::wire::header_table::ResponseHeader;
use crate::wire::token::{TokenReader, TokenValue};
use crate::wire::WireError;

/// The fixed part of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrameHeader {
    pub total_length: u32,
    pub status: u32,
    pub activity_id: Uuid,
}

impl ResponseFrameHeader {
    pub fn decode(raw: &[u8; MIN_HEADER_LEN]) -> ResponseFrameHeader {
        let mut buf = &raw[..];
        let total_length = buf.get_u32_le();
        let status = buf.get_u32_le();
        let mut raw_id = [0u8; 16];
        buf.copy_to_slice(&mut raw_id);

        ResponseFrameHeader {
            total_length,
            status,
            activity_id: Uuid::from_bytes_le(raw_id),
        }
    }

    /// checks the total length against the fixed header length and the configured ceiling
    pub fn validate(&self, max_total_length: usize) -> Result<(), WireError> {
        let len: usize = self.total_length.safe_cast();
        if len < MIN_HEADER_LEN || len > max_total_length {
            return Err(WireError::InvalidFrameLength { len, min: MIN_HEADER_LEN, max: max_total_length });
        }
        Ok(())
    }

    /// length of the metadata tokens following the fixed header
    pub fn metadata_len(&self) -> usize {
        let len: usize = self.total_length.safe_cast();
        len.saturating_sub(MIN_HEADER_LEN)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The tokens every response must carry. They are parsed before any other metadata is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MandatoryFields {
    pub payload_present: bool,
    pub transport_request_id: u32,
}

pub fn try_parse_mandatory_fields(metadata: &[u8]) -> Result<MandatoryFields, WireError> {
    let mut payload_present = None;
    let mut transport_request_id = None;

    for token in TokenReader::new(metadata) {
        let token = token?;
        match ResponseHeader::from_id(token.id) {
            Some(ResponseHeader::PayloadPresent) => {
                payload_present = token.decode()?.as_u64().map(|v| v != 0);
            }
            Some(ResponseHeader::TransportRequestId) => {
                transport_request_id = token.decode()?.as_u64().and_then(|v| u32::try_from(v).ok());
            }
            _ => {}
        }
        if payload_present.is_some() && transport_request_id.is_some() {
            break;
        }
    }

    Ok(MandatoryFields {
        payload_present: payload_present.ok_or(WireError::MissingMandatoryToken("PayloadPresent"))?,
        transport_request_id: transport_request_id.ok_or(WireError::MissingMandatoryToken("TransportRequestId"))?,
    })
}

/// Response metadata by token identifier. The transport's own tokens (payload present and
///  transport request id) are not included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseHeaders {
    tokens: FxHashMap<u16, TokenValue>,
}

impl ResponseHeaders {
    pub fn decode(metadata: &[u8]) -> Result<ResponseHeaders, WireError> {
        let mut tokens = FxHashMap::default();
        for token in TokenReader::new(metadata) {
            let token = token?;
            if token.id == ResponseHeader::PayloadPresent.id() || token.id == ResponseHeader::TransportRequestId.id() {
                continue;
            }
            tokens.insert(token.id, token.decode()?);
        }
        Ok(ResponseHeaders { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, header: ResponseHeader) -> Option<&TokenValue> {
        self.tokens.get(&header.id())
    }

    /// access by raw identifier, including identifiers this client does not know about
    pub fn get_raw(&self, id: u16) -> Option<&TokenValue> {
        self.tokens.get(&id)
    }

    pub fn request_charge(&self) -> Option<f64> {
        self.get(ResponseHeader::RequestCharge).and_then(TokenValue::as_f64)
    }

    pub fn lsn(&self) -> Option<i64> {
        self.get(ResponseHeader::Lsn).and_then(TokenValue::as_i64)
    }

    pub fn session_token(&self) -> Option<&str> {
        self.get(ResponseHeader::SessionToken).and_then(TokenValue::as_str)
    }

    pub fn sub_status(&self) -> Option<u32> {
        self.get(ResponseHeader::SubStatus)
            .and_then(TokenValue::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        self.get(ResponseHeader::RetryAfterMilliseconds)
            .and_then(TokenValue::as_u64)
            .map(std::time::Duration::from_millis)
    }

    pub fn continuation(&self) -> Option<&str> {
        self.get(ResponseHeader::ContinuationToken).and_then(TokenValue::as_str)
    }

    /// The headers with a logical name, rendered as strings, sorted by name
    pub fn to_named(&self) -> Vec<(&'static str, String)> {
        let mut result = self.tokens.iter()
            .filter_map(|(id, value)| {
                let name = ResponseHeader::from_id(*id)?.header_name()?;
                Some((name, value.to_string()))
            })
            .collect::<Vec<_>>();
        result.sort();
        result
    }
}

/// A decoded response as handed back to the layers above the transport
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponse {
    pub status: u32,
    pub activity_id: Uuid,
    pub headers: ResponseHeaders,
    pub body: Option<Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use rstest::rstest;
    use crate::wire::token::Token;

    fn encode(tokens: &[Token]) -> BytesMut {
        let mut buf = BytesMut::new();
        for t in tokens {
            t.encode(&mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_decode_header() {
        let activity_id = Uuid::from_u128(0xabcdef);
        let mut raw = BytesMut::new();
        raw.put_u32_le(40);
        raw.put_u32_le(404);
        raw.put_slice(&activity_id.to_bytes_le());

        let header = ResponseFrameHeader::decode(raw.as_ref().try_into().unwrap());
        assert_eq!(header, ResponseFrameHeader { total_length: 40, status: 404, activity_id });
        assert_eq!(header.metadata_len(), 16);
        assert!(!header.is_success());
    }

    #[rstest]
    #[case::below_minimum(10, false)]
    #[case::minimum(24, true)]
    #[case::at_ceiling(1000, true)]
    #[case::above_ceiling(1001, false)]
    fn test_validate_length(#[case] total_length: u32, #[case] valid: bool) {
        let header = ResponseFrameHeader { total_length, status: 200, activity_id: Uuid::nil() };
        assert_eq!(header.validate(1000).is_ok(), valid);
    }

    #[rstest]
    #[case::both(vec![Token::new(0x0000, TokenValue::Byte(1)), Token::new(0x0035, TokenValue::ULong(9))], Ok(MandatoryFields { payload_present: true, transport_request_id: 9 }))]
    #[case::reversed_with_others(vec![Token::new(0x0015, TokenValue::Double(1.0)), Token::new(0x0035, TokenValue::ULong(3)), Token::new(0x0000, TokenValue::Byte(0))], Ok(MandatoryFields { payload_present: false, transport_request_id: 3 }))]
    #[case::missing_request_id(vec![Token::new(0x0000, TokenValue::Byte(1))], Err(WireError::MissingMandatoryToken("TransportRequestId")))]
    #[case::missing_payload_present(vec![Token::new(0x0035, TokenValue::ULong(1))], Err(WireError::MissingMandatoryToken("PayloadPresent")))]
    #[case::empty(vec![], Err(WireError::MissingMandatoryToken("PayloadPresent")))]
    fn test_mandatory_fields(#[case] tokens: Vec<Token>, #[case] expected: Result<MandatoryFields, WireError>) {
        assert_eq!(try_parse_mandatory_fields(&encode(&tokens)), expected);
    }

    #[test]
    fn test_headers_skip_transport_tokens_and_keep_unknown() {
        let metadata = encode(&[
            Token::new(0x0000, TokenValue::Byte(0)),
            Token::new(0x0035, TokenValue::ULong(1)),
            Token::new(0x0015, TokenValue::Double(2.5)),
            Token::new(0x0013, TokenValue::LongLong(77)),
            Token::new(0x003E, TokenValue::String("0:1#77".to_string())),
            Token::new(0x001C, TokenValue::ULong(1002)),
            Token::new(0x000C, TokenValue::ULong(250)),
            Token::new(0x7abc, TokenValue::SmallBytes(Bytes::from_static(b"\x01"))),
        ]);

        let headers = ResponseHeaders::decode(&metadata).unwrap();
        assert_eq!(headers.len(), 6);
        assert_eq!(headers.request_charge(), Some(2.5));
        assert_eq!(headers.lsn(), Some(77));
        assert_eq!(headers.session_token(), Some("0:1#77"));
        assert_eq!(headers.sub_status(), Some(1002));
        assert_eq!(headers.retry_after(), Some(std::time::Duration::from_millis(250)));
        assert_eq!(headers.continuation(), None);
        assert_eq!(headers.get_raw(0x7abc), Some(&TokenValue::SmallBytes(Bytes::from_static(b"\x01"))));

        assert_eq!(headers.to_named(), vec![
            ("lsn", "77".to_string()),
            ("x-ms-request-charge", "2.5".to_string()),
            ("x-ms-retry-after-ms", "250".to_string()),
            ("x-ms-session-token", "0:1#77".to_string()),
            ("x-ms-substatus", "1002".to_string()),
        ]);
    }
}
