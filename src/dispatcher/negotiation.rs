use bytes::BytesMut;
use tracing::{debug, warn};
use uuid::Uuid;
use crate::connection::frame_reader::{FrameReader, ReadError};
use crate::connection::Connection;
use crate::error::{TransportError, TransportErrorKind};
use crate::wire::context::{negotiation_failure, ContextRequest, ContextResponse};

fn negotiation_error(detail: impl Into<String>) -> TransportError {
    TransportError::new(TransportErrorKind::TransportNegotiationFailed, detail)
}

fn read_error(e: ReadError) -> TransportError {
    negotiation_error(format!("reading the context response: {}", e))
}

/// Performs the context negotiation, which must be the first exchange on a new connection. A
///  response with a non-success status is a `TransportNegotiationFailed` error carrying the
///  server's requirements.
pub async fn negotiate_context(
    connection: &Connection,
    reader: &mut FrameReader,
    request: &ContextRequest,
    activity_id: Uuid,
) -> Result<ContextResponse, TransportError> {
    let mut buf = BytesMut::new();
    request.encode(activity_id, &mut buf)
        .map_err(|e| negotiation_error(format!("encoding the context request: {}", e)))?;

    connection.write_frame(&buf, None).await
        .map_err(|e| negotiation_error(format!("sending the context request: {}", e)))?;

    let header = reader.read_header().await.map_err(read_error)?;
    let metadata = reader.read_metadata(&header).await.map_err(read_error)?;
    let context = ContextResponse::decode(&metadata)
        .map_err(|e| negotiation_error(format!("decoding the context response: {}", e)))?;

    if !header.is_success() {
        let body = reader.read_body().await.map_err(read_error)?;
        let failure = negotiation_failure(&header, &context, &body);
        warn!("{} rejected the context negotiation with status {}: {}", connection.server(), failure.status, failure.server_message);

        return Err(negotiation_error(format!("status {}: {}", failure.status, failure.server_message))
            .with_negotiation(failure));
    }

    debug!("negotiated context with {}: server agent {:?}, version {:?}", connection.server(), context.server_agent, context.server_version);
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::duplex;
    use crate::address::Endpoint;
    use crate::config::TransportConfig;
    use crate::connection::stats::ConnectionStats;
    use crate::test_util::mock_server::{serve_connection, MockBehavior, MockServerStats, MOCK_SERVER_AGENT, REQUIRED_CLIENT_VERSION};
    use crate::util::buffer_pool::BufferPool;

    fn context_request() -> ContextRequest {
        ContextRequest {
            client_version: "2018-12-31".to_string(),
            user_agent: "test".to_string(),
        }
    }

    fn connection_to(behavior: MockBehavior) -> Connection {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(serve_connection(server, behavior, Arc::new(MockServerStats::default())));
        Connection::from_stream(Endpoint::new("mock", 1), Box::new(client), &TransportConfig::default().connection, BufferPool::with_defaults(4), Arc::new(ConnectionStats::new()))
    }

    #[tokio::test]
    async fn test_successful_negotiation() {
        let connection = connection_to(MockBehavior::Echo);
        let mut reader = connection.take_reader().unwrap();

        let context = negotiate_context(&connection, &mut reader, &context_request(), Uuid::new_v4()).await.unwrap();
        assert_eq!(context.server_agent.as_deref(), Some(MOCK_SERVER_AGENT));
        assert_eq!(context.idle_timeout_secs, Some(600));
    }

    #[tokio::test]
    async fn test_rejected_negotiation() {
        let connection = connection_to(MockBehavior::RejectContext);
        let mut reader = connection.take_reader().unwrap();

        let error = negotiate_context(&connection, &mut reader, &context_request(), Uuid::new_v4()).await.unwrap_err();
        assert_eq!(error.kind, TransportErrorKind::TransportNegotiationFailed);

        let failure = error.negotiation.unwrap();
        assert_eq!(failure.status, 400);
        assert_eq!(failure.required_client_version.as_deref(), Some(REQUIRED_CLIENT_VERSION));
        assert_eq!(failure.required_protocol_version, Some(2));
        assert_eq!(failure.server_message, "client version is not supported");
    }
}
