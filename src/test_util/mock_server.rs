use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use crate::address::{Endpoint, ReplicaAddress};
use crate::config::ConnectionConfig;
use crate::connection::stats::ConnectionStats;
use crate::connection::{Connection, Connector};
use crate::error::TransportError;
use crate::test_util::frames::{encode_frame, encode_response, read_request, ParsedRequest};
use crate::util::buffer_pool::BufferPool;
use crate::wire::header_table::{ContextResponseToken, ResponseHeader};
use crate::wire::token::{Token, TokenValue};

pub const MOCK_SERVER_AGENT: &str = "mock-server/1.0";
pub const REQUIRED_CLIENT_VERSION: &str = "2099-01-01";

/// How the mock server answers requests after a successful context negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// status 200 with the request's activity id and body, and no tokens except the mandatory ones
    Echo,
    /// like `Echo`, with a request charge and a session token
    EchoWithHeaders,
    /// rejects the context negotiation with status 400
    RejectContext,
    /// answers every request with a response header whose length is below the minimum
    MalformedHeader,
    /// reads requests, never answers
    Silent,
    /// reads this many requests without answering, then closes the connection
    CloseAfter(usize),
}

#[derive(Debug, Default)]
pub struct MockServerStats {
    connections: AtomicUsize,
    requests: AtomicUsize,
}

impl MockServerStats {
    pub fn num_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// number of requests received, not counting context negotiation
    pub fn num_requests(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }
}

/// A server on a loopback port, serving every accepted connection with the same behavior
pub struct MockServer {
    addr: SocketAddr,
    stats: Arc<MockServerStats>,
    accept_loop: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(behavior: MockBehavior) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(MockServerStats::default());

        let accept_stats = stats.clone();
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                debug!("mock server: connection from {}", peer);
                tokio::spawn(serve_connection(stream, behavior, accept_stats.clone()));
            }
        });

        MockServer { addr, stats, accept_loop }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn replica_address(&self, replica_path: &str) -> ReplicaAddress {
        ReplicaAddress {
            endpoint: self.endpoint(),
            replica_path: replica_path.to_string(),
        }
    }

    pub fn stats(&self) -> &MockServerStats {
        &self.stats
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// Serves a single connection, starting with the context negotiation
pub async fn serve_connection<S: AsyncRead + AsyncWrite + Unpin>(stream: S, behavior: MockBehavior, stats: Arc<MockServerStats>) {
    stats.connections.fetch_add(1, Ordering::AcqRel);
    let (mut reader, mut writer) = tokio::io::split(stream);

    let Ok(Some(context_request)) = read_request(&mut reader).await else {
        return;
    };
    assert!(context_request.is_context_request());

    if behavior == MockBehavior::RejectContext {
        let frame = encode_frame(400, context_request.header.activity_id, &[
            Token::new(ContextResponseToken::ProtocolVersion.id(), TokenValue::ULong(2)),
            Token::new(ContextResponseToken::ClientVersion.id(), TokenValue::SmallString(REQUIRED_CLIENT_VERSION.to_string())),
            Token::new(ContextResponseToken::ServerAgent.id(), TokenValue::SmallString(MOCK_SERVER_AGENT.to_string())),
        ], Some(&b"client version is not supported"[..]));
        let _ = writer.write_all(&frame).await;
        return;
    }

    let frame = encode_frame(200, context_request.header.activity_id, &[
        Token::new(ContextResponseToken::ProtocolVersion.id(), TokenValue::ULong(1)),
        Token::new(ContextResponseToken::ServerAgent.id(), TokenValue::SmallString(MOCK_SERVER_AGENT.to_string())),
        Token::new(ContextResponseToken::ServerVersion.id(), TokenValue::SmallString("1.0".to_string())),
        Token::new(ContextResponseToken::IdleTimeoutInSeconds.id(), TokenValue::ULong(600)),
    ], None);
    if writer.write_all(&frame).await.is_err() {
        return;
    }

    let mut unanswered = 0;
    while let Ok(Some(request)) = read_request(&mut reader).await {
        stats.requests.fetch_add(1, Ordering::AcqRel);
        trace!("mock server: request {:?}", request.transport_request_id());

        let response = match behavior {
            MockBehavior::Echo => echo(&request, &[]),
            MockBehavior::EchoWithHeaders => echo(&request, &[
                Token::new(ResponseHeader::RequestCharge.id(), TokenValue::Double(1.5)),
                Token::new(ResponseHeader::SessionToken.id(), TokenValue::String("0:1#5".to_string())),
            ]),
            MockBehavior::MalformedHeader => {
                let mut frame = encode_response(200, request.header.activity_id, request.transport_request_id().unwrap_or(0), &[], None);
                frame[..4].copy_from_slice(&10u32.to_le_bytes());
                frame
            }
            MockBehavior::Silent => continue,
            MockBehavior::CloseAfter(n) => {
                unanswered += 1;
                if unanswered >= n {
                    debug!("mock server: closing connection after {} requests", n);
                    return;
                }
                continue;
            }
            MockBehavior::RejectContext => unreachable!(),
        };

        if writer.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn echo(request: &ParsedRequest, tokens: &[Token]) -> bytes::BytesMut {
    encode_response(200, request.header.activity_id, request.transport_request_id().unwrap_or(0), tokens, request.body.as_deref())
}

/// Connects to in-memory mock servers instead of using sockets, e.g. for tests with paused time
pub struct InMemoryConnector {
    behavior: MockBehavior,
    config: ConnectionConfig,
    buffer_pool: Arc<BufferPool>,
    connection_stats: Arc<ConnectionStats>,
    server_stats: Arc<MockServerStats>,
}

impl InMemoryConnector {
    pub fn new(behavior: MockBehavior, config: ConnectionConfig) -> InMemoryConnector {
        InMemoryConnector {
            behavior,
            config,
            buffer_pool: BufferPool::with_defaults(16),
            connection_stats: Arc::new(ConnectionStats::new()),
            server_stats: Arc::new(MockServerStats::default()),
        }
    }

    pub fn server_stats(&self) -> &MockServerStats {
        &self.server_stats
    }

    pub fn connection_stats(&self) -> &ConnectionStats {
        &self.connection_stats
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, TransportError> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(server, self.behavior, self.server_stats.clone()));
        Ok(Connection::from_stream(endpoint.clone(), Box::new(client), &self.config, self.buffer_pool.clone(), self.connection_stats.clone()))
    }
}
