use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};
use crate::address::Endpoint;
use crate::config::ConnectionConfig;
use crate::connection::frame_reader::FrameReader;
use crate::connection::health::{evaluate, time_to_idle, ConnectionTimestamps, HealthThresholds, Liveness};
use crate::connection::socket::{connect, LocalPortPool};
use crate::connection::stats::ConnectionStats;
use crate::connection::tls::{negotiate_tls, TransportSecurity};
use crate::error::{TransportError, TransportErrorKind};
use crate::util::buffer_pool::BufferPool;
use crate::util::safe_converter::PrecheckedCast;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

/// A connection's byte stream: TLS over TCP, plain TCP, or an in-memory pipe
pub type BoxedStream = Box<dyn AsyncStream>;

/// I/O activity of a connection, shared between the writing and the reading side
pub(crate) struct ConnectionActivity {
    timestamps: Mutex<ConnectionTimestamps>,
    transit_timeouts: AtomicU32,
}

impl ConnectionActivity {
    pub(crate) fn new(now: Instant) -> ConnectionActivity {
        ConnectionActivity {
            timestamps: Mutex::new(ConnectionTimestamps::new(now)),
            transit_timeouts: AtomicU32::new(0),
        }
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionTimestamps)) {
        f(&mut self.timestamps.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn record_send_attempt(&self) {
        let now = Instant::now();
        self.update(|t| t.last_send_attempt = now);
    }

    fn record_send(&self) {
        let now = Instant::now();
        self.update(|t| t.last_send = now);
    }

    pub(crate) fn record_receive(&self) {
        let now = Instant::now();
        self.update(|t| t.last_receive = now);
        self.transit_timeouts.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionTimestamps {
        *self.timestamps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One TCP (or TLS) connection to a server. Writes are serialized by a write lock that is
///  separate from any other state, so a slow write does not block health queries. The reading
///  side is handed out once, to the connection's receive loop.
pub struct Connection {
    server: Endpoint,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    reader: Mutex<Option<FrameReader>>,
    activity: Arc<ConnectionActivity>,
    thresholds: HealthThresholds,
    stats: Arc<ConnectionStats>,
}

impl Connection {
    /// Connects, configures the socket, and negotiates TLS if configured
    pub async fn open(
        server: &Endpoint,
        config: &ConnectionConfig,
        port_pool: &LocalPortPool,
        buffer_pool: Arc<BufferPool>,
        stats: Arc<ConnectionStats>,
    ) -> Result<Connection, TransportError> {
        let tcp = connect(server, config, port_pool).await?;

        let stream: BoxedStream = match &config.security {
            TransportSecurity::Plaintext => Box::new(tcp),
            TransportSecurity::Tls(tls_config) => {
                match timeout(config.tls_timeout, negotiate_tls(tcp, server.host(), tls_config.clone())).await {
                    Ok(tls) => Box::new(tls?),
                    Err(_) => return Err(TransportError::new(
                        TransportErrorKind::SslNegotiationTimeout,
                        format!("TLS negotiation took longer than {:?}", config.tls_timeout),
                    )),
                }
            }
        };

        debug!("connected to {}", server);
        Ok(Connection::from_stream(server.clone(), stream, config, buffer_pool, stats))
    }

    pub fn from_stream(
        server: Endpoint,
        stream: BoxedStream,
        config: &ConnectionConfig,
        buffer_pool: Arc<BufferPool>,
        stats: Arc<ConnectionStats>,
    ) -> Connection {
        let (read_half, write_half) = tokio::io::split(stream);
        let activity = Arc::new(ConnectionActivity::new(Instant::now()));
        let reader = FrameReader::new(read_half, activity.clone(), buffer_pool, config);

        stats.on_opened();

        Connection {
            server,
            writer: tokio::sync::Mutex::new(write_half),
            reader: Mutex::new(Some(reader)),
            activity,
            thresholds: HealthThresholds::new(config),
            stats,
        }
    }

    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    /// The reading side of the connection. Returns `None` after the first call.
    pub fn take_reader(&self) -> Option<FrameReader> {
        self.reader.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Writes a frame's header, and the length prefixed body if there is one. Frames are written
    ///  one at a time.
    ///
    /// NB: If the returned future is dropped before completion, a partial frame may have been
    ///  written and the connection must not be used any more.
    pub async fn write_frame(&self, header: &[u8], body: Option<&[u8]>) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        self.activity.record_send_attempt();
        trace!("writing frame of {} bytes to {}", header.len() + body.map_or(0, |b| 4 + b.len()), self.server);

        writer.write_all(header).await?;
        if let Some(body) = body {
            let body_len: u32 = body.len().prechecked_cast();
            writer.write_all(&body_len.to_le_bytes()).await?;
            writer.write_all(body).await?;
        }
        writer.flush().await?;

        self.activity.record_send();
        Ok(())
    }

    pub fn timestamps(&self) -> ConnectionTimestamps {
        self.activity.snapshot()
    }

    /// evaluated on every call, never cached
    pub fn liveness(&self) -> Liveness {
        evaluate(&self.activity.snapshot(), self.activity.transit_timeouts.load(Ordering::Relaxed), &self.thresholds, Instant::now())
    }

    pub fn is_healthy(&self) -> bool {
        self.liveness().is_healthy()
    }

    pub fn time_to_idle(&self, idle_timeout: Duration) -> Duration {
        time_to_idle(&self.activity.snapshot(), idle_timeout, Instant::now())
    }

    /// a call on this connection timed out waiting for its response
    pub fn record_transit_timeout(&self) {
        self.activity.transit_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes the writing side, unless a write is in progress. Dropping the connection closes
    ///  the socket in any case.
    pub async fn shutdown(&self) {
        let Ok(mut writer) = self.writer.try_lock() else {
            debug!("write in progress to {}: not shutting down the stream gracefully", self.server);
            return;
        };
        if let Err(e) = writer.shutdown().await {
            debug!("error shutting down stream to {}: {}", self.server, e);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stats.on_closed();
    }
}
