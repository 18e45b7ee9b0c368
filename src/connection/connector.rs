use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::address::Endpoint;
use crate::config::ConnectionConfig;
use crate::connection::socket::LocalPortPool;
use crate::connection::stats::ConnectionStats;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::util::buffer_pool::BufferPool;

/// Establishes connections to servers. Channels open their connection through this seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, TransportError>;
}

/// Connects over TCP, with TLS if configured
pub struct TcpConnector {
    config: ConnectionConfig,
    port_pool: LocalPortPool,
    buffer_pool: Arc<BufferPool>,
    stats: Arc<ConnectionStats>,
}

impl TcpConnector {
    pub fn new(config: ConnectionConfig, buffer_pool: Arc<BufferPool>, stats: Arc<ConnectionStats>) -> TcpConnector {
        let port_pool = LocalPortPool::new(config.max_pooled_ports);
        TcpConnector {
            config,
            port_pool,
            buffer_pool,
            stats,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connection, TransportError> {
        Connection::open(endpoint, &self.config, &self.port_pool, self.buffer_pool.clone(), self.stats.clone()).await
            .inspect_err(|_| self.stats.on_open_failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use crate::config::TransportConfig;
    use crate::error::TransportErrorKind;

    #[tokio::test]
    async fn test_tcp_connector_counts_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stats = Arc::new(ConnectionStats::new());
        let connector = TcpConnector::new(TransportConfig::default().connection, BufferPool::with_defaults(4), stats.clone());

        let connection = connector.connect(&Endpoint::new("127.0.0.1", port)).await.unwrap();
        assert_eq!(stats.open_connections(), 1);
        drop(connection);
        assert_eq!(stats.open_connections(), 0);

        drop(listener);
        let e = connector.connect(&Endpoint::new("127.0.0.1", port)).await.err().unwrap();
        assert_eq!(e.kind, TransportErrorKind::ConnectFailed);
        assert_eq!(stats.failed_total(), 1);
    }
}
