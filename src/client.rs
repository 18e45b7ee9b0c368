use std::sync::Arc;
use rustc_hash::FxHashSet;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::address::{Endpoint, ReplicaAddress};
use crate::channel::{ChannelFactory, ChannelResources, DefaultChannelFactory};
use crate::config::TransportConfig;
use crate::connection::stats::ConnectionStats;
use crate::connection::tls::TransportSecurity;
use crate::connection::TcpConnector;
use crate::error::TransportError;
use crate::load_balancing::ChannelDictionary;
use crate::system_usage::{SysinfoReader, SystemUsageMonitor};
use crate::util::buffer_pool::BufferPool;
use crate::wire::request::ServiceRequest;
use crate::wire::response::StoreResponse;

/// Entry point for the layers above the transport: submits requests to replicas, and pre-opens
///  connections to replicas that are about to be used.
pub struct TransportClient {
    config: Arc<TransportConfig>,
    connection_stats: Arc<ConnectionStats>,
    channels: ChannelDictionary,
    system_usage: Option<SystemUsageMonitor>,
}

impl TransportClient {
    pub fn new(mut config: TransportConfig, security: TransportSecurity) -> anyhow::Result<TransportClient> {
        config.connection.security = security;
        config.validate()?;

        let connection_stats = Arc::new(ConnectionStats::new());
        let buffer_pool = BufferPool::with_defaults(config.connection.buffer_pool_size);
        let connector = Arc::new(TcpConnector::new(config.connection.clone(), buffer_pool.clone(), connection_stats.clone()));
        let config = Arc::new(config);
        let factory = Arc::new(DefaultChannelFactory::new(ChannelResources {
            config: config.clone(),
            connector,
            buffer_pool,
        }));

        TransportClient::with_channel_factory(config, factory, connection_stats)
    }

    /// A client creating its channels through `factory`. `connection_stats` should be the
    ///  statistics the factory's connections report to.
    pub fn with_channel_factory(config: Arc<TransportConfig>, factory: Arc<dyn ChannelFactory>, connection_stats: Arc<ConnectionStats>) -> anyhow::Result<TransportClient> {
        config.validate()?;

        let system_usage = if config.system_usage_recorders.is_empty() {
            None
        }
        else {
            Some(SystemUsageMonitor::start(&config.system_usage_recorders, Box::new(SysinfoReader::new()), connection_stats.clone())?)
        };

        info!("starting transport client");
        Ok(TransportClient {
            channels: ChannelDictionary::new(factory, config.partition.clone()),
            config,
            connection_stats,
            system_usage,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn connection_stats(&self) -> &ConnectionStats {
        &self.connection_stats
    }

    pub fn system_usage(&self) -> Option<&SystemUsageMonitor> {
        self.system_usage.as_ref()
    }

    pub async fn submit(&self, request: &ServiceRequest, address: &ReplicaAddress, activity_id: Uuid) -> Result<StoreResponse, TransportError> {
        let channel = self.channels.get_or_create(&address.endpoint)
            .map_err(|e| e.with_activity_id(activity_id))?;

        channel.request(request, &address.replica_path, activity_id).await
            .map_err(|e| match e.server {
                Some(_) => e,
                None => e.with_server(&address.endpoint),
            })
    }

    /// Opens connections to the addresses' servers, at most one per partition. Failures are
    ///  logged and do not affect the other servers. Returns the number of servers for which
    ///  connections are open.
    pub async fn pre_open(&self, addresses: &[ReplicaAddress]) -> usize {
        let endpoints = addresses.iter()
            .map(|a| &a.endpoint)
            .collect::<FxHashSet<&Endpoint>>();

        let mut opening = JoinSet::new();
        for endpoint in endpoints {
            match self.channels.get_or_create(endpoint) {
                Ok(channel) => {
                    let endpoint = endpoint.clone();
                    opening.spawn(async move {
                        let result = channel.open_channels().await;
                        (endpoint, result)
                    });
                }
                Err(e) => warn!("not opening connections to {}: {}", endpoint, e),
            }
        }

        let mut num_opened = 0;
        while let Some(result) = opening.join_next().await {
            match result {
                Ok((endpoint, Ok(()))) => {
                    debug!("opened connections to {}", endpoint);
                    num_opened += 1;
                }
                Ok((endpoint, Err(e))) => warn!("failed to open connections to {}: {}", endpoint, e),
                Err(e) => error!("opening connections panicked: {}", e),
            }
        }
        num_opened
    }

    /// Closes all channels and stops system usage sampling. Submitting afterwards fails.
    pub async fn close(&self) {
        info!("closing transport client");
        self.channels.close().await;
        if let Some(monitor) = &self.system_usage {
            monitor.stop().await;
        }
    }
}
