use std::str::FromStr;
use std::time::Duration;
use anyhow::bail;
use tracing::warn;
use crate::connection::tls::TransportSecurity;
use crate::system_usage::recorder::SystemUsageRecorderConfig;

pub const MAX_PARTITION_COUNT: usize = 8;

/// Minimum length of any frame header, request or response
pub const MIN_HEADER_LEN: usize = 24;

/// How local ports are chosen for outgoing connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortReuseMode {
    /// let the OS pick an ephemeral port for every connection
    ReuseUnicastPort,
    /// remember local ports that bound successfully and try them again before falling back to an
    ///  ephemeral port, keeping the number of distinct local ports small
    PrivatePortPool,
}

impl FromStr for PortReuseMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ReuseUnicastPort" => Ok(PortReuseMode::ReuseUnicastPort),
            "PrivatePortPool" => Ok(PortReuseMode::PrivatePortPool),
            _ => bail!("unknown port reuse mode {:?}", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connection: ConnectionConfig,
    pub channel: ChannelConfig,
    pub partition: PartitionConfig,
    /// one recorder per entry; no monitor is started if this is empty
    pub system_usage_recorders: Vec<SystemUsageRecorderConfig>,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub security: TransportSecurity,

    pub connect_timeout: Duration,
    pub tls_timeout: Duration,
    pub send_timeout: Duration,

    pub keepalive_time: Duration,
    pub keepalive_interval: Duration,

    pub port_reuse_mode: PortReuseMode,
    /// number of previously used local ports that are tried before binding to an ephemeral port
    pub port_candidate_count: usize,
    pub max_pooled_ports: usize,

    /// Hang detection only kicks in after nothing was received for this long
    pub receive_delay_limit: Duration,
    /// a connection is considered hung if a write was attempted but did not complete for this long
    pub send_hang_detection_time: Duration,
    /// a connection is considered hung if a write completed this long before the last receive
    pub receive_hang_detection_time: Duration,
    /// number of consecutive call timeouts after which a connection is considered unhealthy
    pub transit_timeout_threshold: u32,

    pub max_response_metadata_len: usize,
    pub max_response_body_len: usize,

    pub read_buffer_size: usize,
    pub buffer_pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub client_version: String,
    pub user_agent: String,

    /// timeout for the whole open sequence: connect, TLS and context negotiation
    pub open_timeout: Duration,
    pub request_timeout: Duration,
    /// `None` disables idle detection
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub max_channels_per_endpoint: usize,
    pub max_requests_per_channel: usize,
    pub partition_count: usize,
}

impl PartitionConfig {
    /// channels per partition, i.e. the endpoint's channel budget split evenly across partitions
    pub fn max_channels_per_partition(&self) -> usize {
        (self.max_channels_per_endpoint / self.partition_count).max(1)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connection: ConnectionConfig {
                security: TransportSecurity::Plaintext,
                connect_timeout: Duration::from_secs(5),
                tls_timeout: Duration::from_secs(5),
                send_timeout: Duration::from_secs(10),
                keepalive_time: Duration::from_secs(30),
                keepalive_interval: Duration::from_secs(1),
                port_reuse_mode: PortReuseMode::ReuseUnicastPort,
                port_candidate_count: 5,
                max_pooled_ports: 256,
                receive_delay_limit: Duration::from_secs(20),
                send_hang_detection_time: Duration::from_secs(10),
                receive_hang_detection_time: Duration::from_secs(65),
                transit_timeout_threshold: 3,
                max_response_metadata_len: 2 * 1024 * 1024,
                max_response_body_len: 128 * 1024 * 1024,
                read_buffer_size: 64 * 1024,
                buffer_pool_size: 1024,
            },
            channel: ChannelConfig {
                client_version: "2018-12-31".to_string(),
                user_agent: concat!("direct-transport/", env!("CARGO_PKG_VERSION")).to_string(),
                open_timeout: Duration::from_secs(5),
                request_timeout: Duration::from_secs(10),
                idle_timeout: None,
            },
            partition: PartitionConfig {
                max_channels_per_endpoint: 30,
                max_requests_per_channel: 30,
                partition_count: 1,
            },
            system_usage_recorders: vec![],
        }
    }
}

impl TransportConfig {
    /// The default configuration, with overrides from the process environment
    pub fn from_env() -> TransportConfig {
        let mut result = TransportConfig::default();
        result.apply_overrides(|key| std::env::var(key).ok());
        result
    }

    /// Applies overrides from a key/value source. Malformed values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("ignoring malformed value {:?} for {}", raw, key);
                    None
                }
            }
        }

        if let Some(secs) = parsed(&lookup, "DIRECT_TRANSPORT_KEEPALIVE_TIME_SECS") {
            self.connection.keepalive_time = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&lookup, "DIRECT_TRANSPORT_KEEPALIVE_INTERVAL_SECS") {
            self.connection.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&lookup, "DIRECT_TRANSPORT_REQUEST_TIMEOUT_SECS") {
            self.channel.request_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parsed(&lookup, "DIRECT_TRANSPORT_MAX_CHANNELS_PER_ENDPOINT") {
            self.partition.max_channels_per_endpoint = n;
        }
        if let Some(n) = parsed(&lookup, "DIRECT_TRANSPORT_MAX_REQUESTS_PER_CHANNEL") {
            self.partition.max_requests_per_channel = n;
        }
        if let Some(secs) = parsed::<u64>(&lookup, "DIRECT_TRANSPORT_IDLE_TIMEOUT_SECS") {
            self.channel.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(mode) = parsed(&lookup, "DIRECT_TRANSPORT_PORT_REUSE_MODE") {
            self.connection.port_reuse_mode = mode;
        }
        if let Some(n) = parsed(&lookup, "DIRECT_TRANSPORT_PARTITION_COUNT") {
            self.partition.partition_count = n;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.partition.max_channels_per_endpoint == 0 {
            bail!("max channels per endpoint must be at least 1");
        }
        if self.partition.max_requests_per_channel == 0 {
            bail!("max requests per channel must be at least 1");
        }
        if self.partition.partition_count == 0 || self.partition.partition_count > MAX_PARTITION_COUNT {
            bail!("partition count must be between 1 and {}", MAX_PARTITION_COUNT);
        }
        if self.channel.request_timeout.is_zero() {
            bail!("request timeout must be positive");
        }
        if self.channel.open_timeout.is_zero() || self.connection.connect_timeout.is_zero() {
            bail!("open and connect timeouts must be positive");
        }
        if self.channel.client_version.len() > u8::MAX as usize || self.channel.user_agent.len() > u8::MAX as usize {
            bail!("client version and user agent must fit into a small string token");
        }
        if self.connection.max_response_metadata_len < MIN_HEADER_LEN {
            bail!("max response metadata length must be at least {} bytes", MIN_HEADER_LEN);
        }
        if self.connection.max_response_metadata_len > u32::MAX as usize || self.connection.max_response_body_len > u32::MAX as usize {
            bail!("frame length ceilings must fit into 32 bits");
        }
        for recorder in &self.system_usage_recorders {
            recorder.validate()?;
        }

        Ok(())
    }
}
