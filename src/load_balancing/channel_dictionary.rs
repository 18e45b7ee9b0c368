use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::address::Endpoint;
use crate::channel::ChannelFactory;
use crate::config::PartitionConfig;
use crate::error::{TransportError, TransportErrorKind};
use crate::load_balancing::lb_channel::LoadBalancingChannel;

/// One [LoadBalancingChannel] per server endpoint, created on first use
pub struct ChannelDictionary {
    factory: Arc<dyn ChannelFactory>,
    config: PartitionConfig,
    channels: RwLock<FxHashMap<Endpoint, Arc<LoadBalancingChannel>>>,
    closed: AtomicBool,
}

impl ChannelDictionary {
    pub fn new(factory: Arc<dyn ChannelFactory>, config: PartitionConfig) -> ChannelDictionary {
        ChannelDictionary {
            factory,
            config,
            channels: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_or_create(&self, endpoint: &Endpoint) -> Result<Arc<LoadBalancingChannel>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::new(TransportErrorKind::ChannelClosed, "transport client is closed").with_server(endpoint));
        }

        if let Some(channel) = self.channels.read().unwrap_or_else(PoisonError::into_inner).get(endpoint) {
            return Ok(channel.clone());
        }

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let channel = channels.entry(endpoint.clone())
            .or_insert_with(|| {
                debug!("creating load balancing channel for {}", endpoint);
                Arc::new(LoadBalancingChannel::new(endpoint.clone(), self.factory.clone(), &self.config))
            });
        Ok(channel.clone())
    }

    /// Closes and forgets all channels; later lookups fail
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let channels = std::mem::take(&mut *self.channels.write().unwrap_or_else(PoisonError::into_inner));
        for channel in channels.into_values() {
            channel.close().await;
        }
    }
}
