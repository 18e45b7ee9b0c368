use std::sync::Arc;
use crate::address::Endpoint;
use crate::channel::{Channel, ChannelFactory, TransportChannel};
use crate::config::TransportConfig;
use crate::connection::Connector;
use crate::util::buffer_pool::BufferPool;

/// What all channels of a client share
#[derive(Clone)]
pub struct ChannelResources {
    pub config: Arc<TransportConfig>,
    pub connector: Arc<dyn Connector>,
    pub buffer_pool: Arc<BufferPool>,
}

/// Creates channels that start opening right away
pub struct DefaultChannelFactory {
    resources: ChannelResources,
}

impl DefaultChannelFactory {
    pub fn new(resources: ChannelResources) -> DefaultChannelFactory {
        DefaultChannelFactory { resources }
    }
}

impl ChannelFactory for DefaultChannelFactory {
    fn create_channel(&self, endpoint: &Endpoint) -> Arc<dyn TransportChannel> {
        let channel = Channel::new(endpoint.clone(), self.resources.clone());
        channel.initialize();
        channel
    }
}
