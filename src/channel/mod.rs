use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use uuid::Uuid;
use crate::address::Endpoint;
use crate::error::TransportError;
use crate::wire::request::ServiceRequest;
use crate::wire::response::StoreResponse;

pub mod channel;
pub mod factory;
mod idle_timer;

pub use channel::{Channel, ChannelState};
pub use factory::{ChannelResources, DefaultChannelFactory};

/// A multiplexed connection to one server, as seen by the load balancing layer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    async fn call(&self, request: &ServiceRequest, replica_path: &str, activity_id: Uuid) -> Result<StoreResponse, TransportError>;

    /// Cheap check, evaluated from the connection's current timestamps. A channel that is still
    ///  opening counts as healthy.
    fn is_healthy(&self) -> bool;

    /// Opens the channel if it is not open yet, and waits for the result
    async fn open(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

#[cfg_attr(test, automock)]
pub trait ChannelFactory: Send + Sync + 'static {
    fn create_channel(&self, endpoint: &Endpoint) -> Arc<dyn TransportChannel>;
}
