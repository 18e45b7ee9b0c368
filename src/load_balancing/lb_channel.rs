use std::hash::{Hash, Hasher};
use std::sync::Arc;
use rustc_hash::FxHasher;
use tracing::debug;
use uuid::Uuid;
use crate::address::Endpoint;
use crate::channel::ChannelFactory;
use crate::config::PartitionConfig;
use crate::error::TransportError;
use crate::load_balancing::partition::LoadBalancingPartition;
use crate::wire::request::ServiceRequest;
use crate::wire::response::StoreResponse;

/// All channels to one server, split into independent partitions. A call goes to the partition
///  selected by hashing its activity id, so that concurrent calls contend on different locks.
pub struct LoadBalancingChannel {
    endpoint: Endpoint,
    partitions: Vec<LoadBalancingPartition>,
}

impl LoadBalancingChannel {
    pub fn new(endpoint: Endpoint, factory: Arc<dyn ChannelFactory>, config: &PartitionConfig) -> LoadBalancingChannel {
        let partitions = (0..config.partition_count.max(1))
            .map(|_| LoadBalancingPartition::from_config(endpoint.clone(), factory.clone(), config))
            .collect();
        LoadBalancingChannel {
            endpoint,
            partitions,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn num_channels(&self) -> usize {
        self.partitions.iter()
            .map(|p| p.num_channels())
            .sum()
    }

    pub fn requests_pending(&self) -> usize {
        self.partitions.iter()
            .map(|p| p.requests_pending())
            .sum()
    }

    fn partition_index(&self, activity_id: Uuid) -> usize {
        if self.partitions.len() == 1 {
            return 0;
        }
        let mut hasher = FxHasher::default();
        activity_id.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    pub async fn request(&self, request: &ServiceRequest, replica_path: &str, activity_id: Uuid) -> Result<StoreResponse, TransportError> {
        self.partitions[self.partition_index(activity_id)]
            .request(request, replica_path, activity_id).await
    }

    /// Opens one channel in every partition
    pub async fn open_channels(&self) -> Result<(), TransportError> {
        for partition in &self.partitions {
            partition.open_channel().await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        debug!("closing all channels to {}", self.endpoint);
        for partition in &self.partitions {
            partition.close().await;
        }
    }
}
