use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use crate::address::Endpoint;
use crate::channel::ChannelFactory;
use crate::config::PartitionConfig;
use crate::error::{TransportError, TransportErrorKind};
use crate::load_balancing::lb_channel_state::{ChannelAdmission, LbChannelState};
use crate::wire::request::ServiceRequest;
use crate::wire::response::StoreResponse;

/// A growable pool of channels to one server.
///
/// Every call is admitted against a hard ceiling of `max_channels * max_requests_per_channel`
///  pending calls; calls beyond that fail right away with [TransportErrorKind::ChannelFull].
///  Below the ceiling, the pool grows until its capacity covers the pending calls. Calls are
///  spread across channels by a sequence number modulo the number of healthy channels, which
///  does not take the channels' actual load into account. If the chosen channel is full, the
///  call goes to the next one with a free slot.
pub struct LoadBalancingPartition {
    endpoint: Endpoint,
    factory: Arc<dyn ChannelFactory>,
    max_channels: usize,
    max_requests_per_channel: usize,
    requests_pending: AtomicUsize,
    sequence: AtomicUsize,
    /// `closed` only changes while this lock is held for writing
    channels: RwLock<Vec<Arc<LbChannelState>>>,
    closed: AtomicBool,
    /// notified when a slot is released, the pool changes, or the partition is closed
    slot_released: Arc<Notify>,
}

impl LoadBalancingPartition {
    pub fn new(endpoint: Endpoint, factory: Arc<dyn ChannelFactory>, max_channels: usize, max_requests_per_channel: usize) -> LoadBalancingPartition {
        LoadBalancingPartition {
            endpoint,
            factory,
            max_channels,
            max_requests_per_channel,
            requests_pending: AtomicUsize::new(0),
            sequence: AtomicUsize::new(0),
            channels: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            slot_released: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(endpoint: Endpoint, factory: Arc<dyn ChannelFactory>, config: &PartitionConfig) -> LoadBalancingPartition {
        LoadBalancingPartition::new(endpoint, factory, config.max_channels_per_partition(), config.max_requests_per_channel)
    }

    pub fn max_capacity(&self) -> usize {
        self.max_channels * self.max_requests_per_channel
    }

    pub fn capacity(&self) -> usize {
        self.num_channels() * self.max_requests_per_channel
    }

    pub fn num_channels(&self) -> usize {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn requests_pending(&self) -> usize {
        self.requests_pending.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn closed_error(&self, activity_id: Uuid) -> TransportError {
        TransportError::new(TransportErrorKind::ChannelClosed, "load balancing channel is closed")
            .with_server(&self.endpoint)
            .with_activity_id(activity_id)
    }

    fn new_channel_state(&self) -> Arc<LbChannelState> {
        let channel = self.factory.create_channel(&self.endpoint);
        Arc::new(LbChannelState::new(channel, self.max_requests_per_channel, self.slot_released.clone()))
    }

    pub async fn request(&self, request: &ServiceRequest, replica_path: &str, activity_id: Uuid) -> Result<StoreResponse, TransportError> {
        let _admission = self.admit(activity_id)?;
        let slot = self.route(activity_id).await?;
        slot.channel().call(request, replica_path, activity_id).await
    }

    fn admit(&self, activity_id: Uuid) -> Result<PartitionAdmission<'_>, TransportError> {
        if self.is_closed() {
            return Err(self.closed_error(activity_id));
        }

        let admission = PartitionAdmission { requests_pending: &self.requests_pending };
        let pending = self.requests_pending.fetch_add(1, Ordering::AcqRel) + 1;
        if pending > self.max_capacity() {
            trace!("rejecting call: {} pending calls exceed the capacity of {}", pending, self.max_capacity());
            return Err(TransportError::new(TransportErrorKind::ChannelFull, "too many requests, all connections are saturated")
                .with_server(&self.endpoint)
                .with_activity_id(activity_id));
        }
        Ok(admission)
    }

    /// Reserves a slot on a healthy channel, growing the pool and evicting unhealthy channels
    ///  along the way. Fails if the partition is closed.
    async fn route(&self, activity_id: Uuid) -> Result<ChannelAdmission, TransportError> {
        loop {
            // registered before looking at the channels, so no release in between is missed
            let mut slot_released = pin!(self.slot_released.notified());
            slot_released.as_mut().enable();

            self.ensure_capacity(activity_id)?;

            let (candidates, mut unhealthy) = self.candidates();
            let mut admitted = None;
            for candidate in candidates {
                if !candidate.deep_health_check() {
                    unhealthy.push(candidate);
                    continue;
                }
                if let Some(slot) = candidate.try_enter() {
                    admitted = Some(slot);
                    break;
                }
            }

            let evicted = !unhealthy.is_empty();
            for state in &unhealthy {
                self.evict(state).await;
            }

            if let Some(slot) = admitted {
                return Ok(slot);
            }
            if !evicted {
                // NB: admission guarantees enough slots in total, so the pool is about to grow or
                //  another call is about to finish
                trace!("all channels to {} are full, waiting for a free slot", self.endpoint);
                slot_released.await;
            }
        }
    }

    /// The healthy channels in routing order, starting at the next sequence number, and the
    ///  channels already known to be unhealthy
    fn candidates(&self) -> (Vec<Arc<LbChannelState>>, Vec<Arc<LbChannelState>>) {
        let (mut healthy, unhealthy): (Vec<_>, Vec<_>) = self.channels.read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .partition(|c| c.is_cached_healthy());

        if !healthy.is_empty() {
            let start = self.sequence.fetch_add(1, Ordering::Relaxed) % healthy.len();
            healthy.rotate_left(start);
        }
        (healthy, unhealthy)
    }

    /// Opens channels until the pool's capacity covers the pending calls
    fn ensure_capacity(&self, activity_id: Uuid) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(self.closed_error(activity_id));
        }

        let needed = self.requests_pending()
            .div_ceil(self.max_requests_per_channel)
            .clamp(1, self.max_channels);
        if self.num_channels() >= needed {
            return Ok(());
        }

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(self.closed_error(activity_id));
        }
        let num_before = channels.len();
        while channels.len() < needed {
            channels.push(self.new_channel_state());
        }
        drop(channels);

        if num_before < needed {
            debug!("grew pool for {} to {} channels", self.endpoint, needed);
            self.slot_released.notify_waiters();
        }
        Ok(())
    }

    async fn evict(&self, state: &Arc<LbChannelState>) {
        let removed = {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            match channels.iter().position(|c| Arc::ptr_eq(c, state)) {
                Some(idx) => {
                    channels.swap_remove(idx);
                    true
                }
                None => false,
            }
        };

        if removed {
            debug!("evicting unhealthy channel to {}", self.endpoint);
            self.slot_released.notify_waiters();
            state.channel().close().await;
        }
    }

    /// Makes sure the pool has at least one channel, and waits for it to be open
    pub async fn open_channel(&self) -> Result<(), TransportError> {
        let state = {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                return Err(self.closed_error(Uuid::nil()));
            }
            match channels.first() {
                Some(existing) => existing.clone(),
                None => {
                    let state = self.new_channel_state();
                    channels.push(state.clone());
                    state
                }
            }
        };
        state.channel().open().await
    }

    /// Closes all channels. Failures are logged and otherwise ignored. Calls that were admitted
    ///  before do not open new channels afterwards.
    pub async fn close(&self) {
        let channels = {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *channels)
        };
        self.slot_released.notify_waiters();

        let mut closing = JoinSet::new();
        for state in channels {
            let channel = state.channel().clone();
            closing.spawn(async move { channel.close().await });
        }
        while let Some(result) = closing.join_next().await {
            if let Err(e) = result {
                warn!("error closing channel to {}: {}", self.endpoint, e);
            }
        }
    }
}

struct PartitionAdmission<'a> {
    requests_pending: &'a AtomicUsize,
}

impl Drop for PartitionAdmission<'_> {
    fn drop(&mut self) {
        self.requests_pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::Sequence;
    use rstest::rstest;
    use tokio::sync::watch;
    use tokio::task::yield_now;
    use crate::channel::{MockChannelFactory, MockTransportChannel, TransportChannel};
    use crate::wire::resource::{OperationType, ResourceType};
    use crate::wire::response::ResponseHeaders;

    fn ok_response(activity_id: Uuid) -> StoreResponse {
        StoreResponse { status: 200, activity_id, headers: ResponseHeaders::default(), body: None }
    }

    fn request() -> ServiceRequest {
        ServiceRequest::new(ResourceType::Document, OperationType::Read)
    }

    /// Holds every call until the gate opens
    struct GatedChannel {
        gate: watch::Receiver<bool>,
        entered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportChannel for GatedChannel {
        async fn call(&self, _request: &ServiceRequest, _replica_path: &str, activity_id: Uuid) -> Result<StoreResponse, TransportError> {
            self.entered.fetch_add(1, Ordering::AcqRel);
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
            Ok(ok_response(activity_id))
        }

        fn is_healthy(&self) -> bool {
            true
        }

        async fn open(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn gated_factory(gate: watch::Receiver<bool>, entered: Arc<AtomicUsize>) -> MockChannelFactory {
        let mut factory = MockChannelFactory::new();
        factory.expect_create_channel()
            .returning(move |_| Arc::new(GatedChannel { gate: gate.clone(), entered: entered.clone() }) as Arc<dyn TransportChannel>);
        factory
    }

    #[rstest]
    #[case::single_channel(1, 4)]
    #[case::several_channels(3, 2)]
    #[tokio::test]
    async fn test_admission_ceiling(#[case] max_channels: usize, #[case] max_requests_per_channel: usize) {
        let (open_gate, gate) = watch::channel(false);
        let entered = Arc::new(AtomicUsize::new(0));
        let partition = Arc::new(LoadBalancingPartition::new(
            Endpoint::new("db1", 1),
            Arc::new(gated_factory(gate, entered.clone())),
            max_channels,
            max_requests_per_channel,
        ));
        let max_capacity = partition.max_capacity();

        let mut calls = JoinSet::new();
        for _ in 0..=max_capacity {
            let partition = partition.clone();
            calls.spawn(async move { partition.request(&request(), "/r/", Uuid::new_v4()).await });
        }

        let rejected = calls.join_next().await.unwrap().unwrap().unwrap_err();
        assert_eq!(rejected.kind, TransportErrorKind::ChannelFull);
        assert_eq!(rejected.status_code(), 429);

        while entered.load(Ordering::Acquire) < max_capacity {
            yield_now().await;
        }
        assert_eq!(partition.requests_pending(), max_capacity);
        assert_eq!(partition.num_channels(), max_channels);

        open_gate.send(true).unwrap();
        let mut num_ok = 0;
        while let Some(result) = calls.join_next().await {
            result.unwrap().unwrap();
            num_ok += 1;
        }
        assert_eq!(num_ok, max_capacity);
        assert_eq!(partition.requests_pending(), 0);
    }

    #[tokio::test]
    async fn test_pool_grows_with_demand() {
        let (open_gate, gate) = watch::channel(false);
        let entered = Arc::new(AtomicUsize::new(0));
        let partition = Arc::new(LoadBalancingPartition::new(
            Endpoint::new("db1", 1),
            Arc::new(gated_factory(gate, entered.clone())),
            10,
            2,
        ));

        let mut calls = JoinSet::new();
        for _ in 0..5 {
            let partition = partition.clone();
            calls.spawn(async move { partition.request(&request(), "/r/", Uuid::new_v4()).await });
        }
        while entered.load(Ordering::Acquire) < 5 {
            yield_now().await;
        }
        assert_eq!(partition.num_channels(), 3);
        assert_eq!(partition.capacity(), 6);

        open_gate.send(true).unwrap();
        while let Some(result) = calls.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(partition.num_channels(), 3);
    }

    #[tokio::test]
    async fn test_unhealthy_channel_is_evicted() {
        let mut unhealthy = MockTransportChannel::new();
        unhealthy.expect_is_healthy()
            .return_const(false);
        unhealthy.expect_call()
            .never();
        unhealthy.expect_close()
            .once()
            .return_const(());

        let mut healthy = MockTransportChannel::new();
        healthy.expect_is_healthy()
            .return_const(true);
        healthy.expect_call()
            .once()
            .returning(|_, _, activity_id| Ok(ok_response(activity_id)));

        let mut seq = Sequence::new();
        let mut factory = MockChannelFactory::new();
        let unhealthy: Arc<dyn TransportChannel> = Arc::new(unhealthy);
        let healthy: Arc<dyn TransportChannel> = Arc::new(healthy);
        factory.expect_create_channel()
            .once()
            .in_sequence(&mut seq)
            .return_once(move |_| unhealthy);
        factory.expect_create_channel()
            .once()
            .in_sequence(&mut seq)
            .return_once(move |_| healthy);

        let partition = LoadBalancingPartition::new(Endpoint::new("db1", 1), Arc::new(factory), 2, 5);
        let response = partition.request(&request(), "/r/", Uuid::from_u128(4)).await.unwrap();
        assert_eq!(response.activity_id, Uuid::from_u128(4));
        assert_eq!(partition.num_channels(), 1);
    }

    #[tokio::test]
    async fn test_open_channel_reuses_existing_channel() {
        let mut channel = MockTransportChannel::new();
        channel.expect_open()
            .times(2)
            .returning(|| Ok(()));
        let channel: Arc<dyn TransportChannel> = Arc::new(channel);

        let mut factory = MockChannelFactory::new();
        factory.expect_create_channel()
            .once()
            .return_once(move |_| channel);

        let partition = LoadBalancingPartition::new(Endpoint::new("db1", 1), Arc::new(factory), 2, 5);
        partition.open_channel().await.unwrap();
        partition.open_channel().await.unwrap();
        assert_eq!(partition.num_channels(), 1);
    }

    struct PanickingChannel;

    #[async_trait]
    impl TransportChannel for PanickingChannel {
        async fn call(&self, _request: &ServiceRequest, _replica_path: &str, _activity_id: Uuid) -> Result<StoreResponse, TransportError> {
            unimplemented!()
        }

        fn is_healthy(&self) -> bool {
            true
        }

        async fn open(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) {
            panic!("close failed");
        }
    }

    #[tokio::test]
    async fn test_close_swallows_failures() {
        let mut regular = MockTransportChannel::new();
        regular.expect_close()
            .once()
            .return_const(());
        let regular: Arc<dyn TransportChannel> = Arc::new(regular);

        let mut seq = Sequence::new();
        let mut factory = MockChannelFactory::new();
        factory.expect_create_channel()
            .once()
            .in_sequence(&mut seq)
            .return_once(|_| Arc::new(PanickingChannel) as Arc<dyn TransportChannel>);
        factory.expect_create_channel()
            .once()
            .in_sequence(&mut seq)
            .return_once(move |_| regular);

        let partition = LoadBalancingPartition::new(Endpoint::new("db1", 1), Arc::new(factory), 2, 1);
        partition.open_channel().await.unwrap();
        partition.channels.write().unwrap()
            .push(partition.new_channel_state());
        assert_eq!(partition.num_channels(), 2);

        partition.close().await;
        assert_eq!(partition.num_channels(), 0);

        let e = partition.request(&request(), "/r/", Uuid::nil()).await.unwrap_err();
        assert_eq!(e.kind, TransportErrorKind::ChannelClosed);
    }

    fn healthy_factory(num_channels: usize) -> MockChannelFactory {
        let mut factory = MockChannelFactory::new();
        factory.expect_create_channel()
            .times(num_channels)
            .returning(|_| {
                let mut channel = MockTransportChannel::new();
                channel.expect_is_healthy()
                    .return_const(true);
                Arc::new(channel) as Arc<dyn TransportChannel>
            });
        factory
    }

    #[tokio::test]
    async fn test_full_channel_is_skipped() {
        let partition = LoadBalancingPartition::new(Endpoint::new("db1", 1), Arc::new(healthy_factory(2)), 2, 1);
        let first = partition.new_channel_state();
        let second = partition.new_channel_state();
        partition.channels.write().unwrap().extend([first.clone(), second.clone()]);

        let _busy = first.try_enter().unwrap();
        partition.sequence.store(0, Ordering::Relaxed);

        let _admission = partition.admit(Uuid::nil()).unwrap();
        let _slot = partition.route(Uuid::nil()).await.unwrap();
        assert_eq!(first.requests_pending(), 1);
        assert_eq!(second.requests_pending(), 1);
        assert_eq!(partition.num_channels(), 2);
    }

    #[tokio::test]
    async fn test_routing_waits_for_a_released_slot() {
        let partition = Arc::new(LoadBalancingPartition::new(Endpoint::new("db1", 1), Arc::new(healthy_factory(1)), 1, 1));
        let state = partition.new_channel_state();
        partition.channels.write().unwrap().push(state.clone());
        let busy = state.try_enter().unwrap();

        let routing = {
            let partition = partition.clone();
            tokio::spawn(async move {
                let _admission = partition.admit(Uuid::nil())?;
                partition.route(Uuid::nil()).await.map(|_| ())
            })
        };
        for _ in 0..10 {
            yield_now().await;
        }
        assert!(!routing.is_finished());

        drop(busy);
        routing.await.unwrap().unwrap();
        assert_eq!(state.requests_pending(), 0);
    }

    #[tokio::test]
    async fn test_call_admitted_before_close_does_not_open_channels() {
        let mut factory = MockChannelFactory::new();
        factory.expect_create_channel()
            .never();
        let partition = LoadBalancingPartition::new(Endpoint::new("db1", 1), Arc::new(factory), 2, 5);

        let admission = partition.admit(Uuid::from_u128(7)).unwrap();
        partition.close().await;

        let e = partition.route(Uuid::from_u128(7)).await.err().unwrap();
        assert_eq!(e.kind, TransportErrorKind::ChannelClosed);
        assert_eq!(e.activity_id, Some(Uuid::from_u128(7)));
        assert_eq!(partition.open_channel().await.unwrap_err().kind, TransportErrorKind::ChannelClosed);
        assert_eq!(partition.num_channels(), 0);

        drop(admission);
        assert_eq!(partition.requests_pending(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_calls_waiting_for_a_slot() {
        let partition = Arc::new(LoadBalancingPartition::new(Endpoint::new("db1", 1), Arc::new(healthy_factory(1)), 1, 1));
        let state = partition.new_channel_state();
        partition.channels.write().unwrap().push(state.clone());
        let _busy = state.try_enter().unwrap();

        let routing = {
            let partition = partition.clone();
            tokio::spawn(async move {
                let _admission = partition.admit(Uuid::nil())?;
                partition.route(Uuid::nil()).await.map(|_| ())
            })
        };
        for _ in 0..10 {
            yield_now().await;
        }

        partition.channels.write().unwrap().clear();
        partition.close().await;
        assert_eq!(routing.await.unwrap().unwrap_err().kind, TransportErrorKind::ChannelClosed);
    }
}
