use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use crate::channel::TransportChannel;

/// The load balancer's view of one channel: the channel plus an admission counter and a
///  cached health flag. The counter tracks calls routed to the channel by the load balancer,
///  which is not necessarily the number of calls in flight on the socket.
///
/// Releasing a slot wakes everybody waiting on `slot_released`, which is shared by all channels
///  of a partition.
pub struct LbChannelState {
    channel: Arc<dyn TransportChannel>,
    requests_pending: AtomicUsize,
    max_requests: usize,
    cached_healthy: AtomicBool,
    slot_released: Arc<Notify>,
}

impl LbChannelState {
    pub fn new(channel: Arc<dyn TransportChannel>, max_requests: usize, slot_released: Arc<Notify>) -> LbChannelState {
        LbChannelState {
            channel,
            requests_pending: AtomicUsize::new(0),
            max_requests,
            cached_healthy: AtomicBool::new(true),
            slot_released,
        }
    }

    pub fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.channel
    }

    pub fn requests_pending(&self) -> usize {
        self.requests_pending.load(Ordering::Acquire)
    }

    pub fn is_cached_healthy(&self) -> bool {
        self.cached_healthy.load(Ordering::Acquire)
    }

    /// Re-evaluates the channel's health, updating the cached flag
    pub fn deep_health_check(&self) -> bool {
        let healthy = self.channel.is_healthy();
        self.cached_healthy.store(healthy, Ordering::Release);
        healthy
    }

    /// Reserves a request slot on this channel, failing if the channel is full
    pub fn try_enter(self: &Arc<Self>) -> Option<ChannelAdmission> {
        self.requests_pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.max_requests).then_some(n + 1))
            .ok()
            .map(|_| ChannelAdmission { state: self.clone() })
    }
}

/// A reserved slot on a channel, released on drop
pub struct ChannelAdmission {
    state: Arc<LbChannelState>,
}

impl ChannelAdmission {
    pub fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.state.channel
    }
}

impl Drop for ChannelAdmission {
    fn drop(&mut self) {
        self.state.requests_pending.fetch_sub(1, Ordering::AcqRel);
        self.state.slot_released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;
    use crate::channel::MockTransportChannel;

    #[test]
    fn test_admission_is_bounded_and_released_on_drop() {
        let state = Arc::new(LbChannelState::new(Arc::new(MockTransportChannel::new()), 2, Arc::new(Notify::new())));

        let a = state.try_enter().unwrap();
        let b = state.try_enter().unwrap();
        assert!(state.try_enter().is_none());
        assert_eq!(state.requests_pending(), 2);

        drop(a);
        assert_eq!(state.requests_pending(), 1);
        let _c = state.try_enter().unwrap();
        drop(b);
        assert_eq!(state.requests_pending(), 1);
    }

    #[test]
    fn test_deep_health_check_updates_cache() {
        let mut channel = MockTransportChannel::new();
        channel.expect_is_healthy()
            .return_const(false);
        let state = LbChannelState::new(Arc::new(channel), 2, Arc::new(Notify::new()));

        assert!(state.is_cached_healthy());
        assert!(!state.deep_health_check());
        assert!(!state.is_cached_healthy());
    }

    #[tokio::test]
    async fn test_release_wakes_waiters() {
        let slot_released = Arc::new(Notify::new());
        let state = Arc::new(LbChannelState::new(Arc::new(MockTransportChannel::new()), 1, slot_released.clone()));
        let slot = state.try_enter().unwrap();

        let mut released = pin!(slot_released.notified());
        released.as_mut().enable();

        drop(slot);
        released.await;
        assert!(state.try_enter().is_some());
    }
}
