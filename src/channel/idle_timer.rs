use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace};
use crate::channel::Channel;
use crate::dispatcher::Dispatcher;
use crate::error::{TransportError, TransportErrorKind};

/// Closes the channel once its connection has been idle for `idle_timeout` with no calls in
///  flight. The timer reschedules itself from the connection's last receive, so it wakes up at
///  most once per idle period.
pub(super) async fn run_idle_timer(channel: Weak<Channel>, dispatcher: Arc<Dispatcher>, idle_timeout: Duration) {
    debug!("idle timeout is {:?}", idle_timeout);

    loop {
        if !dispatcher.is_accepting() {
            trace!("dispatcher closed, stopping idle timer");
            return;
        }

        let remaining = dispatcher.connection().time_to_idle(idle_timeout);
        if !remaining.is_zero() {
            sleep(remaining).await;
            continue;
        }

        if dispatcher.try_close_if_idle() {
            match channel.upgrade() {
                Some(channel) => channel.close_idle(&dispatcher).await,
                None => dispatcher.close(TransportError::new(TransportErrorKind::ChannelClosed, "closed after being idle")).await,
            }
            return;
        }

        trace!("connection is idle, but {} calls are in flight", dispatcher.num_pending_calls());
        sleep(idle_timeout).await;
    }
}
