use std::time::Duration;
use tokio::time::Instant;
use crate::config::ConnectionConfig;

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub receive_delay_limit: Duration,
    pub send_hang_detection_time: Duration,
    pub receive_hang_detection_time: Duration,
    pub transit_timeout_threshold: u32,
}

impl HealthThresholds {
    pub fn new(config: &ConnectionConfig) -> HealthThresholds {
        HealthThresholds {
            receive_delay_limit: config.receive_delay_limit,
            send_hang_detection_time: config.send_hang_detection_time,
            receive_hang_detection_time: config.receive_hang_detection_time,
            transit_timeout_threshold: config.transit_timeout_threshold,
        }
    }
}

/// The times of the last I/O events on a connection. All three start at the time the connection
///  was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimestamps {
    /// a write was started, i.e. the write lock was acquired
    pub last_send_attempt: Instant,
    /// a write completed
    pub last_send: Instant,
    pub last_receive: Instant,
}

impl ConnectionTimestamps {
    pub fn new(now: Instant) -> ConnectionTimestamps {
        ConnectionTimestamps {
            last_send_attempt: now,
            last_send: now,
            last_receive: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// a write was started but has not completed within the send hang window
    SendHang,
    /// data was written, but nothing was received for longer than the receive hang window
    ReceiveHang,
    /// too many calls timed out without the connection showing any receive activity
    TransitTimeouts,
}

impl Liveness {
    pub fn is_healthy(self) -> bool {
        self == Liveness::Healthy
    }
}

/// Evaluates a connection's liveness from its timestamps. Hang detection only applies once
///  nothing was received for longer than the receive delay limit, so a connection that is busy
///  receiving is never considered hung.
pub fn evaluate(timestamps: &ConnectionTimestamps, transit_timeouts: u32, thresholds: &HealthThresholds, now: Instant) -> Liveness {
    let since_last_receive = now.saturating_duration_since(timestamps.last_receive);
    if since_last_receive <= thresholds.receive_delay_limit {
        return Liveness::Healthy;
    }

    if timestamps.last_send_attempt.saturating_duration_since(timestamps.last_send) > thresholds.send_hang_detection_time {
        return Liveness::SendHang;
    }
    if timestamps.last_send.saturating_duration_since(timestamps.last_receive) > thresholds.receive_hang_detection_time {
        return Liveness::ReceiveHang;
    }
    if transit_timeouts >= thresholds.transit_timeout_threshold {
        return Liveness::TransitTimeouts;
    }
    Liveness::Healthy
}

/// Time until the connection counts as idle, i.e. until nothing was received for `idle_timeout`.
///  Returns zero if it is idle already.
pub fn time_to_idle(timestamps: &ConnectionTimestamps, idle_timeout: Duration, now: Instant) -> Duration {
    idle_timeout.saturating_sub(now.saturating_duration_since(timestamps.last_receive))
}
