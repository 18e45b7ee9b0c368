use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use anyhow::bail;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use crate::connection::stats::ConnectionStats;
use crate::system_usage::reader::SystemReader;
use crate::system_usage::recorder::{SystemUsageRecorder, SystemUsageRecorderConfig, SystemUsageSample};

/// Samples system load in a single background task and hands the samples to recorders, each at
///  its own refresh interval. The loop wakes up once per poll tick, which is the greatest common
///  divisor of all refresh intervals.
pub struct SystemUsageMonitor {
    recorders: Vec<Arc<SystemUsageRecorder>>,
    poll_tick: Duration,
    sampling_loop: Mutex<Option<JoinHandle<()>>>,
}

impl SystemUsageMonitor {
    pub fn start(configs: &[SystemUsageRecorderConfig], reader: Box<dyn SystemReader>, connection_stats: Arc<ConnectionStats>) -> anyhow::Result<SystemUsageMonitor> {
        if configs.is_empty() {
            bail!("system usage monitor requires at least one recorder");
        }
        for config in configs {
            config.validate()?;
        }

        let recorders = configs.iter()
            .map(|c| Arc::new(SystemUsageRecorder::new(c.clone())))
            .collect::<Vec<_>>();
        let poll_tick = poll_tick(configs);
        info!("starting system usage monitor with a poll tick of {:?}", poll_tick);

        let sampling_loop = tokio::spawn(
            run_sampling_loop(recorders.clone(), poll_tick, reader, connection_stats)
                .instrument(span!(Level::DEBUG, "system_usage"))
        );

        Ok(SystemUsageMonitor {
            recorders,
            poll_tick,
            sampling_loop: Mutex::new(Some(sampling_loop)),
        })
    }

    pub fn poll_tick(&self) -> Duration {
        self.poll_tick
    }

    pub fn recorders(&self) -> &[Arc<SystemUsageRecorder>] {
        &self.recorders
    }

    pub fn recorder(&self, identifier: &str) -> Option<&Arc<SystemUsageRecorder>> {
        self.recorders.iter()
            .find(|r| r.identifier() == identifier)
    }

    pub fn is_running(&self) -> bool {
        self.sampling_loop.lock().unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops sampling and waits for the sampling task to finish
    pub async fn stop(&self) {
        let handle = self.sampling_loop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
            match handle.await {
                Err(e) if e.is_panic() => error!("system usage sampling panicked: {}", e),
                _ => debug!("system usage monitor stopped"),
            }
        }
    }
}

impl Drop for SystemUsageMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.sampling_loop.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

fn gcd(a: u128, b: u128) -> u128 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// The greatest common divisor of all refresh intervals, at millisecond granularity
fn poll_tick(configs: &[SystemUsageRecorderConfig]) -> Duration {
    let millis = configs.iter()
        .map(|c| c.refresh_interval.as_millis().max(1))
        .fold(0, gcd);
    Duration::from_millis(millis.try_into().unwrap_or(u64::MAX))
}

async fn run_sampling_loop(recorders: Vec<Arc<SystemUsageRecorder>>, poll_tick: Duration, mut reader: Box<dyn SystemReader>, connection_stats: Arc<ConnectionStats>) {
    let starvation_threshold = poll_tick.mul_f64(1.5);
    let mut until_next_refresh = vec![Duration::ZERO; recorders.len()];
    let mut prev_time = Instant::now();

    loop {
        let new_time = Instant::now();
        let elapsed = new_time.saturating_duration_since(prev_time);
        prev_time = new_time;

        let thread_starvation = elapsed > starvation_threshold;
        if thread_starvation {
            debug!("sampling woke up {:?} after the previous poll, expected {:?}", elapsed, poll_tick);
        }

        for remaining in until_next_refresh.iter_mut() {
            *remaining = remaining.saturating_sub(elapsed);
        }

        if until_next_refresh.iter().any(|r| r.is_zero()) {
            let snapshot = reader.read();
            let metrics = Handle::current().metrics();
            let sample = SystemUsageSample {
                timestamp: new_time,
                cpu_usage: snapshot.cpu_usage,
                available_memory_mb: snapshot.available_memory_mb,
                open_connections: connection_stats.open_connections(),
                num_workers: metrics.num_workers(),
                num_alive_tasks: metrics.num_alive_tasks(),
                thread_starvation,
            };
            trace!("system usage sample: {:?}", sample);

            for (recorder, remaining) in recorders.iter().zip(until_next_refresh.iter_mut()) {
                if remaining.is_zero() {
                    recorder.record(sample.clone());
                    *remaining = recorder.refresh_interval();
                }
            }
        }

        sleep(poll_tick).await;
    }
}
