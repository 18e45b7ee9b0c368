use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use anyhow::bail;
use tokio::time::Instant;
use crate::util::rolling_window::RollingWindow;

pub const CPU_OVERLOAD_THRESHOLD: f32 = 90.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemUsageRecorderConfig {
    pub identifier: String,
    pub refresh_interval: Duration,
    pub history_len: usize,
}

impl SystemUsageRecorderConfig {
    pub fn new(identifier: impl Into<String>, refresh_interval: Duration, history_len: usize) -> SystemUsageRecorderConfig {
        SystemUsageRecorderConfig {
            identifier: identifier.into(),
            refresh_interval,
            history_len,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identifier.is_empty() {
            bail!("system usage recorder identifier must not be empty");
        }
        if self.refresh_interval < Duration::from_millis(1) {
            bail!("refresh interval of system usage recorder {} must be at least 1ms", self.identifier);
        }
        if self.history_len == 0 {
            bail!("system usage recorder {} must keep at least one sample", self.identifier);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemUsageSample {
    pub timestamp: Instant,
    pub cpu_usage: Option<f32>,
    pub available_memory_mb: Option<u64>,
    pub open_connections: u64,
    pub num_workers: usize,
    pub num_alive_tasks: usize,
    /// the sampling loop woke up noticeably later than scheduled
    pub thread_starvation: bool,
}

/// Keeps the most recent samples at its own cadence, and derives backpressure signals from them
pub struct SystemUsageRecorder {
    config: SystemUsageRecorderConfig,
    history: Mutex<RollingWindow<SystemUsageSample>>,
}

impl SystemUsageRecorder {
    pub fn new(config: SystemUsageRecorderConfig) -> SystemUsageRecorder {
        let history = RollingWindow::new(config.history_len);
        SystemUsageRecorder {
            config,
            history: Mutex::new(history),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub fn refresh_interval(&self) -> Duration {
        self.config.refresh_interval
    }

    pub fn record(&self, sample: SystemUsageSample) {
        self.history().add(sample);
    }

    fn history(&self) -> std::sync::MutexGuard<'_, RollingWindow<SystemUsageSample>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history().is_empty()
    }

    pub fn samples(&self) -> Vec<SystemUsageSample> {
        self.history().iter().cloned().collect()
    }

    pub fn last_sample(&self) -> Option<SystemUsageSample> {
        self.history().last().cloned()
    }

    /// true if any sample in the history has CPU usage above 90%
    pub fn is_cpu_overloaded(&self) -> bool {
        self.history().iter()
            .filter_map(|s| s.cpu_usage)
            .any(|cpu| cpu > CPU_OVERLOAD_THRESHOLD)
    }

    /// true if sampling itself was delayed for any sample in the history
    pub fn is_thread_starving(&self) -> bool {
        self.history().iter()
            .any(|s| s.thread_starvation)
    }

    pub fn mean_cpu(&self) -> Option<f32> {
        let history = self.history();
        let (sum, count) = history.iter()
            .filter_map(|s| s.cpu_usage)
            .fold((0.0f32, 0usize), |(sum, count), cpu| (sum + cpu, count + 1));
        (count > 0).then(|| sum / count as f32)
    }
}
