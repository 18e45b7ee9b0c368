#[cfg(test)] use mockall::automock;
use sysinfo::System;
use tracing::debug;

/// One reading of the machine's load
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSnapshot {
    /// in percent, averaged over all cores, since the previous reading
    pub cpu_usage: Option<f32>,
    pub available_memory_mb: Option<u64>,
}

/// Source of CPU and memory readings. CPU usage is a delta between consecutive reads, so the
///  reader is stateful.
#[cfg_attr(test, automock)]
pub trait SystemReader: Send + 'static {
    fn read(&mut self) -> SystemSnapshot;
}

/// Reads CPU and memory through `sysinfo`
pub struct SysinfoReader {
    system: System,
    primed: bool,
}

impl SysinfoReader {
    pub fn new() -> SysinfoReader {
        SysinfoReader {
            system: System::new(),
            primed: false,
        }
    }
}

impl Default for SysinfoReader {
    fn default() -> Self {
        SysinfoReader::new()
    }
}

impl SystemReader for SysinfoReader {
    fn read(&mut self) -> SystemSnapshot {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return SystemSnapshot::default();
        }

        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        // the first refresh only establishes the baseline for the delta
        let cpu_usage = if self.primed {
            Some(self.system.global_cpu_usage())
        }
        else {
            debug!("first CPU reading, no usage available yet");
            self.primed = true;
            None
        };

        SystemSnapshot {
            cpu_usage,
            available_memory_mb: Some(self.system.available_memory() / (1024 * 1024)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_read_has_no_cpu_usage() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }

        let mut reader = SysinfoReader::new();
        let first = reader.read();
        assert_eq!(first.cpu_usage, None);
        assert!(first.available_memory_mb.is_some());

        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        assert!(reader.read().cpu_usage.is_some());
    }
}
