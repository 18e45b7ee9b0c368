//! Periodic sampling of CPU, memory, runtime and connection load. The samples are exposed as
//!  backpressure signals for the layers above the transport; nothing in the transport itself
//!  acts on them.

pub mod monitor;
pub mod reader;
pub mod recorder;

pub use monitor::SystemUsageMonitor;
pub use reader::{SysinfoReader, SystemReader, SystemSnapshot};
pub use recorder::{SystemUsageRecorder, SystemUsageRecorderConfig, SystemUsageSample};
