//! Pipeline orchestration and statistics

pub mod pipeline;
pub mod stats;

pub use pipeline::{AudioPipeline, DeviceFault, PipelineCore, PipelineStatus};
pub use stats::{SessionStats, StatsRecorder, StatsSnapshot};
