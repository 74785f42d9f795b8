//! Download management and processing

pub mod cancel;
pub mod convert;
pub mod job;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod transfer;

// Re-exports for convenience
pub use job::{Job, JobEvent, JobRegistry, JobState};
pub use probe::{probe_formats, FormatOption, ProbeResult};
