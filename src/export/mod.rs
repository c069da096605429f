//! Export naming, retry policy and the export scheduler

pub mod naming;
pub mod retry;
pub mod scheduler;

pub use naming::{NamingScheme, SceneName, Sensor};
pub use retry::{CancellationToken, RetryPolicy, Sleeper, ThreadSleeper};
pub use scheduler::{
    rescale, Aggregation, ExportBackend, ExportJob, ExportParams, ExportRegion, ExportReport, ExportRequest,
    ExportScheduler, JobStatus, PyramidingPolicy,
};
