// Execution Engine Module
// Job graph, job execution and concurrent scheduling

pub mod context;
pub mod events;
pub mod graph;
pub mod job;
pub mod scheduler;

pub use context::EnvironmentSnapshot;
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use graph::{GraphError, GraphErrorKind, JobGraph, JobNode};
pub use job::{JobExecutor, PendingFailure};
pub use scheduler::{PipelineResult, PipelineScheduler, SchedulerConfig};
