// Conveyor Engine Library
// Parsing, scheduling and execution of CI/CD pipeline definitions

pub mod artifacts;
pub mod cache;
pub mod config;
pub mod deploy;
pub mod error;
pub mod execution;
pub mod gate;
pub mod parser;
pub mod registry;
pub mod runners;
pub mod utils;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export parser types
pub use parser::{
    ParseError, ParseErrorKind, ParseResult, Pipeline, PipelineParser, PipelineValidator,
    TriggerEvent, ValidationError,
};

// Re-export execution types
pub use execution::{
    EnvironmentSnapshot, ExecutionEvent, GraphError, JobExecutor, JobGraph, PendingFailure,
    PipelineResult, PipelineScheduler, ProgressSender, SchedulerConfig,
};

pub use artifacts::{ArtifactStore, FsArtifactStore};
pub use cache::{ArtifactCache, CacheError, CacheStore, FsCacheStore, MemoryCacheStore};
pub use config::{ConfigError, ConveyorConfig};
pub use deploy::{ClusterClient, DeployError, Deployer, DeploymentRouter, DeploymentTarget, KubectlClient};
pub use gate::ConditionalGate;
pub use registry::{DockerRegistry, ImageRegistry, RegistryError};
pub use runners::{CommandRunner, ContainerRunner, RunnerRegistry, ShellRunner};
