// Service Errors
// Errors that stop a run before any job starts

use crate::config::ConfigError;
use crate::execution::graph::GraphError;
use crate::parser::ParseError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Cycles and unknown prerequisites; fatal before any job runs
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Missing trigger or a bad setting
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
