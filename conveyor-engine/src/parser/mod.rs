// Parser module for pipeline definitions
// Provides YAML parsing, data models and semantic validation

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
pub use loader::{PipelineParser, PipelineValidator};
pub use models::*;
