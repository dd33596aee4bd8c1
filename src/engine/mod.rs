pub mod local;

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::session::config::SessionConfig;
use crate::value::TensorValue;

pub use local::LocalEngine;

/// Canonical status codes reported by execution engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display, Serialize, Deserialize)]
pub enum ErrorCode {
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Fed values keyed by tensor name, in feed order.
pub type FeedTable = IndexMap<String, TensorValue>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Collect per-node execution statistics into `RunMetadata::step_stats`.
    pub trace: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeExecStats {
    pub node_name: String,
    pub op: String,
    pub device: String,
    pub duration_micros: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub step_stats: Vec<NodeExecStats>,
}

#[derive(Clone, Debug, Default)]
pub struct EngineOutput {
    pub values: Vec<TensorValue>,
    pub metadata: RunMetadata,
}

/// The boundary between a session and whatever actually executes graphs.
///
/// `extend` receives a prost-encoded `GraphDef` holding only nodes the engine
/// has not seen yet. Fetch names are `op:index`; target names are op names.
pub trait ExecutionEngine: Send + Sync {
    fn extend(&self, graph_def: &[u8]) -> Result<(), EngineError>;

    fn execute(
        &self,
        targets: &[String],
        fetches: &[String],
        feeds: &FeedTable,
        options: &RunOptions,
    ) -> Result<EngineOutput, EngineError>;

    /// Registers the names a sequence of partial runs may use and returns the
    /// handle identifying that sequence.
    fn partial_setup(&self, feeds: &[String], fetches: &[String], targets: &[String]) -> Result<String, EngineError>;

    fn partial_execute(&self, handle: &str, feeds: &FeedTable, fetches: &[String]) -> Result<Vec<TensorValue>, EngineError>;

    /// Aborts outstanding work. Later calls fail with `Cancelled`.
    fn close(&self) -> Result<(), EngineError>;
}

pub fn connect(config: &SessionConfig) -> Result<Arc<dyn ExecutionEngine>, EngineError> {
    match config.target.as_str() {
        "" | "local" => Ok(Arc::new(LocalEngine::new(config.clone()))),
        other => Err(EngineError::new(
            ErrorCode::Unimplemented,
            format!("No execution engine is available for target '{other}'"),
        )),
    }
}
