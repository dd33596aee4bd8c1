use crate::engine::{EngineError, ErrorCode};
use crate::graph::GraphError;
use crate::graph::proto::NodeDef;
use crate::value::ValueError;

/// Coarse classification of a `SessionError`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A coded error, raised locally or reported by the engine.
    Op(ErrorCode),
    Type,
    Value,
    /// Misuse of the session itself (closed, empty graph). Not retryable.
    Runtime,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct OpError {
    code: ErrorCode,
    message: String,
    node_name: Option<String>,
    node_def: Option<NodeDef>,
}

impl OpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_name: None,
            node_def: None,
        }
    }

    pub fn with_node(mut self, name: String, node_def: NodeDef) -> Self {
        self.node_name = Some(name);
        self.node_def = Some(node_def);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Name of the node the failure was attributed to, if one could be found.
    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    pub fn node_def(&self) -> Option<&NodeDef> {
        self.node_def.as_ref()
    }
}

impl From<EngineError> for OpError {
    fn from(err: EngineError) -> Self {
        Self::new(err.code, err.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Op(#[from] OpError),
    #[error("TypeError: {0}")]
    Type(String),
    #[error("ValueError: {0}")]
    Value(String),
    #[error("RuntimeError: {0}")]
    Runtime(String),
}

impl SessionError {
    pub fn op(code: ErrorCode, message: impl Into<String>) -> Self {
        SessionError::Op(OpError::new(code, message))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Op(e) => ErrorKind::Op(e.code()),
            SessionError::Type(_) => ErrorKind::Type,
            SessionError::Value(_) => ErrorKind::Value,
            SessionError::Runtime(_) => ErrorKind::Runtime,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SessionError::Op(e) => Some(e.code()),
            _ => None,
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        SessionError::Op(err.into())
    }
}

impl From<GraphError> for SessionError {
    fn from(err: GraphError) -> Self {
        let code = match &err {
            GraphError::NotFound(_) => ErrorCode::NotFound,
            GraphError::DuplicateName(_) | GraphError::InvalidName(_) | GraphError::InvalidArgument(_) => {
                ErrorCode::InvalidArgument
            }
        };
        SessionError::op(code, err.to_string())
    }
}

impl From<ValueError> for SessionError {
    fn from(err: ValueError) -> Self {
        SessionError::Type(err.to_string())
    }
}
