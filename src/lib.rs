//! Client-side execution core for dataflow graphs: fetch/feed resolution,
//! incremental graph extension, result assembly and tensor handle lifetime.

pub mod dtype;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod graph;
pub mod session;
pub mod value;

pub use dtype::DType;
pub use engine::{ErrorCode, ExecutionEngine, LocalEngine, RunMetadata, RunOptions};
pub use error::{ErrorKind, OpError, SessionError};
pub use fetch::{Element, Fetch, FetchValue, IndexedSlices, IndexedSlicesValue, SparseTensor, SparseTensorValue};
pub use graph::shape::TensorShape;
pub use graph::{Graph, OpRef, TensorRef};
pub use session::config::SessionConfig;
pub use session::feed::{FeedDict, FeedKey, FeedValue};
pub use session::handle::TensorHandle;
pub use session::{PartialRunHandle, Session};
pub use value::TensorValue;
