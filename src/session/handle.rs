//! Tensor handles: references to values kept inside the engine between runs.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use log::warn;

use crate::dtype::DType;
use crate::engine::ErrorCode;
use crate::error::SessionError;
use crate::fetch::Fetch;
use crate::graph::{Graph, GraphError, HandleOps, OpRef, TensorRef, ops};
use crate::session::SessionShared;
use crate::session::feed::{FeedDict, FeedValue};
use crate::value::TensorValue;

/// Device part of a `name;id;device` handle string.
pub fn device_of(handle: &str) -> &str {
    handle.rsplit(';').next().unwrap_or("")
}

fn reader_key(handle: &str) -> String {
    let name = handle.split(';').next().unwrap_or("");
    format!("{name};{}", device_of(handle))
}

fn mover_key(feeder: &TensorRef, handle: &str) -> String {
    format!("{};{}", feeder.op_name(), reader_key(handle))
}

/// Returns the `(holder, reader)` pair that reads `handle` back, building it
/// on the handle's device the first time.
pub(crate) fn handle_reader(graph: &Graph, handle: &str, dtype: DType) -> Result<(TensorRef, TensorRef), GraphError> {
    graph.handle_op(HandleOps::readers, &reader_key(handle), || {
        ops::get_session_tensor(graph, dtype, Some(device_of(handle)))
    })
}

/// Returns `(holder, new_handle)` relocating `handle` to `feeder`'s device, or
/// `None` if no move is needed.
pub(crate) fn handle_mover(
    graph: &Graph,
    feeder: &TensorRef,
    handle: &str,
) -> Result<Option<(TensorRef, TensorRef)>, GraphError> {
    let Some(dtype) = graph.handle_feeder_dtype(feeder.op_name()) else {
        return Ok(None);
    };
    let feeder_device = graph
        .node(feeder.op_name())
        .map(|n| n.device().to_string())
        .unwrap_or_default();
    let handle_device = device_of(handle);
    if feeder_device.is_empty() || feeder_device == handle_device {
        return Ok(None);
    }
    let mover = graph.handle_op(HandleOps::movers, &mover_key(feeder, handle), || {
        let (holder, reader) = ops::get_session_tensor(graph, dtype, Some(handle_device))?;
        let name = graph.unique_name("GetSessionHandle");
        let moved = ops::get_session_handle(graph, &name, &reader, Some(&feeder_device))?;
        Ok((holder, moved))
    })?;
    Ok(Some(mover))
}

/// Returns the `(holder, deleter)` pair for handles on `device`.
pub(crate) fn handle_deleter(graph: &Graph, device: &str) -> Result<(TensorRef, OpRef), GraphError> {
    graph.handle_op(HandleOps::deleters, device, || {
        ops::delete_session_tensor(graph, Some(device))
    })
}

struct HandleInner {
    handle: String,
    dtype: DType,
    session: Weak<SessionShared>,
    auto_gc: AtomicBool,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if !self.auto_gc.load(Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            session.register_dead_handle(std::mem::take(&mut self.handle));
        }
    }
}

/// A value retained by the engine. Clones share one handle; when the last
/// clone is dropped the handle is queued for batched deletion.
#[derive(Clone)]
pub struct TensorHandle {
    inner: Arc<HandleInner>,
}

impl Debug for TensorHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorHandle")
            .field("handle", &self.inner.handle)
            .field("dtype", &self.inner.dtype)
            .finish()
    }
}

impl TensorHandle {
    pub(crate) fn new(handle: String, dtype: DType, session: &Arc<SessionShared>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                handle,
                dtype,
                session: Arc::downgrade(session),
                auto_gc: AtomicBool::new(true),
            }),
        }
    }

    pub fn handle(&self) -> &str {
        &self.inner.handle
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device_name(&self) -> &str {
        device_of(&self.inner.handle)
    }

    fn session(&self) -> Result<Arc<SessionShared>, SessionError> {
        self.inner
            .session
            .upgrade()
            .ok_or_else(|| SessionError::Runtime("Attempted to use a closed Session.".to_string()))
    }

    /// Reads the referenced value back from the engine.
    pub fn eval(&self) -> Result<TensorValue, SessionError> {
        let session = self.session()?;
        let (holder, reader) = handle_reader(session.graph(), self.handle(), self.dtype())?;
        let feeds = FeedDict::new().with(holder, FeedValue::Str(self.handle().to_string()));
        let result = session.run_impl(None, &Fetch::from(reader), &feeds, None, None)?;
        result
            .into_tensor()
            .ok_or_else(|| SessionError::op(ErrorCode::Internal, "Handle reader returned no tensor"))
    }

    /// Deletes the value now. The handle is no longer collected on drop.
    pub fn delete(&self) -> Result<(), SessionError> {
        self.inner.auto_gc.store(false, Ordering::SeqCst);
        let session = self.session()?;
        let (holder, deleter) = handle_deleter(session.graph(), self.device_name())?;
        let feeds = FeedDict::new().with(holder, vec![self.handle().to_string()]);
        session.run_impl(None, &Fetch::from(deleter), &feeds, None, None)?;
        Ok(())
    }
}

/// Buffers dead handle strings until `threshold` of them have accumulated.
pub struct DeadHandleCollector {
    threshold: usize,
    dead: Mutex<Vec<String>>,
}

impl DeadHandleCollector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            dead: Mutex::new(vec![]),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Adds `handle`; returns the whole buffer once it reaches the threshold.
    pub fn register(&self, handle: String) -> Option<Vec<String>> {
        let mut dead = self.dead.lock().unwrap_or_else(PoisonError::into_inner);
        dead.push(handle);
        if dead.len() >= self.threshold {
            Some(std::mem::take(&mut *dead))
        } else {
            None
        }
    }

    pub fn pending(&self) -> usize {
        self.dead.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drops everything buffered without deleting it; returns how many.
    pub fn abandon(&self) -> usize {
        let abandoned = std::mem::take(&mut *self.dead.lock().unwrap_or_else(PoisonError::into_inner));
        if !abandoned.is_empty() {
            warn!("Abandoning {} dead tensor handles", abandoned.len());
        }
        abandoned.len()
    }
}
