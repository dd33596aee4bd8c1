use std::collections::HashMap;
use std::sync::Arc;

use crate::dtype::DType;
use crate::engine::{ErrorCode, FeedTable};
use crate::error::SessionError;
use crate::fetch::expansion::ExpansionTable;
use crate::fetch::mapper::FetchMapper;
use crate::fetch::{Fetch, FetchValue};
use crate::graph::{Graph, GraphElement, OpRef, TensorRef};
use crate::session::SessionShared;
use crate::session::handle::TensorHandle;
use crate::value::TensorValue;

/// Splits a fetch into the operations to run and the tensors to return, and
/// drops tensors whose values are already known from the feeds.
pub struct FetchHandler {
    mapper: FetchMapper,
    fetches: Vec<TensorRef>,
    targets: Vec<OpRef>,
    ops: Vec<bool>,
    final_fetches: Vec<TensorRef>,
    fetch_handles: HashMap<TensorRef, DType>,
    fed: Vec<bool>,
}

impl FetchHandler {
    /// `feeds` holds the names of every tensor fed in this call.
    pub fn new(
        graph: &Graph,
        fetch: &Fetch,
        feeds: &FeedTable,
        table: &ExpansionTable,
    ) -> Result<Self, SessionError> {
        let mapper = FetchMapper::for_fetch(fetch, graph, table)?;
        let mut fetches = vec![];
        let mut targets = vec![];
        let mut ops = vec![];
        let mut fetch_handles = HashMap::new();
        for element in mapper.unique_fetches() {
            if !graph.is_fetchable(element.op_name()) {
                return Err(SessionError::op(
                    ErrorCode::FailedPrecondition,
                    format!("Operation '{}' has been marked as not fetchable.", element.op_name()),
                ));
            }
            match element {
                GraphElement::Operation(op) => {
                    targets.push(op.clone());
                    ops.push(true);
                }
                GraphElement::Tensor(tensor) => {
                    let handle_input = graph
                        .node(tensor.op_name())
                        .filter(|node| node.op_type() == "GetSessionHandle")
                        .and_then(|node| node.inputs().first().cloned());
                    if let Some(input) = handle_input {
                        fetch_handles.insert(tensor.clone(), graph.output_spec(&input)?.dtype);
                    }
                    fetches.push(tensor.clone());
                    ops.push(false);
                }
            }
        }
        let fed: Vec<bool> = fetches.iter().map(|t| feeds.contains_key(&t.name())).collect();
        let final_fetches = fetches
            .iter()
            .zip(&fed)
            .filter(|(_, fed)| !**fed)
            .map(|(t, _)| t.clone())
            .collect();
        Ok(Self {
            mapper,
            fetches,
            targets,
            ops,
            final_fetches,
            fetch_handles,
            fed,
        })
    }

    /// Every unique tensor fetch, fed or not.
    pub fn fetches(&self) -> &[TensorRef] {
        &self.fetches
    }

    pub fn targets(&self) -> &[OpRef] {
        &self.targets
    }

    /// Tensors the engine actually has to produce.
    pub fn final_fetches(&self) -> &[TensorRef] {
        &self.final_fetches
    }

    /// Element type behind a fetched tensor that produces session handles.
    pub fn fetch_handle_dtype(&self, tensor: &TensorRef) -> Option<DType> {
        self.fetch_handles.get(tensor).copied()
    }

    /// Assembles results from `raw`, which lines up with `final_fetches()`.
    /// Fed tensors take their fed value and consume nothing from `raw`.
    pub fn build_results(
        &self,
        session: &Arc<SessionShared>,
        feeds: &FeedTable,
        feed_handles: &HashMap<String, TensorHandle>,
        raw: Vec<TensorValue>,
    ) -> Result<FetchValue, SessionError> {
        if raw.len() != self.final_fetches.len() {
            return Err(SessionError::op(
                ErrorCode::Internal,
                format!(
                    "Expected {} values from the engine, got {}",
                    self.final_fetches.len(),
                    raw.len()
                ),
            ));
        }
        let mut raw = raw.into_iter();
        let mut tensors = self.fetches.iter().zip(&self.fed);
        let mut full_values = Vec::with_capacity(self.ops.len());
        for is_op in &self.ops {
            if *is_op {
                full_values.push(FetchValue::None);
                continue;
            }
            let (tensor, fed) = tensors
                .next()
                .ok_or_else(|| SessionError::op(ErrorCode::Internal, "Fetch classification is out of sync"))?;
            let name = tensor.name();
            if let Some(handle) = feed_handles.get(&name) {
                full_values.push(FetchValue::Handle(handle.clone()));
                continue;
            }
            let value = if *fed {
                feeds.get(&name).cloned()
            } else {
                raw.next()
            }
            .ok_or_else(|| SessionError::op(ErrorCode::Internal, format!("No value available for {name}")))?;
            full_values.push(match self.fetch_handle_dtype(tensor) {
                Some(dtype) => {
                    let handle = value.to_scalar::<String>().map_err(|e| {
                        SessionError::op(ErrorCode::Internal, format!("Session handle for {name} is malformed: {e}"))
                    })?;
                    FetchValue::Handle(TensorHandle::new(handle, dtype, session))
                }
                None => FetchValue::Tensor(value),
            });
        }
        self.mapper.build_results(&full_values)
    }
}
