use std::sync::{Arc, Mutex, PoisonError};

use prost::Message;
use whisper_session::engine::{EngineError, EngineOutput, ExecutionEngine, FeedTable};
use whisper_session::graph::proto::GraphDef;
use whisper_session::{LocalEngine, RunOptions, TensorValue};

#[derive(Clone, Debug, PartialEq)]
pub enum EngineCall {
    Extend { nodes: usize },
    Execute { targets: Vec<String>, fetches: Vec<String>, feeds: Vec<String> },
    PartialSetup,
    PartialExecute { fetches: Vec<String>, feeds: Vec<String> },
    Close,
}

/// Forwards to a `LocalEngine` and remembers every call it was given.
pub struct RecordingEngine {
    inner: Arc<LocalEngine>,
    calls: Mutex<Vec<EngineCall>>,
}

impl RecordingEngine {
    pub fn new(inner: Arc<LocalEngine>) -> Self {
        Self {
            inner,
            calls: Mutex::new(vec![]),
        }
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn executes(&self) -> Vec<EngineCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::Execute { .. }))
            .collect()
    }

    pub fn extends(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Extend { nodes } => Some(nodes),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == EngineCall::Close).count()
    }
}

impl ExecutionEngine for RecordingEngine {
    fn extend(&self, graph_def: &[u8]) -> Result<(), EngineError> {
        let nodes = GraphDef::decode(graph_def).map(|g| g.node.len()).unwrap_or(0);
        self.record(EngineCall::Extend { nodes });
        self.inner.extend(graph_def)
    }

    fn execute(
        &self,
        targets: &[String],
        fetches: &[String],
        feeds: &FeedTable,
        options: &RunOptions,
    ) -> Result<EngineOutput, EngineError> {
        self.record(EngineCall::Execute {
            targets: targets.to_vec(),
            fetches: fetches.to_vec(),
            feeds: feeds.keys().cloned().collect(),
        });
        self.inner.execute(targets, fetches, feeds, options)
    }

    fn partial_setup(&self, feeds: &[String], fetches: &[String], targets: &[String]) -> Result<String, EngineError> {
        self.record(EngineCall::PartialSetup);
        self.inner.partial_setup(feeds, fetches, targets)
    }

    fn partial_execute(&self, handle: &str, feeds: &FeedTable, fetches: &[String]) -> Result<Vec<TensorValue>, EngineError> {
        self.record(EngineCall::PartialExecute {
            fetches: fetches.to_vec(),
            feeds: feeds.keys().cloned().collect(),
        });
        self.inner.partial_execute(handle, feeds, fetches)
    }

    fn close(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Close);
        self.inner.close()
    }
}
