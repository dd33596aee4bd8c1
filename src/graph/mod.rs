pub mod ops;
pub mod proto;
pub mod shape;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::ThreadId;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::graph::proto::{AttrValue, AttrValueKind, DataTypeProto, GraphDef, NodeDef, ShapeListProto};
use crate::graph::shape::TensorShape;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate node name \"{0}\"")]
    DuplicateName(String),
    #[error("Invalid node name \"{0}\"")]
    InvalidName(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
}

/// Reference to one output of a node, written `op:index`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorRef {
    op: String,
    index: usize,
}

impl TensorRef {
    pub fn new(op: impl Into<String>, index: usize) -> Self {
        Self { op: op.into(), index }
    }

    pub fn op_name(&self) -> &str {
        &self.op
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn op(&self) -> OpRef {
        OpRef::new(self.op.clone())
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.op, self.index)
    }
}

impl Display for TensorRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.op, self.index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpRef {
    name: String,
}

impl OpRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self, index: usize) -> TensorRef {
        TensorRef::new(self.name.clone(), index)
    }
}

impl Display for OpRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A reference that has been checked against a graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GraphElement {
    Tensor(TensorRef),
    Operation(OpRef),
}

impl GraphElement {
    pub fn name(&self) -> String {
        match self {
            GraphElement::Tensor(t) => t.name(),
            GraphElement::Operation(o) => o.name().to_string(),
        }
    }

    pub fn op_name(&self) -> &str {
        match self {
            GraphElement::Tensor(t) => t.op_name(),
            GraphElement::Operation(o) => o.name(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub dtype: DType,
    pub shape: TensorShape,
}

#[derive(Clone, Debug)]
pub struct Node {
    id: u64,
    name: String,
    op_type: String,
    inputs: Vec<TensorRef>,
    control_inputs: Vec<String>,
    device: String,
    attrs: BTreeMap<String, AttrValue>,
    outputs: Vec<OutputSpec>,
}

impl Node {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn inputs(&self) -> &[TensorRef] {
        &self.inputs
    }

    pub fn control_inputs(&self) -> &[String] {
        &self.control_inputs
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    pub fn to_node_def(&self, add_shapes: bool) -> NodeDef {
        let mut attr = self.attrs.clone();
        if add_shapes {
            attr.insert(
                "_output_shapes".to_string(),
                AttrValue {
                    value: Some(AttrValueKind::ShapeList(ShapeListProto {
                        shape: self.outputs.iter().map(|o| o.shape.to_proto()).collect(),
                    })),
                },
            );
        }
        NodeDef {
            name: self.name.clone(),
            op: self.op_type.clone(),
            input: self
                .inputs
                .iter()
                .map(|t| t.name())
                .chain(self.control_inputs.iter().map(|c| format!("^{c}")))
                .collect(),
            device: self.device.clone(),
            attr,
            output_dtype: self
                .outputs
                .iter()
                .map(|o| DataTypeProto::from(o.dtype) as i32)
                .collect(),
        }
    }
}

pub struct OpBuilder<'g> {
    graph: &'g Graph,
    op_type: String,
    name: String,
    inputs: Vec<TensorRef>,
    control_inputs: Vec<String>,
    device: Option<String>,
    attrs: BTreeMap<String, AttrValue>,
    outputs: Vec<OutputSpec>,
}

impl<'g> OpBuilder<'g> {
    pub fn input(mut self, input: &TensorRef) -> Self {
        self.inputs.push(input.clone());
        self
    }

    pub fn control_input(mut self, op: &OpRef) -> Self {
        self.control_inputs.push(op.name().to_string());
        self
    }

    pub fn device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Pins the node to `device` if given; otherwise the scope default applies.
    pub fn maybe_device(mut self, device: Option<&str>) -> Self {
        if let Some(device) = device {
            self.device = Some(device.to_string());
        }
        self
    }

    pub fn attr(mut self, name: &str, value: AttrValue) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn output(mut self, dtype: DType, shape: TensorShape) -> Self {
        self.outputs.push(OutputSpec { dtype, shape });
        self
    }

    pub fn build(self) -> Result<OpRef, GraphError> {
        let graph = self.graph;
        let mut state = graph.write();
        if self.name.is_empty() || self.name.contains([':', '^', ';']) {
            return Err(GraphError::InvalidName(self.name));
        }
        if state.by_name.contains_key(&self.name) {
            return Err(GraphError::DuplicateName(self.name));
        }
        for input in &self.inputs {
            state.output_spec(input)?;
        }
        for control in &self.control_inputs {
            if !state.by_name.contains_key(control) {
                return Err(GraphError::NotFound(format!(
                    "Control input '{control}' of node '{}' does not exist in the graph.",
                    self.name
                )));
            }
        }
        let device = self
            .device
            .or_else(|| {
                state
                    .device_scopes
                    .get(&std::thread::current().id())
                    .and_then(|stack| stack.last().cloned())
            })
            .unwrap_or_default();
        let id = state.nodes.len() as u64 + 1;
        let node = Node {
            id,
            name: self.name.clone(),
            op_type: self.op_type,
            inputs: self.inputs,
            control_inputs: self.control_inputs,
            device,
            attrs: self.attrs,
            outputs: self.outputs,
        };
        let idx = state.nodes.len();
        state.nodes.push(Arc::new(node));
        state.by_name.insert(self.name.clone(), idx);
        Ok(OpRef::new(self.name))
    }
}

#[derive(Default)]
struct GraphState {
    nodes: Vec<Arc<Node>>,
    by_name: HashMap<String, usize>,
    name_counters: HashMap<String, usize>,
    /// Default device stacks, one per thread building nodes.
    device_scopes: HashMap<ThreadId, Vec<String>>,
    unfetchable: HashSet<String>,
    unfeedable: HashSet<String>,
    handle_feeders: HashMap<String, DType>,
}

/// Subgraphs built on demand to read, move and delete tensor handles.
#[derive(Default)]
pub(crate) struct HandleOps {
    readers: HashMap<String, (TensorRef, TensorRef)>,
    movers: HashMap<String, (TensorRef, TensorRef)>,
    deleters: HashMap<String, (TensorRef, OpRef)>,
}

impl HandleOps {
    pub(crate) fn readers(&mut self) -> &mut HashMap<String, (TensorRef, TensorRef)> {
        &mut self.readers
    }

    pub(crate) fn movers(&mut self) -> &mut HashMap<String, (TensorRef, TensorRef)> {
        &mut self.movers
    }

    pub(crate) fn deleters(&mut self) -> &mut HashMap<String, (TensorRef, OpRef)> {
        &mut self.deleters
    }
}

struct DeviceScope<'g> {
    graph: &'g Graph,
    thread: ThreadId,
}

impl Drop for DeviceScope<'_> {
    fn drop(&mut self) {
        let mut state = self.graph.write();
        if let Some(stack) = state.device_scopes.get_mut(&self.thread) {
            stack.pop();
            if stack.is_empty() {
                state.device_scopes.remove(&self.thread);
            }
        }
    }
}

impl GraphState {
    fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.by_name.get(name).map(|idx| &self.nodes[*idx])
    }

    fn output_spec(&self, tensor: &TensorRef) -> Result<OutputSpec, GraphError> {
        let node = self.node(tensor.op_name()).ok_or_else(|| {
            GraphError::NotFound(format!(
                "The name '{tensor}' refers to a Tensor which does not exist. The operation, '{}', does not exist in the graph.",
                tensor.op_name()
            ))
        })?;
        node.outputs.get(tensor.index()).cloned().ok_or_else(|| {
            GraphError::NotFound(format!(
                "The name '{tensor}' refers to a Tensor which does not exist. The operation, '{}', exists but only has {} outputs.",
                tensor.op_name(),
                node.outputs.len()
            ))
        })
    }
}

/// A caller-owned computation graph. Nodes are only ever appended; every
/// append bumps the version by one, so a version number identifies a prefix
/// of the node list.
#[derive(Default)]
pub struct Graph {
    state: RwLock<GraphState>,
    handle_ops: Mutex<HandleOps>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn version(&self) -> u64 {
        self.read().nodes.len() as u64
    }

    pub fn op_builder(&self, op_type: &str, name: &str) -> OpBuilder<'_> {
        OpBuilder {
            graph: self,
            op_type: op_type.to_string(),
            name: name.to_string(),
            inputs: vec![],
            control_inputs: vec![],
            device: None,
            attrs: BTreeMap::new(),
            outputs: vec![],
        }
    }

    /// Returns `prefix` if unused, otherwise `prefix_N` for the first free N.
    pub fn unique_name(&self, prefix: &str) -> String {
        let mut state = self.write();
        let mut counter = state.name_counters.get(prefix).copied().unwrap_or(0);
        loop {
            let candidate = if counter == 0 {
                prefix.to_string()
            } else {
                format!("{prefix}_{counter}")
            };
            counter += 1;
            if !state.by_name.contains_key(&candidate) {
                state.name_counters.insert(prefix.to_string(), counter);
                return candidate;
            }
        }
    }

    /// Runs `f` with `device` as the default device for nodes that the
    /// current thread builds without requesting one explicitly. Other threads
    /// are unaffected.
    pub fn with_device<R>(&self, device: &str, f: impl FnOnce() -> R) -> R {
        let thread = std::thread::current().id();
        self.write()
            .device_scopes
            .entry(thread)
            .or_default()
            .push(device.to_string());
        let _scope = DeviceScope { graph: self, thread };
        f()
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.read().node(name).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.read().nodes.clone()
    }

    pub fn output_spec(&self, tensor: &TensorRef) -> Result<OutputSpec, GraphError> {
        self.read().output_spec(tensor)
    }

    pub fn check_tensor(&self, tensor: &TensorRef) -> Result<GraphElement, GraphError> {
        self.output_spec(tensor)?;
        Ok(GraphElement::Tensor(tensor.clone()))
    }

    pub fn check_op(&self, op: &OpRef) -> Result<GraphElement, GraphError> {
        if self.read().node(op.name()).is_none() {
            return Err(GraphError::NotFound(format!(
                "The name '{op}' refers to an Operation not in the graph."
            )));
        }
        Ok(GraphElement::Operation(op.clone()))
    }

    /// Interprets `name` as `op:index` (a tensor) or `op` (an operation).
    pub fn resolve_name(
        &self,
        name: &str,
        allow_tensor: bool,
        allow_operation: bool,
    ) -> Result<GraphElement, GraphError> {
        if let Some((op_name, index)) = name.split_once(':') {
            if !allow_tensor {
                return Err(GraphError::InvalidArgument(format!(
                    "Name '{name}' appears to refer to a Tensor, not a Operation."
                )));
            }
            let index = index.parse::<usize>().map_err(|_| {
                GraphError::InvalidArgument(format!(
                    "The name '{name}' looks like a Tensor name, but is not a valid one. Tensor names must be of the form \"<op_name>:<output_index>\"."
                ))
            })?;
            return self.check_tensor(&TensorRef::new(op_name, index));
        }
        let exists = self.read().node(name).is_some();
        if allow_operation {
            return self.check_op(&OpRef::new(name));
        }
        if allow_tensor && exists {
            return Err(GraphError::InvalidArgument(format!(
                "The name '{name}' refers to an Operation, not a Tensor. Tensor names must be of the form \"<op_name>:<output_index>\"."
            )));
        }
        if !exists {
            return Err(GraphError::NotFound(format!(
                "The name '{name}' refers to an Operation not in the graph."
            )));
        }
        Err(GraphError::InvalidArgument(format!(
            "The name '{name}' cannot be converted to a graph element."
        )))
    }

    pub fn prevent_fetching(&self, op: &OpRef) {
        self.write().unfetchable.insert(op.name().to_string());
    }

    pub fn is_fetchable(&self, op_name: &str) -> bool {
        !self.read().unfetchable.contains(op_name)
    }

    pub fn prevent_feeding(&self, tensor: &TensorRef) {
        self.write().unfeedable.insert(tensor.name());
    }

    pub fn is_feedable(&self, tensor: &TensorRef) -> bool {
        !self.read().unfeedable.contains(&tensor.name())
    }

    pub(crate) fn register_handle_feeder(&self, op_name: &str, dtype: DType) {
        self.write().handle_feeders.insert(op_name.to_string(), dtype);
    }

    /// Element type of values read through a handle fed into `op_name`, if
    /// that placeholder was created to receive tensor handles.
    pub fn handle_feeder_dtype(&self, op_name: &str) -> Option<DType> {
        self.read().handle_feeders.get(op_name).copied()
    }

    /// Returns the handle subgraph cached under `key` in the map chosen by
    /// `select`, building it with `build` on a miss. Concurrent callers with
    /// the same key share one subgraph.
    pub(crate) fn handle_op<T: Clone>(
        &self,
        select: fn(&mut HandleOps) -> &mut HashMap<String, T>,
        key: &str,
        build: impl FnOnce() -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        let mut handle_ops = self.handle_ops.lock().unwrap_or_else(PoisonError::into_inner);
        let cache = select(&mut *handle_ops);
        if let Some(cached) = cache.get(key) {
            return Ok(cached.clone());
        }
        let built = build()?;
        cache.insert(key.to_string(), built.clone());
        Ok(built)
    }

    /// Serializes nodes added after `from_version`. Returns the message and the
    /// version it brings a reader up to.
    pub fn as_graph_def(&self, from_version: u64, add_shapes: bool) -> (GraphDef, u64) {
        let state = self.read();
        let version = state.nodes.len() as u64;
        let node = state
            .nodes
            .iter()
            .filter(|n| n.id > from_version)
            .map(|n| n.to_node_def(add_shapes))
            .collect();
        (GraphDef { node, version }, version)
    }
}
