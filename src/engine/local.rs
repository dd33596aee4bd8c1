//! In-process reference engine. It evaluates a small op set directly over
//! host `TensorValue`s, which is enough to drive the session client end to end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{debug, info};
use prost::Message;

use crate::dtype::DType;
use crate::engine::{
    EngineError, EngineOutput, ErrorCode, ExecutionEngine, FeedTable, NodeExecStats, RunMetadata, RunOptions,
};
use crate::graph::proto::{GraphDef, NodeDef};
use crate::session::config::SessionConfig;
use crate::value::{TensorValue, ValueError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn node_marker(node: &NodeDef) -> String {
    format!(
        "[[Node: {} = {}[_device=\"{}\"]({})]]",
        node.name,
        node.op,
        node.device,
        node.input.join(", ")
    )
}

fn node_error(code: ErrorCode, node: &NodeDef, message: impl std::fmt::Display) -> EngineError {
    EngineError::new(code, format!("{message}\n\t {}", node_marker(node)))
}

fn split_tensor_name(name: &str) -> Option<(&str, usize)> {
    let (op, index) = name.split_once(':')?;
    Some((op, index.parse().ok()?))
}

struct StoredHandle {
    value: TensorValue,
    device: String,
}

struct PartialRunState {
    feeds: HashSet<String>,
    fetches: HashSet<String>,
    targets: Vec<String>,
    fed: FeedTable,
    fetched: HashSet<String>,
    computed: HashMap<String, Vec<TensorValue>>,
    targets_done: bool,
}

impl PartialRunState {
    fn is_finished(&self) -> bool {
        self.targets_done && self.fetched.len() == self.fetches.len()
    }
}

struct RunContext<'a> {
    feeds: &'a FeedTable,
    computed: HashMap<String, Vec<TensorValue>>,
    in_progress: HashSet<String>,
    deadline: Option<Instant>,
    trace: bool,
    stats: Vec<NodeExecStats>,
}

pub struct LocalEngine {
    config: SessionConfig,
    nodes: RwLock<IndexMap<String, Arc<NodeDef>>>,
    variables: Mutex<HashMap<String, TensorValue>>,
    handles: Mutex<HashMap<String, StoredHandle>>,
    next_handle_id: AtomicU64,
    partial_runs: Mutex<HashMap<String, Arc<Mutex<PartialRunState>>>>,
    next_partial_id: AtomicU64,
    cancelled: AtomicBool,
}

impl LocalEngine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(IndexMap::new()),
            variables: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle_id: AtomicU64::new(0),
            partial_runs: Mutex::new(HashMap::new()),
            next_partial_id: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Number of tensor handles currently alive inside the engine.
    pub fn live_handle_count(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn node(&self, name: &str) -> Option<Arc<NodeDef>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(EngineError::new(ErrorCode::Cancelled, "Session has been closed."));
        }
        Ok(())
    }

    fn check_tensor_name(&self, name: &str, role: &str) -> Result<(), EngineError> {
        let found = split_tensor_name(name)
            .and_then(|(op, index)| self.node(op).map(|n| index < n.output_dtype.len()))
            .unwrap_or(false);
        if !found {
            return Err(EngineError::new(
                ErrorCode::NotFound,
                format!("Tensor {name}, specified in {role}, was not found in the Graph"),
            ));
        }
        Ok(())
    }

    fn check_target_name(&self, name: &str) -> Result<(), EngineError> {
        if self.node(name).is_none() {
            return Err(EngineError::new(
                ErrorCode::NotFound,
                format!("Target node {name} was not found in the Graph"),
            ));
        }
        Ok(())
    }

    fn new_context<'a>(&self, feeds: &'a FeedTable, trace: bool) -> RunContext<'a> {
        RunContext {
            feeds,
            computed: HashMap::new(),
            in_progress: HashSet::new(),
            deadline: self
                .config
                .operation_timeout_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
            trace,
            stats: vec![],
        }
    }

    fn tensor(&self, ctx: &mut RunContext, name: &str) -> Result<TensorValue, EngineError> {
        if let Some(value) = ctx.feeds.get(name) {
            return Ok(value.clone());
        }
        let (op, index) = split_tensor_name(name).ok_or_else(|| {
            EngineError::new(ErrorCode::InvalidArgument, format!("Malformed tensor name '{name}'"))
        })?;
        let outputs = self.run_node(ctx, op)?;
        outputs.get(index).cloned().ok_or_else(|| {
            EngineError::new(
                ErrorCode::InvalidArgument,
                format!("Node '{op}' has no output {index}"),
            )
        })
    }

    fn run_node(&self, ctx: &mut RunContext, name: &str) -> Result<Vec<TensorValue>, EngineError> {
        if let Some(outputs) = ctx.computed.get(name) {
            return Ok(outputs.clone());
        }
        self.check_cancelled()?;
        if ctx.deadline.is_some_and(|deadline| Instant::now() > deadline) {
            return Err(EngineError::new(ErrorCode::DeadlineExceeded, "Timed out waiting for the run to complete"));
        }
        let node = self
            .node(name)
            .ok_or_else(|| EngineError::new(ErrorCode::NotFound, format!("Node '{name}' was not found in the Graph")))?;
        if !ctx.in_progress.insert(name.to_string()) {
            return Err(node_error(ErrorCode::InvalidArgument, &node, "Graph contains a cycle"));
        }

        let mut inputs = vec![];
        for input in &node.input {
            match input.strip_prefix('^') {
                Some(control) => {
                    self.run_node(ctx, control)?;
                }
                None => inputs.push(self.tensor(ctx, input)?),
            }
        }

        let device = if node.device.is_empty() {
            self.config.default_device.as_str()
        } else {
            node.device.as_str()
        };
        if self.config.log_device_placement {
            info!("{}: ({}): {}", node.name, node.op, device);
        }
        let start = Instant::now();
        let outputs = self.compute(&node, device, inputs)?;
        if ctx.trace {
            ctx.stats.push(NodeExecStats {
                node_name: node.name.clone(),
                op: node.op.clone(),
                device: device.to_string(),
                duration_micros: start.elapsed().as_micros() as u64,
            });
        }
        ctx.in_progress.remove(name);
        ctx.computed.insert(name.to_string(), outputs.clone());
        Ok(outputs)
    }

    fn attr_tensor(node: &NodeDef, attr: &str) -> Result<TensorValue, EngineError> {
        let proto = node
            .attr
            .get(attr)
            .and_then(|a| a.as_tensor())
            .ok_or_else(|| node_error(ErrorCode::InvalidArgument, node, format!("Missing attr '{attr}'")))?;
        TensorValue::try_from(proto).map_err(|e| node_error(ErrorCode::InvalidArgument, node, e))
    }

    fn attr_dtype(node: &NodeDef) -> Result<DType, EngineError> {
        node.attr
            .get("dtype")
            .and_then(|a| a.as_dtype())
            .ok_or_else(|| node_error(ErrorCode::InvalidArgument, node, "Missing attr 'dtype'"))
            .and_then(|raw| DType::try_from(raw).map_err(|e| node_error(ErrorCode::InvalidArgument, node, e)))
    }

    fn variable_name(node: &NodeDef) -> Result<&str, EngineError> {
        node.input
            .first()
            .and_then(|i| split_tensor_name(i))
            .map(|(op, _)| op)
            .ok_or_else(|| node_error(ErrorCode::InvalidArgument, node, "Missing variable input"))
    }

    fn handle_strings(node: &NodeDef, value: &TensorValue) -> Result<Vec<String>, EngineError> {
        value
            .try_to_vec::<String>()
            .map_err(|e| node_error(ErrorCode::InvalidArgument, node, e))
    }

    fn compute(&self, node: &NodeDef, device: &str, inputs: Vec<TensorValue>) -> Result<Vec<TensorValue>, EngineError> {
        let arith = |r: Result<TensorValue, ValueError>| r.map_err(|e| node_error(ErrorCode::InvalidArgument, node, e));
        let input = |i: usize| {
            inputs
                .get(i)
                .ok_or_else(|| node_error(ErrorCode::InvalidArgument, node, format!("Missing input {i}")))
        };
        Ok(match node.op.as_str() {
            "Placeholder" => {
                let dtype = Self::attr_dtype(node)?;
                return Err(node_error(
                    ErrorCode::InvalidArgument,
                    node,
                    format!(
                        "You must feed a value for placeholder tensor '{}' with dtype {dtype}",
                        node.name
                    ),
                ));
            }
            "Const" => vec![Self::attr_tensor(node, "value")?],
            "Variable" => {
                let mut variables = lock(&self.variables);
                let value = match variables.get(&node.name) {
                    Some(v) => v.clone(),
                    None => {
                        let v = Self::attr_tensor(node, "value")?;
                        variables.insert(node.name.clone(), v.clone());
                        v
                    }
                };
                vec![value]
            }
            "Assign" | "AssignAdd" => {
                let var = Self::variable_name(node)?;
                let value = if node.op == "Assign" {
                    input(1)?.clone()
                } else {
                    arith(TensorValue::add(input(0)?, input(1)?))?
                };
                lock(&self.variables).insert(var.to_string(), value.clone());
                vec![value]
            }
            "Add" => vec![arith(TensorValue::add(input(0)?, input(1)?))?],
            "Sub" => vec![arith(TensorValue::sub(input(0)?, input(1)?))?],
            "Mul" => vec![arith(TensorValue::mul(input(0)?, input(1)?))?],
            "Identity" => vec![input(0)?.clone()],
            "NoOp" => vec![],
            "GetSessionHandle" => {
                let id = self.next_handle_id.fetch_add(1, Ordering::SeqCst);
                let handle = format!("{};{id};{device}", node.name);
                lock(&self.handles).insert(
                    handle.clone(),
                    StoredHandle {
                        value: input(0)?.clone(),
                        device: device.to_string(),
                    },
                );
                vec![TensorValue::scalar(handle)]
            }
            "GetSessionTensor" => {
                let dtype = Self::attr_dtype(node)?;
                let handle = Self::handle_strings(node, input(0)?)?.into_iter().next().unwrap_or_default();
                let handles = lock(&self.handles);
                let stored = handles.get(&handle).ok_or_else(|| {
                    node_error(ErrorCode::InvalidArgument, node, format!("The tensor with handle '{handle}' is not in the session store."))
                })?;
                if !node.device.is_empty() && node.device != stored.device {
                    return Err(node_error(
                        ErrorCode::InvalidArgument,
                        node,
                        format!(
                            "The tensor with handle '{handle}' lives on {} and cannot be read on {}",
                            stored.device, node.device
                        ),
                    ));
                }
                if stored.value.dtype() != dtype {
                    return Err(node_error(
                        ErrorCode::InvalidArgument,
                        node,
                        format!("Expected a tensor of type {dtype}, but the handle refers to {}", stored.value.dtype()),
                    ));
                }
                vec![stored.value.clone()]
            }
            "DeleteSessionTensor" => {
                let handles = Self::handle_strings(node, input(0)?)?;
                let mut store = lock(&self.handles);
                for handle in handles {
                    if store.remove(&handle).is_none() {
                        return Err(node_error(
                            ErrorCode::InvalidArgument,
                            node,
                            format!("The tensor with handle '{handle}' is not in the session store."),
                        ));
                    }
                }
                vec![]
            }
            other => {
                return Err(node_error(
                    ErrorCode::Unimplemented,
                    node,
                    format!("Op type '{other}' is not supported by the local engine"),
                ));
            }
        })
    }
}

impl ExecutionEngine for LocalEngine {
    fn extend(&self, graph_def: &[u8]) -> Result<(), EngineError> {
        self.check_cancelled()?;
        let graph_def = GraphDef::decode(graph_def)
            .map_err(|e| EngineError::new(ErrorCode::InvalidArgument, format!("Invalid GraphDef: {e}")))?;
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = HashSet::new();
        for node in &graph_def.node {
            if nodes.contains_key(&node.name) || !added.insert(node.name.as_str()) {
                return Err(EngineError::new(
                    ErrorCode::InvalidArgument,
                    format!("Node '{}' already exists in the Graph", node.name),
                ));
            }
        }
        for node in &graph_def.node {
            for input in &node.input {
                let source = input.strip_prefix('^').map_or_else(
                    || split_tensor_name(input).map(|(op, _)| op),
                    Some,
                );
                if !source.is_some_and(|s| nodes.contains_key(s) || added.contains(s)) {
                    return Err(node_error(
                        ErrorCode::InvalidArgument,
                        node,
                        format!("Unknown input node '{input}'"),
                    ));
                }
            }
        }
        // Nothing is inserted unless the whole increment is valid.
        for node in graph_def.node {
            nodes.insert(node.name.clone(), Arc::new(node));
        }
        debug!("Local engine extended to {} nodes (graph version {})", nodes.len(), graph_def.version);
        Ok(())
    }

    fn execute(
        &self,
        targets: &[String],
        fetches: &[String],
        feeds: &FeedTable,
        options: &RunOptions,
    ) -> Result<EngineOutput, EngineError> {
        self.check_cancelled()?;
        for name in feeds.keys() {
            self.check_tensor_name(name, "feed_devs")?;
        }
        for name in fetches {
            self.check_tensor_name(name, "fetch_devs")?;
        }
        for name in targets {
            self.check_target_name(name)?;
        }
        let mut ctx = self.new_context(feeds, options.trace);
        let values = fetches
            .iter()
            .map(|name| self.tensor(&mut ctx, name))
            .collect::<Result<Vec<_>, _>>()?;
        for target in targets {
            self.run_node(&mut ctx, target)?;
        }
        Ok(EngineOutput {
            values,
            metadata: RunMetadata { step_stats: ctx.stats },
        })
    }

    fn partial_setup(&self, feeds: &[String], fetches: &[String], targets: &[String]) -> Result<String, EngineError> {
        self.check_cancelled()?;
        for name in feeds {
            self.check_tensor_name(name, "feed_devs")?;
        }
        for name in fetches {
            self.check_tensor_name(name, "fetch_devs")?;
        }
        for name in targets {
            self.check_target_name(name)?;
        }
        let handle = self.next_partial_id.fetch_add(1, Ordering::SeqCst).to_string();
        let state = PartialRunState {
            feeds: feeds.iter().cloned().collect(),
            fetches: fetches.iter().cloned().collect(),
            targets: targets.to_vec(),
            fed: FeedTable::new(),
            fetched: HashSet::new(),
            computed: HashMap::new(),
            targets_done: targets.is_empty(),
        };
        lock(&self.partial_runs).insert(handle.clone(), Arc::new(Mutex::new(state)));
        Ok(handle)
    }

    fn partial_execute(&self, handle: &str, feeds: &FeedTable, fetches: &[String]) -> Result<Vec<TensorValue>, EngineError> {
        self.check_cancelled()?;
        let state = lock(&self.partial_runs).get(handle).cloned().ok_or_else(|| {
            EngineError::new(
                ErrorCode::InvalidArgument,
                format!("Must run 'setup' before performing partial runs! (handle '{handle}')"),
            )
        })?;
        let mut state = lock(&state);
        for name in feeds.keys() {
            if !state.feeds.contains(name) {
                return Err(EngineError::new(
                    ErrorCode::InvalidArgument,
                    format!("The feed {name} was not specified in partial_run_setup."),
                ));
            }
            if state.fed.contains_key(name) {
                return Err(EngineError::new(
                    ErrorCode::InvalidArgument,
                    format!("The feed {name} has already been fed."),
                ));
            }
        }
        for name in fetches {
            if !state.fetches.contains(name) {
                return Err(EngineError::new(
                    ErrorCode::InvalidArgument,
                    format!("The fetch {name} was not specified in partial_run_setup."),
                ));
            }
            if state.fetched.contains(name) {
                return Err(EngineError::new(
                    ErrorCode::InvalidArgument,
                    format!("The fetch {name} has already been fetched."),
                ));
            }
        }

        let mut fed = state.fed.clone();
        fed.extend(feeds.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut ctx = self.new_context(&fed, false);
        ctx.computed = std::mem::take(&mut state.computed);
        let values = fetches
            .iter()
            .map(|name| self.tensor(&mut ctx, name))
            .collect::<Result<Vec<_>, _>>();
        let values = match values {
            Ok(values) => values,
            Err(e) => {
                state.computed = ctx.computed;
                return Err(e);
            }
        };
        if !state.targets_done && fed.len() == state.feeds.len() {
            for target in state.targets.clone() {
                self.run_node(&mut ctx, &target)?;
            }
            state.targets_done = true;
        }
        state.computed = ctx.computed;
        state.fed = fed;
        state.fetched.extend(fetches.iter().cloned());
        if state.is_finished() {
            lock(&self.partial_runs).remove(handle);
        }
        Ok(values)
    }

    fn close(&self) -> Result<(), EngineError> {
        self.cancelled.store(true, Ordering::SeqCst);
        lock(&self.partial_runs).clear();
        info!("Local engine closed with {} live tensor handles", self.live_handle_count());
        Ok(())
    }
}
