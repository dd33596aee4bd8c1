//! Client-side session: validates feeds and fetches against a graph, keeps
//! the engine's copy of the graph current, and dispatches runs.

pub mod config;
pub mod feed;
pub mod handle;
mod mover;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use indexmap::IndexMap;
use log::{debug, info, warn};
use prost::Message;
use regex::Regex;

use crate::engine::{EngineError, ExecutionEngine, RunMetadata, RunOptions};
use crate::error::{OpError, SessionError};
use crate::fetch::expansion::{ExpansionTable, TypeExpansion};
use crate::fetch::handler::FetchHandler;
use crate::fetch::{Element, Fetch, FetchValue};
use crate::graph::proto::GraphDef;
use crate::graph::{Graph, TensorRef};
use crate::session::config::SessionConfig;
use crate::session::feed::{FeedDict, FeedKey, FeedValue, resolve_feed_key, validate_feeds};
use crate::session::handle::{DeadHandleCollector, device_of, handle_deleter};

/// Identifies a partial run registered with `Session::partial_run_setup`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartialRunHandle(String);

impl PartialRunHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn node_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[\[Node: ([^ ]*?) =").ok())
        .as_ref()
}

struct ExtendState {
    opened: bool,
    current_version: u64,
}

/// State shared between a `Session` and the tensor handles it hands out.
pub struct SessionShared {
    graph: Arc<Graph>,
    engine: Arc<dyn ExecutionEngine>,
    config: SessionConfig,
    expansions: RwLock<ExpansionTable>,
    extend_lock: Mutex<ExtendState>,
    closed: AtomicBool,
    dead_handles: DeadHandleCollector,
}

impl SessionShared {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn check_usable(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Runtime("Attempted to use a closed Session.".to_string()));
        }
        if self.graph.version() == 0 {
            return Err(SessionError::Runtime(
                "The Session graph is empty.  Add operations to the graph before calling run().".to_string(),
            ));
        }
        Ok(())
    }

    /// Attributes an engine failure to a graph node when the message names one.
    fn translate_error(&self, err: EngineError) -> SessionError {
        let mut op_error = OpError::from(err);
        let node_name = node_name_pattern()
            .and_then(|re| re.captures(op_error.message()))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        if let Some(name) = node_name {
            if let Some(node) = self.graph.node(&name) {
                op_error = op_error.with_node(name, node.to_node_def(false));
            }
        }
        SessionError::Op(op_error)
    }

    fn do_call<T>(&self, f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, SessionError> {
        f().map_err(|e| self.translate_error(e))
    }

    /// Sends nodes added since the last extension to the engine.
    fn extend_graph(&self) -> Result<(), SessionError> {
        let mut state = self.extend_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Runtime("Attempted to use a closed Session.".to_string()));
        }
        if self.graph.version() > state.current_version {
            let (graph_def, version) = self.graph.as_graph_def(state.current_version, self.config.infer_shapes);
            debug!(
                "Extending session graph from version {} to {} ({} new nodes)",
                state.current_version,
                version,
                graph_def.node.len()
            );
            let payload = graph_def.encode_to_vec();
            self.do_call(|| self.engine.extend(&payload))?;
            if !state.opened {
                info!("Session opened against target '{}'", self.config.target);
            }
            state.current_version = version;
            state.opened = true;
        }
        Ok(())
    }

    pub(crate) fn run_impl(
        self: &Arc<Self>,
        partial: Option<&PartialRunHandle>,
        fetches: &Fetch,
        feed_dict: &FeedDict,
        options: Option<&RunOptions>,
        metadata: Option<&mut RunMetadata>,
    ) -> Result<FetchValue, SessionError> {
        self.check_usable()?;

        let expansions = self.expansions.read().unwrap_or_else(PoisonError::into_inner);
        let mut feeds = validate_feeds(&self.graph, &expansions, feed_dict)?;
        let handler = FetchHandler::new(&self.graph, fetches, &feeds.table, &expansions)?;
        drop(expansions);

        let _moved = mover::update_with_movers(self, &mut feeds.table, &feeds.handles, &feeds.tensors)?;

        let fetch_names: Vec<String> = handler.final_fetches().iter().map(TensorRef::name).collect();
        let target_names: Vec<String> = handler.targets().iter().map(|o| o.name().to_string()).collect();

        let raw = match partial {
            Some(handle) => {
                if !target_names.is_empty() {
                    return Err(SessionError::Runtime("partial_run() requires empty target_list.".to_string()));
                }
                if fetch_names.is_empty() && feeds.table.is_empty() {
                    vec![]
                } else {
                    self.do_call(|| self.engine.partial_execute(handle.as_str(), &feeds.table, &fetch_names))?
                }
            }
            None => {
                if fetch_names.is_empty() && target_names.is_empty() {
                    debug!("Nothing to fetch or run; skipping dispatch");
                    vec![]
                } else {
                    self.extend_graph()?;
                    let default_options = RunOptions::default();
                    let options = options.unwrap_or(&default_options);
                    let output = self.do_call(|| {
                        self.engine.execute(&target_names, &fetch_names, &feeds.table, options)
                    })?;
                    if let Some(metadata) = metadata {
                        *metadata = output.metadata;
                    }
                    output.values
                }
            }
        };

        handler.build_results(self, &feeds.table, &feeds.handles, raw)
    }

    fn partial_run_setup(self: &Arc<Self>, fetches: &Fetch, feeds: &[FeedKey]) -> Result<PartialRunHandle, SessionError> {
        self.check_usable()?;

        fn flatten(key: &FeedKey, out: &mut Vec<Element>) {
            match key {
                FeedKey::Element(e) => out.push(e.clone()),
                FeedKey::Tuple(keys) => keys.iter().for_each(|k| flatten(k, out)),
            }
        }
        let mut keys = vec![];
        feeds.iter().for_each(|k| flatten(k, &mut keys));

        let expansions = self.expansions.read().unwrap_or_else(PoisonError::into_inner);
        let mut feed_names = vec![];
        for key in &keys {
            for sub_key in expansions.lookup(key).feed_keys(key) {
                feed_names.push(resolve_feed_key(&self.graph, &sub_key)?.name());
            }
        }
        let handler = FetchHandler::new(&self.graph, fetches, &IndexMap::new(), &expansions)?;
        drop(expansions);

        self.extend_graph()?;
        let fetch_names: Vec<String> = handler.final_fetches().iter().map(TensorRef::name).collect();
        let target_names: Vec<String> = handler.targets().iter().map(|o| o.name().to_string()).collect();
        let handle = self.do_call(|| self.engine.partial_setup(&feed_names, &fetch_names, &target_names))?;
        Ok(PartialRunHandle(handle))
    }

    /// Queues `handle` for deletion, deleting the whole queue in one run once
    /// it is full. Handles of a closed session are dropped.
    pub(crate) fn register_dead_handle(self: &Arc<Self>, handle: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(batch) = self.dead_handles.register(handle) else {
            return;
        };
        if let Err(e) = self.delete_handles(batch) {
            warn!("Failed to delete dead tensor handles: {e}");
        }
    }

    fn delete_handles(self: &Arc<Self>, handles: Vec<String>) -> Result<(), SessionError> {
        let mut by_device: IndexMap<String, Vec<String>> = IndexMap::new();
        for handle in handles {
            by_device.entry(device_of(&handle).to_string()).or_default().push(handle);
        }
        let mut feeds = FeedDict::new();
        let mut deleters = vec![];
        for (device, handles) in by_device {
            let (holder, deleter) = handle_deleter(&self.graph, &device)?;
            feeds.insert(holder, FeedValue::from(handles));
            deleters.push(deleter);
        }
        debug!("Deleting dead tensor handles on {} devices", deleters.len());
        self.run_impl(None, &Fetch::list(deleters), &feeds, None, None)?;
        Ok(())
    }

    fn close(&self) -> Result<(), SessionError> {
        let state = self.extend_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.dead_handles.abandon();
        if state.opened {
            self.engine.close().map_err(|e| self.translate_error(e))?;
            info!("Session closed");
        }
        Ok(())
    }
}

/// A connection to an execution engine, bound to one graph.
///
/// Runs may be issued from several threads at once. Dropping the session
/// closes it.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Connects to the engine named by `config.target`.
    pub fn new(graph: Arc<Graph>, config: SessionConfig) -> Result<Self, SessionError> {
        let engine = crate::engine::connect(&config)?;
        Ok(Self::with_engine(graph, engine, config))
    }

    pub fn with_engine(graph: Arc<Graph>, engine: Arc<dyn ExecutionEngine>, config: SessionConfig) -> Self {
        let dead_handles = DeadHandleCollector::new(config.dead_handle_threshold);
        Self {
            shared: Arc::new(SessionShared {
                graph,
                engine,
                config,
                expansions: RwLock::new(ExpansionTable::default()),
                extend_lock: Mutex::new(ExtendState {
                    opened: false,
                    current_version: 0,
                }),
                closed: AtomicBool::new(false),
                dead_handles,
            }),
        }
    }

    /// Registers a composite type ahead of the built-in expansions.
    pub fn register_expansion(&self, expansion: Arc<dyn TypeExpansion>) {
        self.shared
            .expansions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .prepend(expansion);
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.shared.graph
    }

    /// The full graph as it would be sent to a fresh engine.
    pub fn graph_def(&self) -> GraphDef {
        self.shared.graph.as_graph_def(0, self.shared.config.infer_shapes).0
    }

    pub fn target(&self) -> &str {
        &self.shared.config.target
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Dead handles waiting for the next batched deletion.
    pub fn pending_dead_handles(&self) -> usize {
        self.shared.dead_handles.pending()
    }

    pub fn run(&self, fetches: impl Into<Fetch>, feed_dict: &FeedDict) -> Result<FetchValue, SessionError> {
        self.shared.run_impl(None, &fetches.into(), feed_dict, None, None)
    }

    pub fn run_with_options(
        &self,
        fetches: impl Into<Fetch>,
        feed_dict: &FeedDict,
        options: &RunOptions,
        metadata: Option<&mut RunMetadata>,
    ) -> Result<FetchValue, SessionError> {
        self.shared
            .run_impl(None, &fetches.into(), feed_dict, Some(options), metadata)
    }

    /// Registers the feeds and fetches a sequence of `partial_run` calls will
    /// use. Extends the graph; later partial runs do not.
    pub fn partial_run_setup(&self, fetches: impl Into<Fetch>, feeds: &[FeedKey]) -> Result<PartialRunHandle, SessionError> {
        self.shared.partial_run_setup(&fetches.into(), feeds)
    }

    pub fn partial_run(
        &self,
        handle: &PartialRunHandle,
        fetches: impl Into<Fetch>,
        feed_dict: &FeedDict,
    ) -> Result<FetchValue, SessionError> {
        self.shared
            .run_impl(Some(handle), &fetches.into(), feed_dict, None, None)
    }

    /// Closes the session. Later calls are no-ops.
    pub fn close(&self) -> Result<(), SessionError> {
        self.shared.close()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.shared.close() {
            warn!("Error closing session: {e}");
        }
    }
}
