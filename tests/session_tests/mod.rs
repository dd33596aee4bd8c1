use std::sync::Arc;

use whisper_session::{ExecutionEngine, Graph, LocalEngine, Session, SessionConfig, SessionError};

pub mod basic_run;
pub mod composites;
pub mod handles;
pub mod lifecycle;
pub mod recording_engine;

use gated_engine::GatedEngine;
use recording_engine::RecordingEngine;

/// Which engine a scenario's sessions are opened against.
pub enum Harness {
    Local,
    Recording,
}

pub struct TestSession {
    pub session: Session,
    pub local: Arc<LocalEngine>,
    pub recorder: Option<Arc<RecordingEngine>>,
}

impl Harness {
    fn engine(&self, local: &Arc<LocalEngine>) -> (Arc<dyn ExecutionEngine>, Option<Arc<RecordingEngine>>) {
        match self {
            Harness::Local => (local.clone() as Arc<dyn ExecutionEngine>, None),
            Harness::Recording => {
                let recorder = Arc::new(RecordingEngine::new(local.clone()));
                let engine: Arc<dyn ExecutionEngine> = recorder.clone();
                (engine, Some(recorder))
            }
        }
    }

    pub fn open(&self, graph: Arc<Graph>, config: SessionConfig) -> TestSession {
        let local = Arc::new(LocalEngine::new(config.clone()));
        let (engine, recorder) = self.engine(&local);
        TestSession {
            session: Session::with_engine(graph, engine, config),
            local,
            recorder,
        }
    }

    pub fn open_default(&self, graph: Arc<Graph>) -> TestSession {
        self.open(graph, SessionConfig::default())
    }

    /// Opens a session whose runs wait inside the engine until it is closed.
    pub fn open_gated(&self, graph: Arc<Graph>) -> (TestSession, Arc<GatedEngine>) {
        let config = SessionConfig::default();
        let local = Arc::new(LocalEngine::new(config.clone()));
        let (engine, recorder) = self.engine(&local);
        let gate = Arc::new(GatedEngine::new(engine));
        let session = Session::with_engine(graph, gate.clone(), config);
        (TestSession { session, local, recorder }, gate)
    }
}

fn assert_f64(value: Option<&whisper_session::FetchValue>, expected: f64) {
    let actual = value
        .and_then(|v| v.as_tensor())
        .map(|t| t.to_scalar::<f64>().unwrap())
        .unwrap();
    assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
}

fn assert_message(err: &SessionError, fragment: &str) {
    let message = err.to_string();
    assert!(message.contains(fragment), "'{message}' does not contain '{fragment}'");
}
