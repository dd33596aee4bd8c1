use std::io::Write;
use std::sync::Arc;

use whisper_session::graph::ops;
use whisper_session::{ErrorCode, ErrorKind, FeedDict, Graph, Session, SessionConfig, TensorValue};

use crate::session_tests::{Harness, assert_message};

fn constant_graph() -> (Arc<Graph>, whisper_session::TensorRef) {
    let graph = Arc::new(Graph::new());
    let c = ops::constant(&graph, "c", &TensorValue::scalar(1i64)).unwrap();
    (graph, c)
}

pub fn test_closed_session_rejects_runs(harness: &Harness) {
    let (graph, c) = constant_graph();
    let t = harness.open_default(graph);
    t.session.run(&c, &FeedDict::new()).unwrap();
    t.session.close().unwrap();
    assert!(t.session.is_closed());

    let err = t.session.run(&c, &FeedDict::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_message(&err, "Attempted to use a closed Session.");

    t.session.close().unwrap();
    if let Some(recorder) = &t.recorder {
        assert_eq!(recorder.close_count(), 1);
    }
}

pub fn test_unopened_session_closes_locally(harness: &Harness) {
    let (graph, _) = constant_graph();
    let t = harness.open_default(graph);
    t.session.close().unwrap();
    assert!(t.session.is_closed());
    if let Some(recorder) = &t.recorder {
        assert!(recorder.calls().is_empty());
    }
}

pub fn test_dropping_the_session_closes_it(harness: &Harness) {
    let (graph, c) = constant_graph();
    let t = harness.open_default(graph);
    t.session.run(&c, &FeedDict::new()).unwrap();
    let recorder = t.recorder.clone();
    drop(t.session);
    if let Some(recorder) = recorder {
        assert_eq!(recorder.close_count(), 1);
    }
}

pub fn test_empty_graph_is_rejected(harness: &Harness) {
    let t = harness.open_default(Arc::new(Graph::new()));
    let err = t.session.run("c:0", &FeedDict::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_message(&err, "The Session graph is empty.");
}

pub fn test_handles_dropped_after_close_are_abandoned(harness: &Harness) {
    let (graph, c) = constant_graph();
    let h = ops::get_session_handle(&graph, "h", &c, None).unwrap();
    let config = SessionConfig {
        dead_handle_threshold: 1,
        ..SessionConfig::default()
    };
    let t = harness.open(graph, config);
    let handle = t.session.run(&h, &FeedDict::new()).unwrap().as_handle().unwrap().clone();
    t.session.close().unwrap();
    drop(handle);
    assert_eq!(t.session.pending_dead_handles(), 0);
    assert_eq!(t.local.live_handle_count(), 1);
    if let Some(recorder) = &t.recorder {
        assert_eq!(recorder.executes().len(), 1);
    }
}

pub fn test_close_cancels_in_flight_runs(harness: &Harness) {
    let (graph, c) = constant_graph();
    let (t, gate) = harness.open_gated(graph);
    let session = &t.session;
    let c = &c;

    let errors: Vec<_> = std::thread::scope(|s| {
        let runs: Vec<_> = (0..2)
            .map(move |_| s.spawn(move || session.run(c, &FeedDict::new()).err()))
            .collect();
        gate.wait_for_parked(2);
        session.close().unwrap();
        runs.into_iter().map(|r| r.join().unwrap()).collect()
    });

    assert_eq!(errors.len(), 2);
    for err in errors {
        let err = err.unwrap();
        assert_eq!(err.code(), Some(ErrorCode::Cancelled));
        assert_eq!(err.kind(), ErrorKind::Op(ErrorCode::Cancelled));
    }
    assert!(session.is_closed());
    if let Some(recorder) = &t.recorder {
        assert_eq!(recorder.executes().len(), 2);
        assert_eq!(recorder.close_count(), 1);
    }
}

pub fn test_config_from_json_file(_harness: &Harness) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"target": "local", "dead_handle_threshold": 2, "infer_shapes": true}}"#
    )
    .unwrap();
    let config = SessionConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.dead_handle_threshold, 2);
    assert!(config.infer_shapes);

    let (graph, c) = constant_graph();
    let session = Session::new(graph, config).unwrap();
    assert_eq!(session.target(), "local");
    let def = session.graph_def();
    assert!(def.node[0].attr.contains_key("_output_shapes"));
    assert_eq!(session.run(&c, &FeedDict::new()).unwrap().scalar::<i64>(), Some(1));
}

pub fn test_unknown_target_is_unimplemented(_harness: &Harness) {
    let config = SessionConfig {
        target: "grpc://localhost:2222".to_string(),
        ..SessionConfig::default()
    };
    let err = Session::new(Arc::new(Graph::new()), config).err().unwrap();
    assert_eq!(err.code(), Some(ErrorCode::Unimplemented));
}
