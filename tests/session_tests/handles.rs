use std::sync::Arc;

use whisper_session::graph::ops;
use whisper_session::{DType, FeedDict, Fetch, Graph, SessionConfig, TensorHandle, TensorRef, TensorValue};

use crate::session_tests::Harness;
use crate::session_tests::recording_engine::EngineCall;

fn handle_graph() -> (Arc<Graph>, TensorRef) {
    let graph = Arc::new(Graph::new());
    let c = ops::constant(&graph, "c", &TensorValue::from_vec(vec![1.0f32, 2.0, 3.0])).unwrap();
    let h = ops::get_session_handle(&graph, "h", &c, None).unwrap();
    (graph, h)
}

pub fn test_handle_eval_and_delete(harness: &Harness) {
    let (graph, h) = handle_graph();
    let t = harness.open_default(graph);
    let result = t.session.run(&h, &FeedDict::new()).unwrap();
    let handle = result.as_handle().unwrap().clone();
    assert_eq!(handle.dtype(), DType::F32);
    assert_eq!(handle.device_name(), "/device:CPU:0");
    assert_eq!(t.local.live_handle_count(), 1);

    let value = handle.eval().unwrap();
    assert_eq!(value.try_to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);

    handle.delete().unwrap();
    assert_eq!(t.local.live_handle_count(), 0);
    drop(handle);
    assert_eq!(t.session.pending_dead_handles(), 0);
}

pub fn test_handles_are_deleted_in_batches(harness: &Harness) {
    let (graph, h) = handle_graph();
    let config = SessionConfig {
        dead_handle_threshold: 3,
        ..SessionConfig::default()
    };
    let t = harness.open(graph, config);
    let mut handles: Vec<TensorHandle> = (0..3)
        .map(|_| t.session.run(&h, &FeedDict::new()).unwrap().as_handle().unwrap().clone())
        .collect();
    assert_eq!(t.local.live_handle_count(), 3);
    let runs_before = t.recorder.as_ref().map(|r| r.executes().len());

    // Clones keep the handle alive.
    let extra = handles[0].clone();
    handles.remove(0);
    assert_eq!(t.session.pending_dead_handles(), 0);
    drop(extra);
    handles.remove(0);
    assert_eq!(t.session.pending_dead_handles(), 2);
    assert_eq!(t.local.live_handle_count(), 3);
    if let Some(recorder) = &t.recorder {
        assert_eq!(Some(recorder.executes().len()), runs_before);
    }

    handles.clear();
    assert_eq!(t.session.pending_dead_handles(), 0);
    assert_eq!(t.local.live_handle_count(), 0);
    if let Some(recorder) = &t.recorder {
        let executes = recorder.executes();
        assert_eq!(Some(executes.len()), runs_before.map(|n| n + 1));
        let EngineCall::Execute { targets, feeds, .. } = &executes[executes.len() - 1] else {
            panic!("expected an execute call");
        };
        assert_eq!(targets.len(), 1);
        assert_eq!(feeds.len(), 1);
    }
}

pub fn test_fed_handles_round_trip(harness: &Harness) {
    let (graph, h) = handle_graph();
    let (holder, reader) = ops::get_session_tensor(&graph, DType::F32, None).unwrap();
    let t = harness.open_default(graph);
    let handle = t.session.run(&h, &FeedDict::new()).unwrap().as_handle().unwrap().clone();

    let result = t
        .session
        .run(Fetch::list([&holder, &reader]), &FeedDict::new().with(&holder, handle.clone()))
        .unwrap();
    assert_eq!(result.at(0).unwrap().as_handle().unwrap().handle(), handle.handle());
    assert_eq!(
        result.at(1).unwrap().as_tensor().unwrap().try_to_vec::<f32>().unwrap(),
        vec![1.0, 2.0, 3.0]
    );
}

pub fn test_handles_move_to_the_feeder_device(harness: &Harness) {
    let (graph, h) = handle_graph();
    let (holder, reader) = graph.with_device("/device:GPU:0", || ops::get_session_tensor(&graph, DType::F32, None)).unwrap();
    let doubled = graph
        .with_device("/device:GPU:0", || ops::add(&graph, "doubled", &reader, &reader))
        .unwrap();
    let t = harness.open_default(graph.clone());
    let handle = t.session.run(&h, &FeedDict::new()).unwrap().as_handle().unwrap().clone();
    assert_eq!(handle.device_name(), "/device:CPU:0");
    let nodes_before = graph.nodes().len();

    let feeds = FeedDict::new().with(&holder, handle.clone());
    let result = t.session.run(&doubled, &feeds).unwrap();
    assert_eq!(
        result.as_tensor().unwrap().try_to_vec::<f32>().unwrap(),
        vec![2.0, 4.0, 6.0]
    );
    let nodes_after_move = graph.nodes().len();
    assert!(nodes_after_move > nodes_before);

    // The mover is built once per feeder, handle name and device.
    t.session.run(&doubled, &feeds).unwrap();
    assert_eq!(graph.nodes().len(), nodes_after_move);
}

pub fn test_moves_are_batched_into_one_dispatch(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let c1 = ops::constant(&graph, "c1", &TensorValue::from_vec(vec![1.0f32, 2.0, 3.0])).unwrap();
    let c2 = ops::constant(&graph, "c2", &TensorValue::from_vec(vec![10.0f32, 20.0, 30.0])).unwrap();
    let h1 = ops::get_session_handle(&graph, "h1", &c1, None).unwrap();
    let h2 = ops::get_session_handle(&graph, "h2", &c2, None).unwrap();
    let (holder_a, reader_a) = ops::get_session_tensor(&graph, DType::F32, Some("/device:GPU:0")).unwrap();
    let (holder_b, reader_b) = ops::get_session_tensor(&graph, DType::F32, Some("/device:GPU:1")).unwrap();
    let sum = graph
        .with_device("/device:GPU:0", || ops::add(&graph, "sum", &reader_a, &reader_b))
        .unwrap();
    let t = harness.open_default(graph.clone());

    let first = t.session.run(&h1, &FeedDict::new()).unwrap().as_handle().unwrap().clone();
    let second = t.session.run(&h2, &FeedDict::new()).unwrap().as_handle().unwrap().clone();
    assert_eq!(first.device_name(), "/device:CPU:0");
    assert_eq!(second.device_name(), "/device:CPU:0");
    let executes_before = t.recorder.as_ref().map(|r| r.executes().len());

    let feeds = FeedDict::new().with(&holder_a, first.clone()).with(&holder_b, second.clone());
    let result = t.session.run(&sum, &feeds).unwrap();
    assert_eq!(
        result.as_tensor().unwrap().try_to_vec::<f32>().unwrap(),
        vec![11.0, 22.0, 33.0]
    );
    // The moved copies are released with the run that used them.
    assert_eq!(t.session.pending_dead_handles(), 2);
    assert_eq!(t.local.live_handle_count(), 4);

    if let Some(recorder) = &t.recorder {
        let executes = recorder.executes();
        let before = executes_before.unwrap();
        assert_eq!(executes.len(), before + 2);
        let EngineCall::Execute { targets, fetches, feeds } = &executes[before] else {
            panic!("expected an execute call");
        };
        assert!(targets.is_empty());
        assert_eq!(fetches.len(), 2);
        assert!(fetches.iter().all(|f| f.starts_with("GetSessionHandle")));
        assert_eq!(feeds.len(), 2);
        assert!(!feeds.contains(&holder_a.name()) && !feeds.contains(&holder_b.name()));
        let EngineCall::Execute { fetches, feeds, .. } = &executes[before + 1] else {
            panic!("expected an execute call");
        };
        assert_eq!(fetches, &vec![sum.name()]);
        assert_eq!(feeds, &vec![holder_a.name(), holder_b.name()]);
    }

    let moved = graph
        .nodes()
        .iter()
        .filter(|n| n.op_type() == "GetSessionHandle" && n.name().starts_with("GetSessionHandle"))
        .map(|n| n.device().to_string())
        .collect::<Vec<_>>();
    assert_eq!(moved, vec!["/device:GPU:0", "/device:GPU:1"]);
}
