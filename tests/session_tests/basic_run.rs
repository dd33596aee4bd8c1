use std::sync::Arc;

use whisper_session::graph::ops;
use whisper_session::graph::shape::TensorShape;
use whisper_session::{
    DType, ErrorCode, FeedDict, Fetch, FetchValue, Graph, RunMetadata, RunOptions, SessionError, TensorValue,
};

use crate::session_tests::recording_engine::EngineCall;
use crate::session_tests::{Harness, assert_f64, assert_message};

fn variable_graph() -> (Arc<Graph>, whisper_session::TensorRef, whisper_session::TensorRef) {
    let graph = Arc::new(Graph::new());
    let a = ops::variable(&graph, "a", &TensorValue::scalar(1.0f64)).unwrap();
    let b = ops::variable(&graph, "b", &TensorValue::scalar(2.0f64)).unwrap();
    let out = ops::add(&graph, "out", &a, &b).unwrap();
    (graph, a, out)
}

pub fn test_variables_end_to_end(harness: &Harness) {
    let (graph, a, out) = variable_graph();
    let t = harness.open_default(graph);
    let result = t
        .session
        .run(Fetch::map([("x", &a), ("y", &out)]), &FeedDict::new())
        .unwrap();
    assert_eq!(result.len(), 2);
    assert_f64(result.get("x"), 1.0);
    assert_f64(result.get("y"), 3.0);

    let result = t
        .session
        .run(Fetch::map([("y", &out)]), &FeedDict::new().with(&a, 10.0))
        .unwrap();
    assert_f64(result.get("y"), 12.0);

    // Feeding overrides the variable for one run only.
    let result = t.session.run(&a, &FeedDict::new()).unwrap();
    assert_eq!(result.scalar::<f64>(), Some(1.0));
}

pub fn test_nested_structure_round_trip(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let c = ops::constant(&graph, "c", &TensorValue::scalar(3i64)).unwrap();
    let d = ops::constant(&graph, "d", &TensorValue::from_vec(vec![1.0f32, 2.0])).unwrap();
    let init = ops::no_op(&graph, "init", &[]).unwrap();
    let t = harness.open_default(graph);

    let fetch = Fetch::map([
        ("list", Fetch::list([&c, &c])),
        ("tuple", Fetch::tuple([Fetch::from(&d), Fetch::from(&init)])),
        ("pair", Fetch::named("Pair", [("first", &c), ("second", &d)])),
    ]);
    let result = t.session.run(fetch, &FeedDict::new()).unwrap();

    let list = result.get("list").unwrap();
    assert!(matches!(list, FetchValue::List(items) if items.len() == 2));
    assert_eq!(list.at(0).unwrap().scalar::<i64>(), Some(3));
    assert_eq!(list.at(1).unwrap().scalar::<i64>(), Some(3));

    let tuple = result.get("tuple").unwrap();
    assert!(matches!(tuple, FetchValue::Tuple(_)));
    assert_eq!(
        tuple.at(0).unwrap().as_tensor().unwrap().try_to_vec::<f32>().unwrap(),
        vec![1.0, 2.0]
    );
    assert!(tuple.at(1).unwrap().is_none());

    let pair = result.get("pair").unwrap();
    assert!(matches!(pair, FetchValue::Named { type_name, .. } if type_name == "Pair"));
    assert_eq!(pair.get("first").unwrap().scalar::<i64>(), Some(3));

    if let Some(recorder) = &t.recorder {
        assert_eq!(
            recorder.executes(),
            vec![EngineCall::Execute {
                targets: vec!["init".to_string()],
                fetches: vec!["c:0".to_string(), "d:0".to_string()],
                feeds: vec![],
            }]
        );
    }
}

pub fn test_fetch_by_name(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    ops::constant(&graph, "c", &TensorValue::scalar(7i32)).unwrap();
    let t = harness.open_default(graph);
    let result = t.session.run("c:0", &FeedDict::new()).unwrap();
    assert_eq!(result.scalar::<i32>(), Some(7));
    let result = t.session.run("c", &FeedDict::new()).unwrap();
    assert!(result.is_none());
}

pub fn test_unknown_fetch_is_rejected(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    ops::constant(&graph, "c", &TensorValue::scalar(7i32)).unwrap();
    let t = harness.open_default(graph);
    let err = t.session.run("missing:0", &FeedDict::new()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NotFound));
    let err = t.session.run(Fetch::None, &FeedDict::new()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidArgument));
}

pub fn test_extend_sends_only_new_nodes(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let a = ops::constant(&graph, "a", &TensorValue::scalar(1.0f32)).unwrap();
    let b = ops::constant(&graph, "b", &TensorValue::scalar(2.0f32)).unwrap();
    let t = harness.open_default(graph.clone());
    t.session.run(&a, &FeedDict::new()).unwrap();
    assert_eq!(t.local.node_count(), 2);

    let c = ops::add(&graph, "c", &a, &b).unwrap();
    let result = t.session.run(&c, &FeedDict::new()).unwrap();
    assert_eq!(result.scalar::<f32>(), Some(3.0));
    t.session.run(&c, &FeedDict::new()).unwrap();
    assert_eq!(t.local.node_count(), 3);

    if let Some(recorder) = &t.recorder {
        assert_eq!(recorder.extends(), vec![2, 1]);
    }
}

pub fn test_fed_fetches_skip_the_engine(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let x = ops::placeholder(&graph, "x", DType::F32, TensorShape::scalar()).unwrap();
    let one = ops::constant(&graph, "one", &TensorValue::scalar(1.0f32)).unwrap();
    let y = ops::add(&graph, "y", &x, &one).unwrap();
    let t = harness.open_default(graph);

    let result = t.session.run(&x, &FeedDict::new().with(&x, 5.0)).unwrap();
    assert_eq!(result.scalar::<f32>(), Some(5.0));
    if let Some(recorder) = &t.recorder {
        assert!(recorder.calls().is_empty());
    }

    let result = t
        .session
        .run(Fetch::list([&x, &y]), &FeedDict::new().with(&x, 5.0))
        .unwrap();
    assert_eq!(result.at(0).unwrap().scalar::<f32>(), Some(5.0));
    assert_eq!(result.at(1).unwrap().scalar::<f32>(), Some(6.0));
    if let Some(recorder) = &t.recorder {
        assert_eq!(
            recorder.executes(),
            vec![EngineCall::Execute {
                targets: vec![],
                fetches: vec!["y:0".to_string()],
                feeds: vec!["x:0".to_string()],
            }]
        );
    }
}

pub fn test_engine_errors_name_the_node(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let x = ops::placeholder(&graph, "x", DType::F32, TensorShape::unknown()).unwrap();
    let y = ops::placeholder(&graph, "y", DType::F32, TensorShape::unknown()).unwrap();
    let sum = ops::add(&graph, "sum", &x, &y).unwrap();
    let t = harness.open_default(graph);

    let feeds = FeedDict::new().with(&x, vec![1.0, 2.0]).with(&y, vec![1.0, 2.0, 3.0]);
    let err = t.session.run(&sum, &feeds).unwrap_err();
    match &err {
        SessionError::Op(op) => {
            assert_eq!(op.code(), ErrorCode::InvalidArgument);
            assert_eq!(op.node_name(), Some("sum"));
            assert_eq!(op.node_def().unwrap().op, "Add");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

pub fn test_unfetchable_ops(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let c = ops::constant(&graph, "c", &TensorValue::scalar(1i64)).unwrap();
    graph.prevent_fetching(&c.op());
    let t = harness.open_default(graph);
    let err = t.session.run(&c, &FeedDict::new()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::FailedPrecondition));
    assert_message(&err, "Operation 'c' has been marked as not fetchable.");
    if let Some(recorder) = &t.recorder {
        assert!(recorder.calls().is_empty());
    }
}

pub fn test_trace_fills_run_metadata(harness: &Harness) {
    let (graph, _, out) = variable_graph();
    let t = harness.open_default(graph);
    let mut metadata = RunMetadata::default();
    t.session
        .run_with_options(&out, &FeedDict::new(), &RunOptions { trace: true }, Some(&mut metadata))
        .unwrap();
    let names: Vec<_> = metadata.step_stats.iter().map(|s| s.node_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "out"]);

    let mut untraced = RunMetadata::default();
    t.session
        .run_with_options(&out, &FeedDict::new(), &RunOptions::default(), Some(&mut untraced))
        .unwrap();
    assert!(untraced.step_stats.is_empty());
}

pub fn test_concurrent_runs(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let x = ops::placeholder(&graph, "x", DType::I64, TensorShape::scalar()).unwrap();
    let two = ops::constant(&graph, "two", &TensorValue::scalar(2i64)).unwrap();
    let y = ops::mul(&graph, "y", &x, &two).unwrap();
    let t = harness.open_default(graph);

    std::thread::scope(|s| {
        for i in 0..8i64 {
            let session = &t.session;
            let y = &y;
            let x = &x;
            s.spawn(move || {
                for j in 0..10i64 {
                    let result = session.run(y, &FeedDict::new().with(x, i * 100 + j)).unwrap();
                    assert_eq!(result.scalar::<i64>(), Some(2 * (i * 100 + j)));
                }
            });
        }
    });

    if let Some(recorder) = &t.recorder {
        assert_eq!(recorder.extends().len(), 1);
        assert_eq!(recorder.executes().len(), 80);
    }
}

pub fn test_integer_overflow_wraps(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let x = ops::placeholder(&graph, "x", DType::I8, TensorShape::scalar()).unwrap();
    let y = ops::add(&graph, "y", &x, &x).unwrap();
    let z = ops::mul(&graph, "z", &y, &x).unwrap();
    let t = harness.open_default(graph);

    let result = t.session.run(&y, &FeedDict::new().with(&x, 100)).unwrap();
    assert_eq!(result.scalar::<i8>(), Some(-56));
    let result = t.session.run(&z, &FeedDict::new().with(&x, -128)).unwrap();
    assert_eq!(result.scalar::<i8>(), Some(0));
}
