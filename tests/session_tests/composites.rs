use std::sync::Arc;

use whisper_session::fetch::expansion::TypeExpansion;
use whisper_session::graph::ops;
use whisper_session::graph::shape::TensorShape;
use whisper_session::{
    DType, Element, FeedDict, FeedValue, Fetch, FetchValue, Graph, IndexedSlices, SessionError, SparseTensor,
    SparseTensorValue, TensorRef, TensorValue,
};

use crate::session_tests::Harness;
use crate::session_tests::recording_engine::EngineCall;

fn sparse_graph(graph: &Graph) -> SparseTensor {
    let indices =
        ops::constant(graph, "indices", &TensorValue::from_vec_shape(vec![0i64, 0, 1, 2], &[2, 2]).unwrap()).unwrap();
    let values = ops::constant(graph, "values", &TensorValue::from_vec(vec![1.0f32, 2.0])).unwrap();
    let dense_shape = ops::constant(graph, "dense_shape", &TensorValue::from_vec(vec![3i64, 4])).unwrap();
    SparseTensor {
        indices,
        values,
        dense_shape,
    }
}

pub fn test_fetch_sparse_tensor(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let sparse = sparse_graph(&graph);
    let t = harness.open_default(graph);
    let result = t
        .session
        .run(Fetch::list([Fetch::from(sparse.clone()), Fetch::from(&sparse.values)]), &FeedDict::new())
        .unwrap();
    let value = result.at(0).unwrap().as_sparse().unwrap();
    assert_eq!(value.indices.shape(), vec![2, 2]);
    assert_eq!(value.values.try_to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    assert_eq!(value.dense_shape.try_to_vec::<i64>().unwrap(), vec![3, 4]);
    assert_eq!(result.at(1).unwrap().as_tensor(), Some(&value.values));

    if let Some(recorder) = &t.recorder {
        let EngineCall::Execute { fetches, .. } = &recorder.executes()[0] else {
            panic!("expected an execute call");
        };
        assert_eq!(fetches, &["indices:0", "values:0", "dense_shape:0"]);
    }
}

pub fn test_feed_sparse_tensor(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let sparse = SparseTensor {
        indices: ops::placeholder(&graph, "sp/indices", DType::I64, TensorShape::unknown()).unwrap(),
        values: ops::placeholder(&graph, "sp/values", DType::F32, TensorShape::unknown()).unwrap(),
        dense_shape: ops::placeholder(&graph, "sp/shape", DType::I64, TensorShape::known(&[2])).unwrap(),
    };
    let doubled = ops::add(&graph, "doubled", &sparse.values, &sparse.values).unwrap();
    let t = harness.open_default(graph);

    let value = SparseTensorValue {
        indices: TensorValue::from_vec_shape(vec![0i64, 1], &[1, 2]).unwrap(),
        values: TensorValue::from_vec(vec![2.5f32]),
        dense_shape: TensorValue::from_vec(vec![2i64, 2]),
    };
    let feeds = FeedDict::new().with(sparse.clone(), value.clone());
    let result = t
        .session
        .run(Fetch::tuple([Fetch::from(sparse.clone()), Fetch::from(&doubled)]), &feeds)
        .unwrap();
    assert_eq!(result.at(0).unwrap().as_sparse(), Some(&value));
    assert_eq!(
        result.at(1).unwrap().as_tensor().unwrap().try_to_vec::<f32>().unwrap(),
        vec![5.0]
    );

    let short = FeedDict::new().with(sparse, FeedValue::Tuple(vec![1.into()]));
    assert!(t.session.run(&doubled, &short).is_err());
}

pub fn test_fetch_indexed_slices(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    let values = ops::constant(&graph, "values", &TensorValue::from_vec(vec![1.0f64, 2.0])).unwrap();
    let indices = ops::constant(&graph, "indices", &TensorValue::from_vec(vec![4i64, 7])).unwrap();
    let dense_shape = ops::constant(&graph, "dense_shape", &TensorValue::from_vec(vec![10i64])).unwrap();
    let t = harness.open_default(graph);

    let without_shape = IndexedSlices {
        values: values.clone(),
        indices: indices.clone(),
        dense_shape: None,
    };
    let with_shape = IndexedSlices {
        values,
        indices,
        dense_shape: Some(dense_shape),
    };
    let result = t
        .session
        .run(Fetch::list([without_shape, with_shape]), &FeedDict::new())
        .unwrap();
    let first = result.at(0).unwrap().as_indexed_slices().unwrap();
    assert_eq!(first.indices.try_to_vec::<i64>().unwrap(), vec![4, 7]);
    assert!(first.dense_shape.is_none());
    let second = result.at(1).unwrap().as_indexed_slices().unwrap();
    assert_eq!(second.values, first.values);
    assert_eq!(
        second.dense_shape.as_ref().unwrap().try_to_vec::<i64>().unwrap(),
        vec![10]
    );
}

/// Reads `"<prefix>/stats"` as the pair of tensors `<prefix>/mean:0` and
/// `<prefix>/var:0`.
struct StatsExpansion;

impl StatsExpansion {
    fn prefix(element: &Element) -> Option<&str> {
        match element {
            Element::Name(name) => name.strip_suffix("/stats"),
            _ => None,
        }
    }
}

impl TypeExpansion for StatsExpansion {
    fn name(&self) -> &str {
        "Stats"
    }

    fn matches(&self, element: &Element) -> bool {
        Self::prefix(element).is_some()
    }

    fn decompose(&self, element: &Element) -> Vec<Element> {
        let prefix = Self::prefix(element).unwrap_or_default();
        vec![
            TensorRef::new(format!("{prefix}/mean"), 0).into(),
            TensorRef::new(format!("{prefix}/var"), 0).into(),
        ]
    }

    fn recompose(&self, values: Vec<FetchValue>) -> Result<FetchValue, SessionError> {
        let [mean, var]: [FetchValue; 2] = values
            .try_into()
            .map_err(|_| SessionError::Value("Stats needs two components".to_string()))?;
        Ok(FetchValue::Named {
            type_name: "Stats".to_string(),
            fields: vec![("mean".to_string(), mean), ("var".to_string(), var)],
        })
    }

    fn feed_expand(&self, key: &Element, value: FeedValue) -> Result<Vec<(Element, FeedValue)>, SessionError> {
        match value {
            FeedValue::Tuple(parts) if parts.len() == 2 => Ok(self.decompose(key).into_iter().zip(parts).collect()),
            _ => Err(SessionError::Value("Stats feeds are 2-tuples".to_string())),
        }
    }
}

pub fn test_registered_expansion(harness: &Harness) {
    let graph = Arc::new(Graph::new());
    ops::constant(&graph, "layer/mean", &TensorValue::scalar(0.5f32)).unwrap();
    ops::constant(&graph, "layer/var", &TensorValue::scalar(0.25f32)).unwrap();
    let t = harness.open_default(graph);

    assert!(t.session.run("layer/stats", &FeedDict::new()).is_err());

    t.session.register_expansion(Arc::new(StatsExpansion));
    let result = t.session.run("layer/stats", &FeedDict::new()).unwrap();
    assert_eq!(result.get("mean").unwrap().scalar::<f32>(), Some(0.5));
    assert_eq!(result.get("var").unwrap().scalar::<f32>(), Some(0.25));

    let feeds = FeedDict::new().with(
        "layer/stats",
        FeedValue::Tuple(vec![FeedValue::Float(1.0), FeedValue::Float(2.0)]),
    );
    let result = t.session.run("layer/stats", &feeds).unwrap();
    assert_eq!(result.get("var").unwrap().scalar::<f32>(), Some(2.0));
}
