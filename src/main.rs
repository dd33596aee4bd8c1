use std::sync::Arc;

use whisper_session::graph::ops;
use whisper_session::{FeedDict, Fetch, Graph, Session, SessionConfig, TensorValue};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let graph = Arc::new(Graph::new());
    let a = ops::variable(&graph, "a", &TensorValue::scalar(1.0f64))?;
    let b = ops::variable(&graph, "b", &TensorValue::scalar(2.0f64))?;
    let out = ops::add(&graph, "out", &a, &b)?;

    let session = Session::new(graph.clone(), SessionConfig::default())?;

    let result = session.run(Fetch::map([("x", &a), ("y", &out)]), &FeedDict::new())?;
    println!("x = {:?}, y = {:?}", result.get("x"), result.get("y"));

    let result = session.run(Fetch::map([("y", &out)]), &FeedDict::new().with(&a, 10.0))?;
    println!("with a fed as 10.0: y = {:?}", result.get("y"));

    session.close()?;
    Ok(())
}
