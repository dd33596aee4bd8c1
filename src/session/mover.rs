//! Relocates fed tensor handles to the device of the placeholder they feed.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::engine::{ErrorCode, FeedTable};
use crate::error::SessionError;
use crate::fetch::{Fetch, FetchValue};
use crate::graph::TensorRef;
use crate::session::SessionShared;
use crate::session::feed::{FeedDict, FeedValue};
use crate::session::handle::{TensorHandle, handle_mover};
use crate::value::TensorValue;

/// Moves every fed handle that lives on the wrong device with a single extra
/// run, and points the affected feeds at the moved copies. The returned
/// handles must outlive the run that consumes them.
pub(crate) fn update_with_movers(
    session: &Arc<SessionShared>,
    table: &mut FeedTable,
    feed_handles: &HashMap<String, TensorHandle>,
    tensors: &HashMap<String, TensorRef>,
) -> Result<Vec<TensorHandle>, SessionError> {
    let graph = session.graph();
    let mut feeds = FeedDict::new();
    let mut moves = vec![];
    // Feed order keeps the batched move run deterministic.
    for name in table.keys() {
        let (Some(handle), Some(tensor)) = (feed_handles.get(name), tensors.get(name)) else {
            continue;
        };
        if let Some((holder, moved)) = handle_mover(graph, tensor, handle.handle())? {
            feeds.insert(holder, FeedValue::Str(handle.handle().to_string()));
            moves.push((name.clone(), moved));
        }
    }
    if moves.is_empty() {
        return Ok(vec![]);
    }
    debug!("Moving {} tensor handles to their feed devices", moves.len());
    let fetch = Fetch::list(moves.iter().map(|(_, moved)| moved.clone()));
    let result = session.run_impl(None, &fetch, &feeds, None, None)?;
    let mut handles = vec![];
    for (i, (name, _)) in moves.iter().enumerate() {
        let handle = match result.at(i) {
            Some(FetchValue::Handle(h)) => h.clone(),
            _ => {
                return Err(SessionError::op(
                    ErrorCode::Internal,
                    format!("Moving the handle fed to {name} did not produce a handle"),
                ));
            }
        };
        table.insert(name.clone(), TensorValue::scalar(handle.handle().to_string()));
        handles.push(handle);
    }
    Ok(handles)
}
