use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::engine::ErrorCode;
use crate::error::SessionError;
use crate::fetch::expansion::{ExpansionTable, TypeExpansion};
use crate::fetch::{Element, Fetch, FetchValue};
use crate::graph::{Graph, GraphElement};

/// Resolves a primitive element against the graph. Composite elements are
/// rejected here; they must have been decomposed first.
pub fn resolve_element(graph: &Graph, element: &Element) -> Result<GraphElement, SessionError> {
    Ok(match element {
        Element::Tensor(t) => graph.check_tensor(t)?,
        Element::Operation(o) => graph.check_op(o)?,
        Element::Name(name) => graph.resolve_name(name, true, true)?,
        Element::Sparse(_) | Element::IndexedSlices(_) => {
            return Err(SessionError::op(
                ErrorCode::InvalidArgument,
                format!("Fetch argument {element:?} has invalid type: nested composite"),
            ));
        }
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContainerKind {
    List,
    Tuple,
    Named { type_name: String, fields: Vec<String> },
    Map { keys: Vec<String> },
}

/// Collapses duplicates across several element lists. Returns the unique
/// elements in first-seen order, and for each input list the positions of its
/// elements in that unique list.
fn uniquify<'a>(lists: impl Iterator<Item = &'a [GraphElement]>) -> (Vec<GraphElement>, Vec<Vec<usize>>) {
    let mut unique = vec![];
    let mut seen: HashMap<GraphElement, usize> = HashMap::new();
    let value_indices = lists
        .map(|list| {
            list.iter()
                .map(|e| {
                    *seen.entry(e.clone()).or_insert_with(|| {
                        unique.push(e.clone());
                        unique.len() - 1
                    })
                })
                .collect()
        })
        .collect();
    (unique, value_indices)
}

pub enum FetchMapper {
    Element {
        unique: Vec<GraphElement>,
        expansion: Arc<dyn TypeExpansion>,
    },
    Container {
        kind: ContainerKind,
        mappers: Vec<FetchMapper>,
        unique: Vec<GraphElement>,
        value_indices: Vec<Vec<usize>>,
    },
}

impl FetchMapper {
    pub fn for_fetch(fetch: &Fetch, graph: &Graph, table: &ExpansionTable) -> Result<Self, SessionError> {
        let (kind, children): (ContainerKind, Vec<&Fetch>) = match fetch {
            Fetch::None => {
                return Err(SessionError::op(
                    ErrorCode::InvalidArgument,
                    "Fetch argument None has invalid type",
                ));
            }
            Fetch::Element(element) => {
                let expansion = table.lookup(element);
                let unique = expansion
                    .decompose(element)
                    .iter()
                    .map(|e| resolve_element(graph, e))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(FetchMapper::Element { unique, expansion });
            }
            Fetch::List(items) => (ContainerKind::List, items.iter().collect()),
            Fetch::Tuple(items) => (ContainerKind::Tuple, items.iter().collect()),
            Fetch::Named { type_name, fields } => (
                ContainerKind::Named {
                    type_name: type_name.clone(),
                    fields: fields.iter().map(|(k, _)| k.clone()).collect(),
                },
                fields.iter().map(|(_, v)| v).collect(),
            ),
            Fetch::Map(map) => (
                ContainerKind::Map { keys: map.keys().cloned().collect() },
                map.values().collect(),
            ),
        };
        let mappers = children
            .into_iter()
            .map(|f| FetchMapper::for_fetch(f, graph, table))
            .collect::<Result<Vec<_>, _>>()?;
        let (unique, value_indices) = uniquify(mappers.iter().map(|m| m.unique_fetches()));
        Ok(FetchMapper::Container {
            kind,
            mappers,
            unique,
            value_indices,
        })
    }

    pub fn unique_fetches(&self) -> &[GraphElement] {
        match self {
            FetchMapper::Element { unique, .. } => unique,
            FetchMapper::Container { unique, .. } => unique,
        }
    }

    /// `values` must line up with `unique_fetches()`.
    pub fn build_results(&self, values: &[FetchValue]) -> Result<FetchValue, SessionError> {
        if values.len() != self.unique_fetches().len() {
            return Err(SessionError::op(
                ErrorCode::Internal,
                format!(
                    "Fetch mapper expected {} values, got {}",
                    self.unique_fetches().len(),
                    values.len()
                ),
            ));
        }
        match self {
            FetchMapper::Element { expansion, .. } => expansion.recompose(values.to_vec()),
            FetchMapper::Container {
                kind,
                mappers,
                value_indices,
                ..
            } => {
                let results = mappers
                    .iter()
                    .zip(value_indices)
                    .map(|(m, indices)| {
                        let sub_values: Vec<FetchValue> = indices.iter().map(|i| values[*i].clone()).collect();
                        m.build_results(&sub_values)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(match kind {
                    ContainerKind::List => FetchValue::List(results),
                    ContainerKind::Tuple => FetchValue::Tuple(results),
                    ContainerKind::Named { type_name, fields } => FetchValue::Named {
                        type_name: type_name.clone(),
                        fields: fields.iter().cloned().zip(results).collect(),
                    },
                    ContainerKind::Map { keys } => {
                        FetchValue::Map(keys.iter().cloned().zip(results).collect::<IndexMap<_, _>>())
                    }
                })
            }
        }
    }
}
