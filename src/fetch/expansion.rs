//! Registered type expansions: how composite fetch and feed types break down
//! into primitive references and how their values are put back together.

use std::sync::Arc;

use crate::engine::ErrorCode;
use crate::error::SessionError;
use crate::fetch::{Element, FetchValue, IndexedSlicesValue, SparseTensorValue};
use crate::session::feed::FeedValue;
use crate::value::TensorValue;

pub trait TypeExpansion: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, element: &Element) -> bool;

    /// Primitive elements (tensors, operations or names) standing for `element`.
    fn decompose(&self, element: &Element) -> Vec<Element>;

    /// Rebuilds one value from the values of `decompose`'s elements, in order.
    fn recompose(&self, values: Vec<FetchValue>) -> Result<FetchValue, SessionError>;

    /// Pairs each primitive key of `key` with the part of `value` it receives.
    fn feed_expand(&self, key: &Element, value: FeedValue) -> Result<Vec<(Element, FeedValue)>, SessionError>;

    /// Primitive keys used when only the feed keys are known.
    fn feed_keys(&self, key: &Element) -> Vec<Element> {
        self.decompose(key)
    }
}

fn component(value: FetchValue, expansion: &str) -> Result<TensorValue, SessionError> {
    value.into_tensor().ok_or_else(|| {
        SessionError::op(
            ErrorCode::Internal,
            format!("{expansion} components must be tensor values"),
        )
    })
}

fn component_count_error(expansion: &str, expected: &str, got: usize) -> SessionError {
    SessionError::op(
        ErrorCode::Internal,
        format!("{expansion} expected {expected} components, got {got}"),
    )
}

fn tuple_feed_error(key: &Element, expected: &str) -> SessionError {
    SessionError::op(
        ErrorCode::InvalidArgument,
        format!("Feed value for {key:?} must be {expected}"),
    )
}

/// Treats the element as its own single component.
pub struct DefaultExpansion;

impl TypeExpansion for DefaultExpansion {
    fn name(&self) -> &str {
        "default"
    }

    fn matches(&self, _element: &Element) -> bool {
        true
    }

    fn decompose(&self, element: &Element) -> Vec<Element> {
        vec![element.clone()]
    }

    fn recompose(&self, mut values: Vec<FetchValue>) -> Result<FetchValue, SessionError> {
        match values.len() {
            1 => Ok(values.remove(0)),
            n => Err(component_count_error(self.name(), "1", n)),
        }
    }

    fn feed_expand(&self, key: &Element, value: FeedValue) -> Result<Vec<(Element, FeedValue)>, SessionError> {
        Ok(vec![(key.clone(), value)])
    }
}

pub struct SparseTensorExpansion;

impl TypeExpansion for SparseTensorExpansion {
    fn name(&self) -> &str {
        "SparseTensor"
    }

    fn matches(&self, element: &Element) -> bool {
        matches!(element, Element::Sparse(_))
    }

    fn decompose(&self, element: &Element) -> Vec<Element> {
        match element {
            Element::Sparse(s) => vec![
                Element::Tensor(s.indices.clone()),
                Element::Tensor(s.values.clone()),
                Element::Tensor(s.dense_shape.clone()),
            ],
            other => vec![other.clone()],
        }
    }

    fn recompose(&self, values: Vec<FetchValue>) -> Result<FetchValue, SessionError> {
        let n = values.len();
        let [indices, values, dense_shape]: [FetchValue; 3] =
            values.try_into().map_err(|_| component_count_error(self.name(), "3", n))?;
        Ok(FetchValue::Sparse(SparseTensorValue {
            indices: component(indices, self.name())?,
            values: component(values, self.name())?,
            dense_shape: component(dense_shape, self.name())?,
        }))
    }

    fn feed_expand(&self, key: &Element, value: FeedValue) -> Result<Vec<(Element, FeedValue)>, SessionError> {
        let keys = self.decompose(key);
        let parts = match value {
            FeedValue::Sparse(v) => vec![
                FeedValue::Tensor(v.indices),
                FeedValue::Tensor(v.values),
                FeedValue::Tensor(v.dense_shape),
            ],
            FeedValue::Tuple(parts) if parts.len() == 3 => parts,
            _ => return Err(tuple_feed_error(key, "a SparseTensorValue or a 3-tuple")),
        };
        Ok(keys.into_iter().zip(parts).collect())
    }
}

pub struct IndexedSlicesExpansion;

impl TypeExpansion for IndexedSlicesExpansion {
    fn name(&self) -> &str {
        "IndexedSlices"
    }

    fn matches(&self, element: &Element) -> bool {
        matches!(element, Element::IndexedSlices(_))
    }

    fn decompose(&self, element: &Element) -> Vec<Element> {
        match element {
            Element::IndexedSlices(s) => {
                let mut parts = vec![Element::Tensor(s.values.clone()), Element::Tensor(s.indices.clone())];
                if let Some(dense_shape) = &s.dense_shape {
                    parts.push(Element::Tensor(dense_shape.clone()));
                }
                parts
            }
            other => vec![other.clone()],
        }
    }

    fn recompose(&self, values: Vec<FetchValue>) -> Result<FetchValue, SessionError> {
        let n = values.len();
        if !(2..=3).contains(&n) {
            return Err(component_count_error(self.name(), "2 or 3", n));
        }
        let mut values = values.into_iter();
        let mut next = || -> Result<Option<TensorValue>, SessionError> {
            values.next().map(|v| component(v, "IndexedSlices")).transpose()
        };
        let (Some(values_part), Some(indices)) = (next()?, next()?) else {
            return Err(component_count_error(self.name(), "2 or 3", n));
        };
        Ok(FetchValue::IndexedSlices(IndexedSlicesValue {
            values: values_part,
            indices,
            dense_shape: next()?,
        }))
    }

    fn feed_expand(&self, key: &Element, value: FeedValue) -> Result<Vec<(Element, FeedValue)>, SessionError> {
        let keys = self.decompose(key);
        let parts = match value {
            FeedValue::IndexedSlices(v) => {
                let mut parts = vec![FeedValue::Tensor(v.values), FeedValue::Tensor(v.indices)];
                parts.extend(v.dense_shape.map(FeedValue::Tensor));
                parts
            }
            FeedValue::Tuple(parts) if (2..=3).contains(&parts.len()) => parts,
            _ => return Err(tuple_feed_error(key, "an IndexedSlicesValue or a 2- or 3-tuple")),
        };
        if parts.len() != keys.len() {
            return Err(tuple_feed_error(key, &format!("{} components", keys.len())));
        }
        Ok(keys.into_iter().zip(parts).collect())
    }
}

/// Ordered list of expansions, consulted first to last. A default entry that
/// matches everything is always consulted after the registered ones.
pub struct ExpansionTable {
    entries: Vec<Arc<dyn TypeExpansion>>,
    fallback: Arc<dyn TypeExpansion>,
}

impl ExpansionTable {
    pub fn empty() -> Self {
        Self {
            entries: vec![],
            fallback: Arc::new(DefaultExpansion),
        }
    }

    /// Adds `expansion` ahead of every existing entry.
    pub fn prepend(&mut self, expansion: Arc<dyn TypeExpansion>) {
        self.entries.insert(0, expansion);
    }

    pub fn lookup(&self, element: &Element) -> Arc<dyn TypeExpansion> {
        self.entries
            .iter()
            .find(|e| e.matches(element))
            .unwrap_or(&self.fallback)
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .chain(std::iter::once(&self.fallback))
            .map(|e| e.name().to_string())
            .collect()
    }
}

impl Default for ExpansionTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.prepend(Arc::new(IndexedSlicesExpansion));
        table.prepend(Arc::new(SparseTensorExpansion));
        table
    }
}
