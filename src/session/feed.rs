//! Feed dictionaries and their validation against the graph.

use std::collections::HashMap;

use crate::dtype::DType;
use crate::engine::{ErrorCode, FeedTable};
use crate::error::SessionError;
use crate::fetch::expansion::ExpansionTable;
use crate::fetch::{Element, IndexedSlices, IndexedSlicesValue, SparseTensor, SparseTensorValue};
use crate::graph::shape::format_value_shape;
use crate::graph::{Graph, GraphElement, OpRef, TensorRef};
use crate::session::handle::TensorHandle;
use crate::value::{Scalar, TensorValue};

/// Where a fed value goes: one element, or a nested tuple of keys matched
/// against an equally nested tuple value.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedKey {
    Element(Element),
    Tuple(Vec<FeedKey>),
}

macro_rules! feed_key_from_element {
    ($($t:ty),*) => {
        $(impl From<$t> for FeedKey {
            fn from(e: $t) -> Self {
                FeedKey::Element(e.into())
            }
        })*
    };
}

feed_key_from_element!(Element, TensorRef, &TensorRef, OpRef, &OpRef, &str, String, SparseTensor, IndexedSlices);

#[derive(Clone, Debug)]
pub enum FeedValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Nested host data; must be rectangular.
    List(Vec<FeedValue>),
    Tensor(TensorValue),
    Handle(TensorHandle),
    /// Components of a composite, or values for a `FeedKey::Tuple`.
    Tuple(Vec<FeedValue>),
    Sparse(SparseTensorValue),
    IndexedSlices(IndexedSlicesValue),
    /// A graph reference. Never valid as data.
    Reference(Element),
}

macro_rules! feed_value_from {
    ($($t:ty => $variant:ident),*) => {
        $(impl From<$t> for FeedValue {
            fn from(v: $t) -> Self {
                FeedValue::$variant(v.into())
            }
        })*
    };
}

feed_value_from!(
    i64 => Int, i32 => Int, f64 => Float, f32 => Float, bool => Bool, &str => Str, String => Str,
    TensorValue => Tensor, TensorHandle => Handle, SparseTensorValue => Sparse,
    IndexedSlicesValue => IndexedSlices, TensorRef => Reference, OpRef => Reference
);

impl<T: Into<FeedValue>> From<Vec<T>> for FeedValue {
    fn from(v: Vec<T>) -> Self {
        FeedValue::List(v.into_iter().map(Into::into).collect())
    }
}

#[derive(Clone, Debug, Default)]
pub struct FeedDict {
    entries: Vec<(FeedKey, FeedValue)>,
}

impl FeedDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<FeedKey>, value: impl Into<FeedValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<FeedKey>, value: impl Into<FeedValue>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(FeedKey, FeedValue)> {
        self.entries.iter()
    }
}

/// Expands tuple keys so every entry has an element key.
pub fn flatten_dict_items(feed_dict: &FeedDict) -> Result<Vec<(Element, FeedValue)>, SessionError> {
    fn flatten(key: &FeedKey, value: &FeedValue, out: &mut Vec<(Element, FeedValue)>) -> Result<(), SessionError> {
        match key {
            FeedKey::Element(e) => out.push((e.clone(), value.clone())),
            FeedKey::Tuple(keys) => {
                let values = match value {
                    FeedValue::Tuple(v) | FeedValue::List(v) => v,
                    _ => {
                        return Err(SessionError::Value(format!(
                            "Could not flatten dictionary: key {key:?} is a sequence but its value is not"
                        )));
                    }
                };
                if keys.len() != values.len() {
                    return Err(SessionError::Value(format!(
                        "Could not flatten dictionary. Key had {} elements, but value had {} elements.",
                        keys.len(),
                        values.len()
                    )));
                }
                for (k, v) in keys.iter().zip(values) {
                    flatten(k, v, out)?;
                }
            }
        }
        Ok(())
    }
    let mut out = vec![];
    for (key, value) in feed_dict.iter() {
        flatten(key, value, &mut out)?;
    }
    Ok(out)
}

/// Resolves a primitive feed key to the tensor it feeds.
pub fn resolve_feed_key(graph: &Graph, key: &Element) -> Result<TensorRef, SessionError> {
    let resolved = match key {
        Element::Tensor(t) => graph.check_tensor(t)?,
        Element::Name(name) => graph.resolve_name(name, true, false)?,
        Element::Operation(op) => {
            return Err(SessionError::op(
                ErrorCode::InvalidArgument,
                format!("Cannot feed operation '{op}': feed keys must refer to Tensors"),
            ));
        }
        Element::Sparse(_) | Element::IndexedSlices(_) => {
            return Err(SessionError::op(
                ErrorCode::InvalidArgument,
                format!("Cannot interpret feed key {key:?} as a Tensor"),
            ));
        }
    };
    match resolved {
        GraphElement::Tensor(t) => Ok(t),
        GraphElement::Operation(op) => Err(SessionError::op(
            ErrorCode::InvalidArgument,
            format!("Cannot feed operation '{op}': feed keys must refer to Tensors"),
        )),
    }
}

/// Shape implied by following the first element of each nested list.
fn infer_shape(value: &FeedValue) -> Vec<usize> {
    let mut shape = vec![];
    let mut current = value;
    while let FeedValue::List(items) = current {
        shape.push(items.len());
        match items.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    shape
}

fn gather_scalars(value: &FeedValue, depth: usize, shape: &[usize], out: &mut Vec<Scalar>) -> Result<(), SessionError> {
    let scalar = match value {
        FeedValue::Int(v) => Scalar::Int(*v as i128),
        FeedValue::Float(v) => Scalar::Float(*v),
        FeedValue::Bool(v) => Scalar::Bool(*v),
        FeedValue::Str(v) => Scalar::Str(v.clone()),
        FeedValue::List(items) => {
            if shape.get(depth) != Some(&items.len()) {
                return Err(SessionError::Value("setting an array element with a sequence.".to_string()));
            }
            for item in items {
                gather_scalars(item, depth + 1, shape, out)?;
            }
            return Ok(());
        }
        other => {
            return Err(SessionError::op(
                ErrorCode::InvalidArgument,
                format!("Unsupported feed value element {other:?}"),
            ));
        }
    };
    if shape.len() != depth {
        return Err(SessionError::Value("setting an array element with a sequence.".to_string()));
    }
    out.push(scalar);
    Ok(())
}

/// Converts a primitive feed value to a tensor of `dtype`.
pub fn coerce(value: &FeedValue, dtype: DType) -> Result<TensorValue, SessionError> {
    match value {
        FeedValue::Tensor(t) => Ok(t.cast(dtype)?),
        FeedValue::Handle(h) => Ok(TensorValue::scalar(h.handle().to_string()).cast(dtype)?),
        FeedValue::Int(_) | FeedValue::Float(_) | FeedValue::Bool(_) | FeedValue::Str(_) | FeedValue::List(_) => {
            let shape = infer_shape(value);
            let mut scalars = vec![];
            gather_scalars(value, 0, &shape, &mut scalars)?;
            Ok(TensorValue::from_scalars(dtype, &shape, &scalars)?)
        }
        FeedValue::Reference(e) => Err(SessionError::Type(format!(
            "The value of a feed cannot be a graph reference ({e:?}). Acceptable feed values include host scalars, lists, tensor values and tensor handles."
        ))),
        other => Err(SessionError::op(
            ErrorCode::InvalidArgument,
            format!("Unsupported feed value type {other:?}"),
        )),
    }
}

/// Feeds after expansion and validation.
#[derive(Default)]
pub struct ValidatedFeeds {
    /// Values keyed by tensor name, ready for the engine.
    pub table: FeedTable,
    /// Fed tensor handles keyed by tensor name.
    pub handles: HashMap<String, TensorHandle>,
    pub tensors: HashMap<String, TensorRef>,
}

/// Checks every feed against the graph. The first failure is returned and
/// nothing is dispatched.
pub fn validate_feeds(
    graph: &Graph,
    table: &ExpansionTable,
    feed_dict: &FeedDict,
) -> Result<ValidatedFeeds, SessionError> {
    let mut validated = ValidatedFeeds::default();
    for (key, value) in flatten_dict_items(feed_dict)? {
        for (sub_key, sub_value) in table.lookup(&key).feed_expand(&key, value)? {
            let tensor = resolve_feed_key(graph, &sub_key)?;
            let spec = graph.output_spec(&tensor)?;
            if let FeedValue::Reference(e) = &sub_value {
                return Err(SessionError::Type(format!(
                    "The value of a feed cannot be a graph reference ({e:?}). Acceptable feed values include host scalars, lists, tensor values and tensor handles."
                )));
            }
            if let FeedValue::Int(v) = sub_value {
                if !spec.dtype.represents_integer(v) {
                    return Err(SessionError::Type(format!(
                        "Type of feed value {v} is not compatible with Tensor type {}. Try explicitly setting the type of the feed tensor to a larger type (e.g. int64).",
                        spec.dtype
                    )));
                }
            }
            let value = coerce(&sub_value, spec.dtype)?;
            if !spec.shape.is_compatible_with(&value.shape()) {
                return Err(SessionError::Value(format!(
                    "Cannot feed value of shape {} for Tensor '{tensor}', which has shape '{}'",
                    format_value_shape(&value.shape()),
                    spec.shape
                )));
            }
            if !graph.is_feedable(&tensor) {
                return Err(SessionError::Value(format!("Tensor {tensor} may not be fed.")));
            }
            let name = tensor.name();
            if let FeedValue::Handle(h) = sub_value {
                validated.handles.insert(name.clone(), h);
            }
            validated.table.insert(name.clone(), value);
            validated.tensors.insert(name, tensor);
        }
    }
    Ok(validated)
}
