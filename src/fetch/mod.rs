//! Fetch structures and the values they resolve to.

pub mod expansion;
pub mod handler;
pub mod mapper;

use indexmap::IndexMap;

use crate::graph::{OpRef, TensorRef};
use crate::session::handle::TensorHandle;
use crate::value::{TensorElement, TensorValue};

/// Three coordinated outputs standing for one sparse tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SparseTensor {
    pub indices: TensorRef,
    pub values: TensorRef,
    pub dense_shape: TensorRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexedSlices {
    pub values: TensorRef,
    pub indices: TensorRef,
    pub dense_shape: Option<TensorRef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SparseTensorValue {
    pub indices: TensorValue,
    pub values: TensorValue,
    pub dense_shape: TensorValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexedSlicesValue {
    pub values: TensorValue,
    pub indices: TensorValue,
    pub dense_shape: Option<TensorValue>,
}

/// A single fetchable thing: a primitive reference or a registered composite.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Element {
    Tensor(TensorRef),
    Operation(OpRef),
    /// `op:index` for a tensor, `op` for an operation.
    Name(String),
    Sparse(SparseTensor),
    IndexedSlices(IndexedSlices),
}

impl From<TensorRef> for Element {
    fn from(t: TensorRef) -> Self {
        Element::Tensor(t)
    }
}

impl From<&TensorRef> for Element {
    fn from(t: &TensorRef) -> Self {
        Element::Tensor(t.clone())
    }
}

impl From<OpRef> for Element {
    fn from(o: OpRef) -> Self {
        Element::Operation(o)
    }
}

impl From<&OpRef> for Element {
    fn from(o: &OpRef) -> Self {
        Element::Operation(o.clone())
    }
}

impl From<&str> for Element {
    fn from(name: &str) -> Self {
        Element::Name(name.to_string())
    }
}

impl From<String> for Element {
    fn from(name: String) -> Self {
        Element::Name(name)
    }
}

impl From<SparseTensor> for Element {
    fn from(s: SparseTensor) -> Self {
        Element::Sparse(s)
    }
}

impl From<IndexedSlices> for Element {
    fn from(s: IndexedSlices) -> Self {
        Element::IndexedSlices(s)
    }
}

/// A caller-supplied, arbitrarily nested request for values.
#[derive(Clone, Debug, PartialEq)]
pub enum Fetch {
    None,
    Element(Element),
    List(Vec<Fetch>),
    Tuple(Vec<Fetch>),
    Named {
        type_name: String,
        fields: Vec<(String, Fetch)>,
    },
    Map(IndexMap<String, Fetch>),
}

impl Fetch {
    pub fn list<T: Into<Fetch>>(items: impl IntoIterator<Item = T>) -> Self {
        Fetch::List(items.into_iter().map(Into::into).collect())
    }

    pub fn tuple<T: Into<Fetch>>(items: impl IntoIterator<Item = T>) -> Self {
        Fetch::Tuple(items.into_iter().map(Into::into).collect())
    }

    pub fn map<K: Into<String>, T: Into<Fetch>>(items: impl IntoIterator<Item = (K, T)>) -> Self {
        Fetch::Map(items.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn named<K: Into<String>, T: Into<Fetch>>(
        type_name: &str,
        fields: impl IntoIterator<Item = (K, T)>,
    ) -> Self {
        Fetch::Named {
            type_name: type_name.to_string(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

macro_rules! fetch_from_element {
    ($($t:ty),*) => {
        $(impl From<$t> for Fetch {
            fn from(e: $t) -> Self {
                Fetch::Element(e.into())
            }
        })*
    };
}

fetch_from_element!(Element, TensorRef, &TensorRef, OpRef, &OpRef, &str, String, SparseTensor, IndexedSlices);

impl From<Vec<Fetch>> for Fetch {
    fn from(items: Vec<Fetch>) -> Self {
        Fetch::List(items)
    }
}

/// The result of a fetch, shaped like the `Fetch` that requested it.
#[derive(Clone, Debug)]
pub enum FetchValue {
    /// Produced for operation fetches.
    None,
    Tensor(TensorValue),
    Handle(TensorHandle),
    Sparse(SparseTensorValue),
    IndexedSlices(IndexedSlicesValue),
    List(Vec<FetchValue>),
    Tuple(Vec<FetchValue>),
    Named {
        type_name: String,
        fields: Vec<(String, FetchValue)>,
    },
    Map(IndexMap<String, FetchValue>),
}

impl FetchValue {
    pub fn is_none(&self) -> bool {
        matches!(self, FetchValue::None)
    }

    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            FetchValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<TensorValue> {
        match self {
            FetchValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&TensorHandle> {
        match self {
            FetchValue::Handle(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_sparse(&self) -> Option<&SparseTensorValue> {
        match self {
            FetchValue::Sparse(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_indexed_slices(&self) -> Option<&IndexedSlicesValue> {
        match self {
            FetchValue::IndexedSlices(s) => Some(s),
            _ => None,
        }
    }

    /// Single-element tensor results as a host scalar.
    pub fn scalar<T: TensorElement>(&self) -> Option<T> {
        self.as_tensor().and_then(|t| t.to_scalar::<T>().ok())
    }

    /// Positional access into lists and tuples.
    pub fn at(&self, index: usize) -> Option<&FetchValue> {
        match self {
            FetchValue::List(items) | FetchValue::Tuple(items) => items.get(index),
            _ => None,
        }
    }

    /// Keyed access into maps and named tuples.
    pub fn get(&self, key: &str) -> Option<&FetchValue> {
        match self {
            FetchValue::Map(m) => m.get(key),
            FetchValue::Named { fields, .. } => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FetchValue::List(items) | FetchValue::Tuple(items) => items.len(),
            FetchValue::Named { fields, .. } => fields.len(),
            FetchValue::Map(m) => m.len(),
            FetchValue::None => 0,
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
