use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::graph::proto::TensorShapeProto;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Known(usize),
    Unknown,
}

impl Dimension {
    pub fn is_compatible_with(&self, size: usize) -> bool {
        match self {
            Dimension::Known(d) => *d == size,
            Dimension::Unknown => true,
        }
    }
}

impl Display for Dimension {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::Known(d) => write!(f, "{d}"),
            Dimension::Unknown => write!(f, "?"),
        }
    }
}

/// Declared shape of a node output. `dims == None` means the rank itself is
/// unknown and any value shape is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Option<Vec<Dimension>>,
}

impl TensorShape {
    pub fn unknown() -> Self {
        Self { dims: None }
    }

    pub fn scalar() -> Self {
        Self { dims: Some(vec![]) }
    }

    pub fn known(dims: &[usize]) -> Self {
        Self { dims: Some(dims.iter().map(|d| Dimension::Known(*d)).collect()) }
    }

    pub fn new(dims: Vec<Dimension>) -> Self {
        Self { dims: Some(dims) }
    }

    pub fn dims(&self) -> Option<&[Dimension]> {
        self.dims.as_deref()
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(|d| d.len())
    }

    pub fn is_compatible_with(&self, shape: &[usize]) -> bool {
        match &self.dims {
            None => true,
            Some(dims) => {
                dims.len() == shape.len()
                    && dims.iter().zip(shape).all(|(d, s)| d.is_compatible_with(*s))
            }
        }
    }

    pub fn to_proto(&self) -> TensorShapeProto {
        match &self.dims {
            None => TensorShapeProto { dim: vec![], unknown_rank: true },
            Some(dims) => TensorShapeProto {
                dim: dims
                    .iter()
                    .map(|d| match d {
                        Dimension::Known(x) => *x as i64,
                        Dimension::Unknown => -1,
                    })
                    .collect(),
                unknown_rank: false,
            },
        }
    }

    pub fn from_proto(proto: &TensorShapeProto) -> Self {
        if proto.unknown_rank {
            return Self::unknown();
        }
        Self::new(
            proto
                .dim
                .iter()
                .map(|d| usize::try_from(*d).map(Dimension::Known).unwrap_or(Dimension::Unknown))
                .collect(),
        )
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        Self::known(dims)
    }
}

/// Formats like a tuple: `()`, `(3,)`, `(2, ?)`, or `<unknown>`.
impl Display for TensorShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.dims {
            None => write!(f, "<unknown>"),
            Some(dims) => write!(f, "{}", format_dims(dims.iter().map(|d| d.to_string()))),
        }
    }
}

pub fn format_value_shape(shape: &[usize]) -> String {
    format_dims(shape.iter().map(|d| d.to_string()))
}

fn format_dims(parts: impl Iterator<Item = String>) -> String {
    let parts: Vec<String> = parts.collect();
    match parts.len() {
        1 => format!("({},)", parts[0]),
        _ => format!("({})", parts.join(", ")),
    }
}
