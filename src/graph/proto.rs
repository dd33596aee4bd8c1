//! Wire messages for shipping graph increments to an execution engine.

use std::collections::BTreeMap;

use half::{bf16, f16};

use crate::dtype::{DType, DTypeError};
use crate::value::{TensorValue, ValueError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DataTypeProto {
    Invalid = 0,
    Float = 1,
    Double = 2,
    Int32 = 3,
    Uint8 = 4,
    Int16 = 5,
    Int8 = 6,
    String = 7,
    Int64 = 9,
    Bool = 10,
    Bfloat16 = 14,
    Uint16 = 17,
    Half = 19,
    Uint32 = 22,
    Uint64 = 23,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorShapeProto {
    /// -1 marks an unknown dimension.
    #[prost(int64, repeated, tag = "1")]
    pub dim: Vec<i64>,
    #[prost(bool, tag = "2")]
    pub unknown_rank: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorProto {
    #[prost(enumeration = "DataTypeProto", tag = "1")]
    pub dtype: i32,
    #[prost(int64, repeated, tag = "2")]
    pub dim: Vec<i64>,
    #[prost(double, repeated, tag = "3")]
    pub double_val: Vec<f64>,
    #[prost(float, repeated, tag = "4")]
    pub float_val: Vec<f32>,
    #[prost(int64, repeated, tag = "5")]
    pub int64_val: Vec<i64>,
    #[prost(uint64, repeated, tag = "6")]
    pub uint64_val: Vec<u64>,
    #[prost(bool, repeated, tag = "7")]
    pub bool_val: Vec<bool>,
    #[prost(string, repeated, tag = "8")]
    pub string_val: Vec<String>,
    /// Raw bit patterns of 16-bit floats.
    #[prost(uint32, repeated, tag = "9")]
    pub half_val: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum AttrValueKind {
    #[prost(string, tag = "1")]
    S(String),
    #[prost(int64, tag = "2")]
    I(i64),
    #[prost(float, tag = "3")]
    F(f32),
    #[prost(bool, tag = "4")]
    B(bool),
    #[prost(enumeration = "DataTypeProto", tag = "5")]
    Type(i32),
    #[prost(message, tag = "6")]
    Shape(TensorShapeProto),
    #[prost(message, tag = "7")]
    Tensor(TensorProto),
    #[prost(message, tag = "8")]
    ShapeList(ShapeListProto),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShapeListProto {
    #[prost(message, repeated, tag = "1")]
    pub shape: Vec<TensorShapeProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttrValue {
    #[prost(oneof = "AttrValueKind", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub value: Option<AttrValueKind>,
}

impl AttrValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self { value: Some(AttrValueKind::S(s.into())) }
    }

    pub fn dtype(dtype: DType) -> Self {
        Self { value: Some(AttrValueKind::Type(DataTypeProto::from(dtype) as i32)) }
    }

    pub fn shape(shape: TensorShapeProto) -> Self {
        Self { value: Some(AttrValueKind::Shape(shape)) }
    }

    pub fn tensor(tensor: TensorProto) -> Self {
        Self { value: Some(AttrValueKind::Tensor(tensor)) }
    }

    pub fn as_tensor(&self) -> Option<&TensorProto> {
        match &self.value {
            Some(AttrValueKind::Tensor(t)) => Some(t),
            _ => None,
        }
    }

    pub fn as_dtype(&self) -> Option<i32> {
        match &self.value {
            Some(AttrValueKind::Type(t)) => Some(*t),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeDef {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub op: String,
    /// Data inputs as `op:index`, control inputs as `^op`.
    #[prost(string, repeated, tag = "3")]
    pub input: Vec<String>,
    #[prost(string, tag = "4")]
    pub device: String,
    #[prost(btree_map = "string, message", tag = "5")]
    pub attr: BTreeMap<String, AttrValue>,
    #[prost(enumeration = "DataTypeProto", repeated, tag = "6")]
    pub output_dtype: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GraphDef {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeDef>,
    /// Graph version after the last node in this message.
    #[prost(uint64, tag = "2")]
    pub version: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TensorProtoError {
    #[error(transparent)]
    DTypeError(#[from] DTypeError),
    #[error(transparent)]
    ValueError(#[from] ValueError),
    #[error("Negative dimension {0}")]
    NegativeDimension(i64),
}

impl From<&TensorValue> for TensorProto {
    fn from(value: &TensorValue) -> Self {
        let mut proto = TensorProto {
            dtype: DataTypeProto::from(value.dtype()) as i32,
            dim: value.shape().iter().map(|d| *d as i64).collect(),
            ..Default::default()
        };
        match value {
            TensorValue::F64(x) => proto.double_val = x.iter().copied().collect(),
            TensorValue::F32(x) => proto.float_val = x.iter().copied().collect(),
            TensorValue::BF16(x) => proto.half_val = x.iter().map(|v| v.to_bits() as u32).collect(),
            TensorValue::F16(x) => proto.half_val = x.iter().map(|v| v.to_bits() as u32).collect(),
            TensorValue::I64(x) => proto.int64_val = x.iter().copied().collect(),
            TensorValue::I32(x) => proto.int64_val = x.iter().map(|v| *v as i64).collect(),
            TensorValue::I16(x) => proto.int64_val = x.iter().map(|v| *v as i64).collect(),
            TensorValue::I8(x) => proto.int64_val = x.iter().map(|v| *v as i64).collect(),
            TensorValue::U64(x) => proto.uint64_val = x.iter().copied().collect(),
            TensorValue::U32(x) => proto.uint64_val = x.iter().map(|v| *v as u64).collect(),
            TensorValue::U16(x) => proto.uint64_val = x.iter().map(|v| *v as u64).collect(),
            TensorValue::U8(x) => proto.uint64_val = x.iter().map(|v| *v as u64).collect(),
            TensorValue::BOOL(x) => proto.bool_val = x.iter().copied().collect(),
            TensorValue::STRING(x) => proto.string_val = x.iter().cloned().collect(),
        }
        proto
    }
}

impl TryFrom<&TensorProto> for TensorValue {
    type Error = TensorProtoError;
    fn try_from(proto: &TensorProto) -> Result<Self, TensorProtoError> {
        let dtype = DType::try_from(proto.dtype)?;
        let shape = proto
            .dim
            .iter()
            .map(|d| usize::try_from(*d).map_err(|_| TensorProtoError::NegativeDimension(*d)))
            .collect::<Result<Vec<usize>, _>>()?;
        Ok(match dtype {
            DType::F64 => TensorValue::from_vec_shape(proto.double_val.clone(), &shape)?,
            DType::F32 => TensorValue::from_vec_shape(proto.float_val.clone(), &shape)?,
            DType::BF16 => TensorValue::from_vec_shape(
                proto.half_val.iter().map(|b| bf16::from_bits(*b as u16)).collect(),
                &shape,
            )?,
            DType::F16 => TensorValue::from_vec_shape(
                proto.half_val.iter().map(|b| f16::from_bits(*b as u16)).collect(),
                &shape,
            )?,
            DType::I64 => TensorValue::from_vec_shape(proto.int64_val.clone(), &shape)?,
            DType::I32 => TensorValue::from_vec_shape(proto.int64_val.iter().map(|v| *v as i32).collect(), &shape)?,
            DType::I16 => TensorValue::from_vec_shape(proto.int64_val.iter().map(|v| *v as i16).collect(), &shape)?,
            DType::I8 => TensorValue::from_vec_shape(proto.int64_val.iter().map(|v| *v as i8).collect(), &shape)?,
            DType::U64 => TensorValue::from_vec_shape(proto.uint64_val.clone(), &shape)?,
            DType::U32 => TensorValue::from_vec_shape(proto.uint64_val.iter().map(|v| *v as u32).collect(), &shape)?,
            DType::U16 => TensorValue::from_vec_shape(proto.uint64_val.iter().map(|v| *v as u16).collect(), &shape)?,
            DType::U8 => TensorValue::from_vec_shape(proto.uint64_val.iter().map(|v| *v as u8).collect(), &shape)?,
            DType::BOOL => TensorValue::from_vec_shape(proto.bool_val.clone(), &shape)?,
            DType::STRING => TensorValue::from_vec_shape(proto.string_val.clone(), &shape)?,
        })
    }
}
