use half::{bf16, f16};
use num_traits::NumCast;
use serde::{Deserialize, Serialize};

use crate::graph::proto::DataTypeProto;

#[derive(Debug, thiserror::Error)]
pub enum DTypeError {
    #[error("The wire dtype {0} is not supported")]
    UnsupportedWireDType(i32),
}

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum DType {
    F64,
    F32,
    BF16,
    F16,
    U64,
    I64,
    U32,
    I32,
    U16,
    I16,
    U8,
    I8,
    BOOL,
    STRING,
}

impl DType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DType::U64
                | DType::I64
                | DType::U32
                | DType::I32
                | DType::U16
                | DType::I16
                | DType::U8
                | DType::I8
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::BF16 | DType::F16)
    }

    /// Whether the integer `value` survives a round trip through this dtype
    /// unchanged. Non-numeric dtypes never represent an integer.
    pub fn represents_integer(&self, value: i64) -> bool {
        match self {
            DType::I64 => true,
            DType::U64 => fits::<u64>(value),
            DType::I32 => fits::<i32>(value),
            DType::U32 => fits::<u32>(value),
            DType::I16 => fits::<i16>(value),
            DType::U16 => fits::<u16>(value),
            DType::I8 => fits::<i8>(value),
            DType::U8 => fits::<u8>(value),
            DType::F64 => (value as f64) as i128 == value as i128,
            DType::F32 => (value as f32) as i128 == value as i128,
            DType::F16 => f16::from_f64(value as f64).to_f64() as i128 == value as i128,
            DType::BF16 => bf16::from_f64(value as f64).to_f64() as i128 == value as i128,
            DType::BOOL => value == 0 || value == 1,
            DType::STRING => false,
        }
    }
}

fn fits<T: NumCast>(value: i64) -> bool {
    <T as NumCast>::from(value).is_some()
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F64 => write!(f, "Float64"),
            DType::F32 => write!(f, "Float32"),
            DType::BF16 => write!(f, "BFloat16"),
            DType::F16 => write!(f, "Float16"),
            DType::I64 => write!(f, "Int64"),
            DType::I32 => write!(f, "Int32"),
            DType::U64 => write!(f, "UInt64"),
            DType::U32 => write!(f, "UInt32"),
            DType::I16 => write!(f, "Int16"),
            DType::U16 => write!(f, "UInt16"),
            DType::U8 => write!(f, "UInt8"),
            DType::I8 => write!(f, "Int8"),
            DType::BOOL => write!(f, "Bool"),
            DType::STRING => write!(f, "String"),
        }
    }
}

impl From<DType> for DataTypeProto {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::F64 => DataTypeProto::Double,
            DType::F32 => DataTypeProto::Float,
            DType::BF16 => DataTypeProto::Bfloat16,
            DType::F16 => DataTypeProto::Half,
            DType::I64 => DataTypeProto::Int64,
            DType::I32 => DataTypeProto::Int32,
            DType::U64 => DataTypeProto::Uint64,
            DType::U32 => DataTypeProto::Uint32,
            DType::U16 => DataTypeProto::Uint16,
            DType::I16 => DataTypeProto::Int16,
            DType::U8 => DataTypeProto::Uint8,
            DType::I8 => DataTypeProto::Int8,
            DType::BOOL => DataTypeProto::Bool,
            DType::STRING => DataTypeProto::String,
        }
    }
}

impl TryFrom<DataTypeProto> for DType {
    type Error = DTypeError;
    fn try_from(wire: DataTypeProto) -> Result<Self, DTypeError> {
        Ok(match wire {
            DataTypeProto::Double => DType::F64,
            DataTypeProto::Float => DType::F32,
            DataTypeProto::Bfloat16 => DType::BF16,
            DataTypeProto::Half => DType::F16,
            DataTypeProto::Int64 => DType::I64,
            DataTypeProto::Int32 => DType::I32,
            DataTypeProto::Uint64 => DType::U64,
            DataTypeProto::Uint32 => DType::U32,
            DataTypeProto::Uint16 => DType::U16,
            DataTypeProto::Int16 => DType::I16,
            DataTypeProto::Uint8 => DType::U8,
            DataTypeProto::Int8 => DType::I8,
            DataTypeProto::Bool => DType::BOOL,
            DataTypeProto::String => DType::STRING,
            DataTypeProto::Invalid => Err(DTypeError::UnsupportedWireDType(wire as i32))?,
        })
    }
}

impl TryFrom<i32> for DType {
    type Error = DTypeError;
    fn try_from(raw: i32) -> Result<Self, DTypeError> {
        let wire = DataTypeProto::try_from(raw).map_err(|_| DTypeError::UnsupportedWireDType(raw))?;
        DType::try_from(wire)
    }
}

pub trait DTypeOfPrimitive {
    const DTYPE: DType;
}

impl DTypeOfPrimitive for f64 { const DTYPE: DType = DType::F64; }
impl DTypeOfPrimitive for f32 { const DTYPE: DType = DType::F32; }
impl DTypeOfPrimitive for bf16 { const DTYPE: DType = DType::BF16; }
impl DTypeOfPrimitive for f16 { const DTYPE: DType = DType::F16; }
impl DTypeOfPrimitive for i64 { const DTYPE: DType = DType::I64; }
impl DTypeOfPrimitive for u64 { const DTYPE: DType = DType::U64; }
impl DTypeOfPrimitive for i32 { const DTYPE: DType = DType::I32; }
impl DTypeOfPrimitive for u32 { const DTYPE: DType = DType::U32; }
impl DTypeOfPrimitive for i16 { const DTYPE: DType = DType::I16; }
impl DTypeOfPrimitive for u16 { const DTYPE: DType = DType::U16; }
impl DTypeOfPrimitive for i8 { const DTYPE: DType = DType::I8; }
impl DTypeOfPrimitive for u8 { const DTYPE: DType = DType::U8; }
impl DTypeOfPrimitive for bool { const DTYPE: DType = DType::BOOL; }
impl DTypeOfPrimitive for String { const DTYPE: DType = DType::STRING; }
