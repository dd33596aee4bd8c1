use crate::dtype::{DType, DTypeOfPrimitive};
use half::{bf16, f16};
use ndarray::{ArcArray, IxDyn, Zip};
use num_traits::{NumCast, WrappingAdd, WrappingMul, WrappingSub};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("Requested dtype {0}, but had dtype {1}")]
    WrongDType(DType, DType),
    #[error("Cannot convert {0} to {1}")]
    InvalidCast(Scalar, DType),
    #[error("Unsupported operation {0} for dtypes {1:?}")]
    UnsupportedOperationForDTypes(String, Vec<DType>),
    #[error("Shapes {0:?} and {1:?} cannot be broadcast together")]
    IncompatibleShapes(Vec<usize>, Vec<usize>),
    #[error("Expected a scalar, got shape {0:?}")]
    NotAScalar(Vec<usize>),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

/// A single host element, independent of storage type. Used as the common
/// currency for casts and for converting caller-supplied data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Float(f64),
    Int(i128),
    Bool(bool),
    Str(String),
}

impl Display for Scalar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Int(x) => write!(f, "{x}"),
            Scalar::Bool(x) => write!(f, "{x}"),
            Scalar::Str(x) => write!(f, "{x:?}"),
        }
    }
}

pub trait TensorElement: Clone + DTypeOfPrimitive + Sized {
    fn wrap(array: ArcArray<Self, IxDyn>) -> TensorValue;
    fn view(value: &TensorValue) -> Option<&ArcArray<Self, IxDyn>>;
    fn from_scalar(scalar: &Scalar) -> Option<Self>;
    fn to_scalar(&self) -> Scalar;
}

macro_rules! float_element {
    ($t:ty, $variant:ident, $from_f64:expr, $to_f64:expr) => {
        impl TensorElement for $t {
            fn wrap(array: ArcArray<Self, IxDyn>) -> TensorValue {
                TensorValue::$variant(array)
            }
            fn view(value: &TensorValue) -> Option<&ArcArray<Self, IxDyn>> {
                match value {
                    TensorValue::$variant(x) => Some(x),
                    _ => None,
                }
            }
            fn from_scalar(scalar: &Scalar) -> Option<Self> {
                let from_f64: fn(f64) -> $t = $from_f64;
                match scalar {
                    Scalar::Float(x) => Some(from_f64(*x)),
                    Scalar::Int(x) => Some(from_f64(*x as f64)),
                    Scalar::Bool(x) => Some(from_f64(if *x { 1.0 } else { 0.0 })),
                    Scalar::Str(_) => None,
                }
            }
            fn to_scalar(&self) -> Scalar {
                let to_f64: fn(&$t) -> f64 = $to_f64;
                Scalar::Float(to_f64(self))
            }
        }
    };
}

macro_rules! int_element {
    ($t:ty, $variant:ident) => {
        impl TensorElement for $t {
            fn wrap(array: ArcArray<Self, IxDyn>) -> TensorValue {
                TensorValue::$variant(array)
            }
            fn view(value: &TensorValue) -> Option<&ArcArray<Self, IxDyn>> {
                match value {
                    TensorValue::$variant(x) => Some(x),
                    _ => None,
                }
            }
            fn from_scalar(scalar: &Scalar) -> Option<Self> {
                match scalar {
                    Scalar::Float(x) => <$t as NumCast>::from(*x),
                    Scalar::Int(x) => <$t as NumCast>::from(*x),
                    Scalar::Bool(x) => Some(*x as $t),
                    Scalar::Str(_) => None,
                }
            }
            fn to_scalar(&self) -> Scalar {
                Scalar::Int(*self as i128)
            }
        }
    };
}

float_element!(f64, F64, |x| x, |x| *x);
float_element!(f32, F32, |x| x as f32, |x| *x as f64);
float_element!(bf16, BF16, bf16::from_f64, |x| x.to_f64());
float_element!(f16, F16, f16::from_f64, |x| x.to_f64());
int_element!(u64, U64);
int_element!(i64, I64);
int_element!(u32, U32);
int_element!(i32, I32);
int_element!(u16, U16);
int_element!(i16, I16);
int_element!(u8, U8);
int_element!(i8, I8);

impl TensorElement for bool {
    fn wrap(array: ArcArray<Self, IxDyn>) -> TensorValue {
        TensorValue::BOOL(array)
    }
    fn view(value: &TensorValue) -> Option<&ArcArray<Self, IxDyn>> {
        match value {
            TensorValue::BOOL(x) => Some(x),
            _ => None,
        }
    }
    fn from_scalar(scalar: &Scalar) -> Option<Self> {
        match scalar {
            Scalar::Float(x) => Some(*x != 0.0),
            Scalar::Int(x) => Some(*x != 0),
            Scalar::Bool(x) => Some(*x),
            Scalar::Str(_) => None,
        }
    }
    fn to_scalar(&self) -> Scalar {
        Scalar::Bool(*self)
    }
}

impl TensorElement for String {
    fn wrap(array: ArcArray<Self, IxDyn>) -> TensorValue {
        TensorValue::STRING(array)
    }
    fn view(value: &TensorValue) -> Option<&ArcArray<Self, IxDyn>> {
        match value {
            TensorValue::STRING(x) => Some(x),
            _ => None,
        }
    }
    fn from_scalar(scalar: &Scalar) -> Option<Self> {
        match scalar {
            Scalar::Str(x) => Some(x.clone()),
            _ => None,
        }
    }
    fn to_scalar(&self) -> Scalar {
        Scalar::Str(self.clone())
    }
}

/// Host-side tensor data exchanged with the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorValue {
    F64(ArcArray<f64, IxDyn>),
    F32(ArcArray<f32, IxDyn>),
    BF16(ArcArray<bf16, IxDyn>),
    F16(ArcArray<f16, IxDyn>),
    U64(ArcArray<u64, IxDyn>),
    I64(ArcArray<i64, IxDyn>),
    U32(ArcArray<u32, IxDyn>),
    I32(ArcArray<i32, IxDyn>),
    U16(ArcArray<u16, IxDyn>),
    I16(ArcArray<i16, IxDyn>),
    U8(ArcArray<u8, IxDyn>),
    I8(ArcArray<i8, IxDyn>),
    BOOL(ArcArray<bool, IxDyn>),
    STRING(ArcArray<String, IxDyn>),
}

macro_rules! with_array {
    ($value:expr, $x:ident => $body:expr) => {
        match $value {
            TensorValue::F64($x) => $body,
            TensorValue::F32($x) => $body,
            TensorValue::BF16($x) => $body,
            TensorValue::F16($x) => $body,
            TensorValue::U64($x) => $body,
            TensorValue::I64($x) => $body,
            TensorValue::U32($x) => $body,
            TensorValue::I32($x) => $body,
            TensorValue::U16($x) => $body,
            TensorValue::I16($x) => $body,
            TensorValue::U8($x) => $body,
            TensorValue::I8($x) => $body,
            TensorValue::BOOL($x) => $body,
            TensorValue::STRING($x) => $body,
        }
    };
}

/// Float arithmetic follows IEEE semantics; integer arithmetic wraps.
macro_rules! binary_arith {
    ($name:expr, $a:expr, $b:expr, $float_op:expr, $int_op:expr) => {{
        let shape = broadcast_shape($a, $b)?;
        match ($a, $b) {
            (TensorValue::F64(x), TensorValue::F64(y)) => TensorValue::F64(zip_broadcast(x, y, &shape, $float_op)?),
            (TensorValue::F32(x), TensorValue::F32(y)) => TensorValue::F32(zip_broadcast(x, y, &shape, $float_op)?),
            (TensorValue::BF16(x), TensorValue::BF16(y)) => TensorValue::BF16(zip_broadcast(x, y, &shape, $float_op)?),
            (TensorValue::F16(x), TensorValue::F16(y)) => TensorValue::F16(zip_broadcast(x, y, &shape, $float_op)?),
            (TensorValue::U64(x), TensorValue::U64(y)) => TensorValue::U64(zip_broadcast(x, y, &shape, $int_op)?),
            (TensorValue::I64(x), TensorValue::I64(y)) => TensorValue::I64(zip_broadcast(x, y, &shape, $int_op)?),
            (TensorValue::U32(x), TensorValue::U32(y)) => TensorValue::U32(zip_broadcast(x, y, &shape, $int_op)?),
            (TensorValue::I32(x), TensorValue::I32(y)) => TensorValue::I32(zip_broadcast(x, y, &shape, $int_op)?),
            (TensorValue::U16(x), TensorValue::U16(y)) => TensorValue::U16(zip_broadcast(x, y, &shape, $int_op)?),
            (TensorValue::I16(x), TensorValue::I16(y)) => TensorValue::I16(zip_broadcast(x, y, &shape, $int_op)?),
            (TensorValue::U8(x), TensorValue::U8(y)) => TensorValue::U8(zip_broadcast(x, y, &shape, $int_op)?),
            (TensorValue::I8(x), TensorValue::I8(y)) => TensorValue::I8(zip_broadcast(x, y, &shape, $int_op)?),
            (a, b) => Err(ValueError::UnsupportedOperationForDTypes(
                $name.to_string(),
                vec![a.dtype(), b.dtype()],
            ))?,
        }
    }};
}

impl Display for TensorValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        with_array!(self, x => x.fmt(f))
    }
}

impl TensorValue {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F64(_) => DType::F64,
            TensorValue::F32(_) => DType::F32,
            TensorValue::BF16(_) => DType::BF16,
            TensorValue::F16(_) => DType::F16,
            TensorValue::U64(_) => DType::U64,
            TensorValue::I64(_) => DType::I64,
            TensorValue::U32(_) => DType::U32,
            TensorValue::I32(_) => DType::I32,
            TensorValue::U16(_) => DType::U16,
            TensorValue::I16(_) => DType::I16,
            TensorValue::U8(_) => DType::U8,
            TensorValue::I8(_) => DType::I8,
            TensorValue::BOOL(_) => DType::BOOL,
            TensorValue::STRING(_) => DType::STRING,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        with_array!(self, x => x.shape().to_vec())
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn scalar<T: TensorElement>(value: T) -> Self {
        T::wrap(ArcArray::from_elem(IxDyn(&[]), value))
    }

    pub fn from_vec<T: TensorElement>(v: Vec<T>) -> Self {
        T::wrap(ArcArray::from_vec(v).into_dyn())
    }

    pub fn from_vec_shape<T: TensorElement>(v: Vec<T>, shape: &[usize]) -> Result<Self, ValueError> {
        Ok(T::wrap(ArcArray::from_shape_vec(IxDyn(shape), v)?))
    }

    /// Builds a value of `dtype` from host scalars laid out in row-major order.
    pub fn from_scalars(dtype: DType, shape: &[usize], scalars: &[Scalar]) -> Result<Self, ValueError> {
        fn build<T: TensorElement>(shape: &[usize], scalars: &[Scalar]) -> Result<TensorValue, ValueError> {
            let v = scalars
                .iter()
                .map(|s| T::from_scalar(s).ok_or_else(|| ValueError::InvalidCast(s.clone(), T::DTYPE)))
                .collect::<Result<Vec<T>, ValueError>>()?;
            TensorValue::from_vec_shape(v, shape)
        }
        match dtype {
            DType::F64 => build::<f64>(shape, scalars),
            DType::F32 => build::<f32>(shape, scalars),
            DType::BF16 => build::<bf16>(shape, scalars),
            DType::F16 => build::<f16>(shape, scalars),
            DType::U64 => build::<u64>(shape, scalars),
            DType::I64 => build::<i64>(shape, scalars),
            DType::U32 => build::<u32>(shape, scalars),
            DType::I32 => build::<i32>(shape, scalars),
            DType::U16 => build::<u16>(shape, scalars),
            DType::I16 => build::<i16>(shape, scalars),
            DType::U8 => build::<u8>(shape, scalars),
            DType::I8 => build::<i8>(shape, scalars),
            DType::BOOL => build::<bool>(shape, scalars),
            DType::STRING => build::<String>(shape, scalars),
        }
    }

    /// Elements in row-major order.
    pub fn scalars(&self) -> Vec<Scalar> {
        with_array!(self, x => x.iter().map(|e| e.to_scalar()).collect())
    }

    pub fn cast(&self, dtype: DType) -> Result<Self, ValueError> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        Self::from_scalars(dtype, &self.shape(), &self.scalars())
    }

    pub fn try_to_vec<T: TensorElement>(&self) -> Result<Vec<T>, ValueError> {
        T::view(self)
            .map(|x| x.iter().cloned().collect())
            .ok_or(ValueError::WrongDType(T::DTYPE, self.dtype()))
    }

    pub fn to_scalar<T: TensorElement>(&self) -> Result<T, ValueError> {
        if self.num_elements() != 1 {
            return Err(ValueError::NotAScalar(self.shape()));
        }
        let mut v = self.try_to_vec::<T>()?;
        v.pop().ok_or(ValueError::NotAScalar(self.shape()))
    }

    /// Converts every element to f64; strings are rejected.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>, ValueError> {
        self.cast(DType::F64)?.try_to_vec::<f64>()
    }

    pub fn add(a: &TensorValue, b: &TensorValue) -> Result<Self, ValueError> {
        Ok(binary_arith!("Add", a, b, |x, y| *x + *y, WrappingAdd::wrapping_add))
    }

    pub fn sub(a: &TensorValue, b: &TensorValue) -> Result<Self, ValueError> {
        Ok(binary_arith!("Sub", a, b, |x, y| *x - *y, WrappingSub::wrapping_sub))
    }

    pub fn mul(a: &TensorValue, b: &TensorValue) -> Result<Self, ValueError> {
        Ok(binary_arith!("Mul", a, b, |x, y| *x * *y, WrappingMul::wrapping_mul))
    }
}

fn broadcast_shape(a: &TensorValue, b: &TensorValue) -> Result<Vec<usize>, ValueError> {
    let (sa, sb) = (a.shape(), b.shape());
    let rank = sa.len().max(sb.len());
    let mut shape = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i < rank - sa.len() { 1 } else { sa[i - (rank - sa.len())] };
        let db = if i < rank - sb.len() { 1 } else { sb[i - (rank - sb.len())] };
        if da != db && da != 1 && db != 1 {
            return Err(ValueError::IncompatibleShapes(sa, sb));
        }
        shape.push(if da == 1 { db } else { da });
    }
    Ok(shape)
}

fn zip_broadcast<T: Clone>(
    x: &ArcArray<T, IxDyn>,
    y: &ArcArray<T, IxDyn>,
    shape: &[usize],
    f: impl Fn(&T, &T) -> T,
) -> Result<ArcArray<T, IxDyn>, ValueError> {
    let incompatible = || ValueError::IncompatibleShapes(x.shape().to_vec(), y.shape().to_vec());
    let x = x.broadcast(IxDyn(shape)).ok_or_else(incompatible)?;
    let y = y.broadcast(IxDyn(shape)).ok_or_else(incompatible)?;
    Ok(Zip::from(&x).and(&y).map_collect(|a, b| f(a, b)).into_shared())
}

impl<T: TensorElement> From<Vec<T>> for TensorValue {
    fn from(v: Vec<T>) -> Self {
        TensorValue::from_vec(v)
    }
}
