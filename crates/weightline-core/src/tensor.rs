use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element type of a tensor as stored by the source framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I8,
    U8,
}

impl DataType {
    /// Size in bytes per element
    pub fn size(&self) -> usize {
        match self {
            DataType::F64 | DataType::I64 => 8,
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F64 | DataType::F32 | DataType::F16 | DataType::BF16)
    }

    pub fn safetensors_tag(&self) -> &'static str {
        match self {
            DataType::F64 => "F64",
            DataType::F32 => "F32",
            DataType::F16 => "F16",
            DataType::BF16 => "BF16",
            DataType::I64 => "I64",
            DataType::I32 => "I32",
            DataType::I8 => "I8",
            DataType::U8 => "U8",
        }
    }

    /// Parse the dtype tag used in safetensors headers
    pub fn from_safetensors(tag: &str) -> Result<Self> {
        match tag {
            "F64" => Ok(DataType::F64),
            "F32" => Ok(DataType::F32),
            "F16" => Ok(DataType::F16),
            "BF16" => Ok(DataType::BF16),
            "I8" => Ok(DataType::I8),
            "U8" => Ok(DataType::U8),
            "I64" => Ok(DataType::I64),
            "I32" => Ok(DataType::I32),
            other => Err(Error::UnsupportedDType(format!("safetensors dtype {}", other))),
        }
    }
}

/// Precision a record is serialized at on the native side.
///
/// This is the fixed set of precision tokens a caller may request. The native
/// codes are part of the runtime ABI and must not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Precision {
    Int4,
    Int8,
    #[default]
    Float16,
    Float32,
}

impl Precision {
    pub const ALL: [Precision; 4] =
        [Precision::Int4, Precision::Int8, Precision::Float16, Precision::Float32];

    /// Data type code understood by the native runtime
    pub fn native_code(&self) -> i32 {
        match self {
            Precision::Float32 => 0,
            Precision::Int8 => 3,
            Precision::Float16 => 7,
            Precision::Int4 => 8,
        }
    }

    /// Bytes per element, `None` for sub-byte precisions
    pub fn element_size(&self) -> Option<usize> {
        match self {
            Precision::Float32 => Some(4),
            Precision::Float16 => Some(2),
            Precision::Int8 => Some(1),
            Precision::Int4 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Int4 => "int4",
            Precision::Int8 => "int8",
            Precision::Float16 => "float16",
            Precision::Float32 => "float32",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Precision::ALL.into_iter().find(|p| p.as_str() == s).ok_or_else(|| {
            Error::UnsupportedDType(format!(
                "precision {:?}, expected one of int4, int8, float16, float32",
                s
            ))
        })
    }
}

impl TryFrom<String> for Precision {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Precision> for String {
    fn from(p: Precision) -> Self {
        p.as_str().to_string()
    }
}

/// How the native runtime should treat a weight record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightKind {
    Plain,
    Linear,
    Embedding,
    QuantizedLinear,
}

impl WeightKind {
    /// Weight type code understood by the native runtime
    pub fn native_code(&self) -> i32 {
        match self {
            WeightKind::Plain => 0,
            WeightKind::Linear => 1,
            WeightKind::Embedding => 2,
            WeightKind::QuantizedLinear => 111,
        }
    }
}

/// Tensor shape (dimensions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Element count, or `None` if it does not fit in `usize`
    pub fn checked_numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Bytes needed at `elem_size` bytes per element, or `None` on overflow
    pub fn checked_byte_len(&self, elem_size: usize) -> Option<usize> {
        self.checked_numel()?.checked_mul(elem_size)
    }

    /// Validates shape dimensions
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::ShapeMismatch("Shape cannot be empty".into()));
        }
        if self.0.contains(&0) {
            return Err(Error::ShapeMismatch("Shape dimensions must be > 0".into()));
        }
        if self.checked_numel().is_none() {
            return Err(Error::ShapeMismatch(format!("Shape {} has too many elements", self)));
        }
        Ok(())
    }

    /// Dimensions as the fixed-width integers used on the native wire
    pub fn to_native(&self) -> Result<Vec<i32>> {
        self.0
            .iter()
            .map(|&d| {
                i32::try_from(d).map_err(|_| {
                    Error::InvalidArgument(format!("dimension {} does not fit in i32", d))
                })
            })
            .collect()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// A named tensor owned by the converter.
///
/// Source models hand these over by value; once a `SourceTensor` has been
/// turned into a record its buffer is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTensor {
    pub name: String,
    pub shape: Shape,
    pub dtype: DataType,
    pub data: Vec<u8>,
}

impl SourceTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DataType, data: Vec<u8>) -> Self {
        Self { name: name.into(), shape: Shape::new(shape), dtype, data }
    }

    /// Build an F32 tensor from values
    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(name, shape, DataType::F32, data)
    }

    /// Check that the buffer holds exactly `numel * dtype.size()` bytes
    pub fn validate(&self) -> Result<()> {
        self.shape.validate().map_err(|e| {
            Error::ShapeMismatch(format!("{}: {}", self.name, e))
        })?;
        let expected = self.shape.checked_byte_len(self.dtype.size()).ok_or_else(|| {
            Error::ShapeMismatch(format!("{}: shape {} overflows as {:?}", self.name, self.shape, self.dtype))
        })?;
        if self.data.len() != expected {
            return Err(Error::ShapeMismatch(format!(
                "{}: shape {} as {:?} needs {} bytes, buffer has {}",
                self.name,
                self.shape,
                self.dtype,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_validation() {
        let shape = Shape::new(vec![2, 3, 4]);
        assert!(shape.validate().is_ok());
        assert_eq!(shape.numel(), 24);

        let invalid = Shape::new(vec![2, 0, 4]);
        assert!(matches!(invalid.validate(), Err(Error::ShapeMismatch(_))));
        assert!(Shape::new(vec![]).validate().is_err());
    }

    #[test]
    fn test_dtype_size() {
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::BF16.size(), 2);
        assert_eq!(DataType::I8.size(), 1);
    }

    #[test]
    fn test_precision_tokens() {
        assert_eq!("int4".parse::<Precision>().unwrap(), Precision::Int4);
        assert_eq!("float16".parse::<Precision>().unwrap().native_code(), 7);
        assert!(matches!("bfloat16".parse::<Precision>(), Err(Error::UnsupportedDType(_))));

        let json = serde_json::to_string(&Precision::Int8).unwrap();
        assert_eq!(json, "\"int8\"");
        assert!(serde_json::from_str::<Precision>("\"fp8\"").is_err());
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(WeightKind::Plain.native_code(), 0);
        assert_eq!(WeightKind::Embedding.native_code(), 2);
        assert_eq!(WeightKind::QuantizedLinear.native_code(), 111);
    }

    #[test]
    fn test_source_tensor_validate() {
        let t = SourceTensor::from_f32("w", vec![2, 2], &[1.0, 2.0, 3.0, 4.0]);
        assert!(t.validate().is_ok());

        let short = SourceTensor::new("w", vec![2, 2], DataType::F16, vec![0u8; 6]);
        assert!(matches!(short.validate(), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_oversized_shape_rejected() {
        let huge = Shape::new(vec![1 << 32, 1 << 32, 1 << 32]);
        assert_eq!(huge.checked_numel(), None);
        assert!(matches!(huge.validate(), Err(Error::ShapeMismatch(_))));

        let wide = SourceTensor::new("w", vec![usize::MAX / 2, 1], DataType::F32, vec![]);
        assert!(matches!(wide.validate(), Err(Error::ShapeMismatch(_))));
        assert_eq!(Shape::new(vec![3, 4]).checked_byte_len(2), Some(24));
    }
}
