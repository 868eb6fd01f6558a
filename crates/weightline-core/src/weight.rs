//! WeightRecord builder
//!
//! Turns one source parameter into a transport-ready record. The builder
//! takes the parameter by value, so the source buffer is either moved into
//! the record unchanged or dropped after conversion.

use crate::error::{Error, Result};
use crate::quant;
use crate::source::{SourceParameter, WeightRole};
use crate::tensor::{DataType, Precision, Shape, SourceTensor, WeightKind};
use serde::{Deserialize, Serialize};

/// Bytes and encoding of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordPayload {
    /// Float buffer; `data` is encoded as `source_dtype`
    Dense { source_dtype: Precision, target_dtype: Precision, data: Vec<u8> },
    /// Integer buffer as stored at rest, one byte per element of the shape
    Quantized { bit_width: u8, scales: Vec<f32>, packed: Vec<u8> },
}

/// One named tensor ready to cross the native boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    pub name: String,
    pub shape: Shape,
    pub kind: WeightKind,
    pub payload: RecordPayload,
}

impl WeightRecord {
    /// Precision the native side stores the weight at
    pub fn target_dtype(&self) -> Precision {
        match &self.payload {
            RecordPayload::Dense { target_dtype, .. } => *target_dtype,
            RecordPayload::Quantized { bit_width: 4, .. } => Precision::Int4,
            RecordPayload::Quantized { .. } => Precision::Int8,
        }
    }

    /// Encoding of the buffer that crosses the boundary
    pub fn source_dtype(&self) -> Precision {
        match &self.payload {
            RecordPayload::Dense { source_dtype, .. } => *source_dtype,
            RecordPayload::Quantized { .. } => self.target_dtype(),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.payload {
            RecordPayload::Dense { data, .. } => data,
            RecordPayload::Quantized { packed, .. } => packed,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match &self.payload {
            RecordPayload::Dense { data, .. } => data.len(),
            RecordPayload::Quantized { scales, packed, .. } => packed.len() + scales.len() * 4,
        }
    }

    /// Check the payload-length invariant for this record's encoding
    pub fn validate(&self) -> Result<()> {
        self.shape.validate()?;
        let numel = self.shape.numel();
        match &self.payload {
            RecordPayload::Dense { source_dtype, data, .. } => {
                let width = source_dtype.element_size().ok_or_else(|| {
                    Error::UnsupportedDType(format!("{}: payload as {}", self.name, source_dtype))
                })?;
                if self.shape.checked_byte_len(width) != Some(data.len()) {
                    return Err(Error::ShapeMismatch(format!(
                        "{}: {} bytes for shape {} as {}",
                        self.name,
                        data.len(),
                        self.shape,
                        source_dtype
                    )));
                }
            }
            RecordPayload::Quantized { bit_width, scales, packed } => {
                quant::validate_bit_width(*bit_width)?;
                if packed.len() != numel {
                    return Err(Error::ShapeMismatch(format!(
                        "{}: {} packed bytes for shape {}",
                        self.name,
                        packed.len(),
                        self.shape
                    )));
                }
                if scales.len() != self.shape.dims()[0] {
                    return Err(Error::ShapeMismatch(format!(
                        "{}: {} scales for {} output channels",
                        self.name,
                        scales.len(),
                        self.shape.dims()[0]
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builds records at one requested precision
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightRecordBuilder {
    precision: Precision,
}

impl WeightRecordBuilder {
    pub fn new(precision: Precision) -> Self {
        Self { precision }
    }

    /// Builder for a caller-supplied precision token
    pub fn from_token(token: &str) -> Result<Self> {
        Ok(Self::new(token.parse()?))
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn build(&self, parameter: SourceParameter) -> Result<WeightRecord> {
        let SourceParameter { tensor, role, scales, normalize_rows } = parameter;
        tensor.validate()?;

        match role {
            Some(WeightRole::QuantizedLinear { bit_width }) => {
                if normalize_rows {
                    return Err(Error::InvalidArgument(format!(
                        "{}: cannot normalize rows of a pre-quantized weight",
                        tensor.name
                    )));
                }
                build_quantized(tensor, scales, bit_width)
            }
            Some(WeightRole::Embedding) => {
                dense(tensor, WeightKind::Embedding, Precision::Float32, normalize_rows, true)
            }
            Some(WeightRole::Linear) => {
                dense(tensor, WeightKind::Linear, self.precision, normalize_rows, true)
            }
            None => dense(tensor, WeightKind::Plain, Precision::Float32, normalize_rows, false),
        }
    }
}

fn dense(
    tensor: SourceTensor,
    kind: WeightKind,
    target_dtype: Precision,
    normalize_rows: bool,
    float_role: bool,
) -> Result<WeightRecord> {
    if float_role && !tensor.dtype.is_float() {
        return Err(Error::UnsupportedDType(format!(
            "{}: {:?} source for a {:?} weight",
            tensor.name, tensor.dtype, kind
        )));
    }

    // Only float16 targets get a narrowed payload; int4/int8 are quantized
    // natively from float32.
    let source_dtype = match target_dtype {
        Precision::Float16 => Precision::Float16,
        _ => Precision::Float32,
    };

    let SourceTensor { name, shape, dtype, data } = tensor;
    let passthrough = matches!(
        (dtype, source_dtype),
        (DataType::F32, Precision::Float32) | (DataType::F16, Precision::Float16)
    );

    let data = if passthrough && !normalize_rows {
        data
    } else {
        let mut values = quant::to_f32_vec(dtype, &data)?;
        drop(data);
        if normalize_rows {
            let cols = *shape.dims().last().unwrap_or(&1);
            quant::l2_normalize_rows(&mut values, cols)?;
        }
        match source_dtype {
            Precision::Float16 => quant::f32_to_f16_bytes(&values),
            _ => quant::f32_to_bytes(&values),
        }
    };

    let record = WeightRecord {
        name,
        shape,
        kind,
        payload: RecordPayload::Dense { source_dtype, target_dtype, data },
    };
    record.validate()?;
    Ok(record)
}

fn build_quantized(
    tensor: SourceTensor,
    scales: Option<SourceTensor>,
    bit_width: u8,
) -> Result<WeightRecord> {
    quant::validate_bit_width(bit_width)?;
    if !matches!(tensor.dtype, DataType::I8 | DataType::U8) {
        return Err(Error::UnsupportedDType(format!(
            "{}: {:?} packed buffer, expected int8 or uint8",
            tensor.name, tensor.dtype
        )));
    }
    let scales = scales.ok_or_else(|| {
        Error::MissingField(format!("{}: scales of quantized linear weight", tensor.name))
    })?;
    let scales = quant::scales_to_f32(scales.dtype, &scales.data)?;

    let SourceTensor { name, shape, data, .. } = tensor;
    let record = WeightRecord {
        name,
        shape,
        kind: WeightKind::QuantizedLinear,
        payload: RecordPayload::Quantized { bit_width, scales, packed: data },
    };
    record.validate()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(name: &str, rows: usize, cols: usize) -> SourceParameter {
        let values: Vec<f32> = (0..rows * cols).map(|i| i as f32 * 0.5).collect();
        SourceParameter::new(
            SourceTensor::from_f32(name, vec![rows, cols], &values),
            Some(WeightRole::Linear),
        )
    }

    #[test]
    fn test_linear_float16_payload() {
        let record = WeightRecordBuilder::new(Precision::Float16).build(linear("w", 4, 4)).unwrap();
        assert_eq!(record.kind, WeightKind::Linear);
        assert_eq!(record.source_dtype(), Precision::Float16);
        assert_eq!(record.target_dtype(), Precision::Float16);
        assert_eq!(record.data().len(), 16 * 2);
        let back = quant::to_f32_vec(DataType::F16, record.data()).unwrap();
        assert_eq!(back[3], 1.5);
    }

    #[test]
    fn test_linear_int_targets_ship_float32() {
        for precision in [Precision::Int4, Precision::Int8, Precision::Float32] {
            let record = WeightRecordBuilder::new(precision).build(linear("w", 2, 3)).unwrap();
            assert_eq!(record.target_dtype(), precision);
            assert_eq!(record.source_dtype(), Precision::Float32);
            assert_eq!(record.data().len(), 6 * 4);
        }
    }

    #[test]
    fn test_embedding_always_float32() {
        for precision in Precision::ALL {
            let mut p = linear("embed_tokens.weight", 10, 4);
            p.role = Some(WeightRole::Embedding);
            let record = WeightRecordBuilder::new(precision).build(p).unwrap();
            assert_eq!(record.kind, WeightKind::Embedding);
            assert_eq!(record.target_dtype(), Precision::Float32);
            assert_eq!(record.source_dtype(), Precision::Float32);
        }
    }

    #[test]
    fn test_roleless_is_plain_float32() {
        let ids: Vec<u8> = [1i64, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let p = SourceParameter::new(SourceTensor::new("position_ids", vec![3], DataType::I64, ids), None);
        let record = WeightRecordBuilder::new(Precision::Int4).build(p).unwrap();
        assert_eq!(record.kind, WeightKind::Plain);
        assert_eq!(record.target_dtype(), Precision::Float32);
        assert_eq!(quant::to_f32_vec(DataType::F32, record.data()).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_bf16_linear_is_widened_then_narrowed() {
        let data: Vec<u8> = [1.0f32, -2.0]
            .iter()
            .flat_map(|v| half::bf16::from_f32(*v).to_bits().to_le_bytes())
            .collect();
        let p = SourceParameter::new(
            SourceTensor::new("w", vec![1, 2], DataType::BF16, data),
            Some(WeightRole::Linear),
        );
        let record = WeightRecordBuilder::new(Precision::Float16).build(p).unwrap();
        assert_eq!(quant::to_f32_vec(DataType::F16, record.data()).unwrap(), vec![1.0, -2.0]);
    }

    #[test]
    fn test_integer_linear_rejected() {
        let p = SourceParameter::new(
            SourceTensor::new("w", vec![2, 2], DataType::I32, vec![0; 16]),
            Some(WeightRole::Linear),
        );
        let err = WeightRecordBuilder::default().build(p).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDType(_)));
    }

    #[test]
    fn test_shape_mismatch() {
        let p = SourceParameter::new(
            SourceTensor::new("w", vec![4, 4], DataType::F32, vec![0; 60]),
            Some(WeightRole::Linear),
        );
        assert!(matches!(WeightRecordBuilder::default().build(p), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn test_unknown_precision_token() {
        assert!(matches!(WeightRecordBuilder::from_token("fp8"), Err(Error::UnsupportedDType(_))));
        assert_eq!(WeightRecordBuilder::from_token("int8").unwrap().precision(), Precision::Int8);
    }

    #[test]
    fn test_row_normalization_before_narrowing() {
        let p = SourceParameter::new(
            SourceTensor::from_f32("lm_head.weight", vec![2, 2], &[3.0, 4.0, 0.0, 2.0]),
            Some(WeightRole::Linear),
        )
        .with_row_normalization();
        let record = WeightRecordBuilder::new(Precision::Float16).build(p).unwrap();
        let values = quant::to_f32_vec(DataType::F16, record.data()).unwrap();
        assert!((values[0] - 0.6).abs() < 1e-3);
        assert!((values[1] - 0.8).abs() < 1e-3);
        assert_eq!(&values[2..], &[0.0, 1.0]);
    }

    #[test]
    fn test_quantized_passthrough() {
        let packed = vec![1u8, 2, 3, 4, 5, 6];
        let scales = SourceTensor::new(
            "w_scale",
            vec![2],
            DataType::F16,
            quant::f32_to_f16_bytes(&[0.5, 0.25]),
        );
        let p = SourceParameter::quantized(
            SourceTensor::new("w", vec![2, 3], DataType::I8, packed.clone()),
            scales,
            4,
        );
        let record = WeightRecordBuilder::new(Precision::Float16).build(p).unwrap();
        assert_eq!(record.kind, WeightKind::QuantizedLinear);
        assert_eq!(record.target_dtype(), Precision::Int4);
        match record.payload {
            RecordPayload::Quantized { bit_width, scales, packed: out } => {
                assert_eq!(bit_width, 4);
                assert_eq!(scales, vec![0.5, 0.25]);
                assert_eq!(out, packed);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_quantized_scale_length_checked() {
        let p = SourceParameter::quantized(
            SourceTensor::new("w", vec![2, 3], DataType::I8, vec![0; 6]),
            SourceTensor::from_f32("w_scale", vec![3], &[1.0, 1.0, 1.0]),
            8,
        );
        assert!(matches!(WeightRecordBuilder::default().build(p), Err(Error::ShapeMismatch(_))));
    }
}
