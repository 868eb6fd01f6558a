//! Element conversion and quantized-weight primitives
//!
//! Everything here works on little-endian byte buffers, which is the layout
//! both safetensors files and the native runtime use.

use crate::error::{Error, Result};
use crate::tensor::DataType;
use half::{bf16, f16};
use rayon::prelude::*;

/// Buffers at least this many elements long are converted with rayon
pub const PARALLEL_THRESHOLD: usize = 1 << 16;

/// Bit widths the native runtime accepts for pre-quantized linear weights
pub const SUPPORTED_BIT_WIDTHS: [u8; 2] = [4, 8];

/// Widen a buffer of `dtype` to f32 values.
///
/// Integer types are cast numerically, the same way a framework would cast
/// an integer buffer to float before export.
pub fn to_f32_vec(dtype: DataType, data: &[u8]) -> Result<Vec<f32>> {
    let width = dtype.size();
    if data.len() % width != 0 {
        return Err(Error::ShapeMismatch(format!(
            "{} bytes is not a whole number of {:?} elements",
            data.len(),
            dtype
        )));
    }

    let convert = |c: &[u8]| -> f32 {
        match dtype {
            DataType::F32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            DataType::F16 => f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32(),
            DataType::BF16 => bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32(),
            DataType::F64 => {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
            }
            DataType::I8 => c[0] as i8 as f32,
            DataType::U8 => c[0] as f32,
            DataType::I32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32,
            DataType::I64 => {
                i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
            }
        }
    };

    if data.len() / width >= PARALLEL_THRESHOLD {
        Ok(data.par_chunks_exact(width).map(convert).collect())
    } else {
        Ok(data.chunks_exact(width).map(convert).collect())
    }
}

/// Serialize f32 values as little-endian bytes
pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Narrow f32 values to little-endian f16 bytes
pub fn f32_to_f16_bytes(values: &[f32]) -> Vec<u8> {
    if values.len() >= PARALLEL_THRESHOLD {
        values
            .par_iter()
            .flat_map_iter(|v| f16::from_f32(*v).to_bits().to_le_bytes())
            .collect()
    } else {
        values.iter().flat_map(|v| f16::from_f32(*v).to_bits().to_le_bytes()).collect()
    }
}

/// Divide every row of a `[rows, cols]` matrix by its Euclidean norm.
///
/// Rows with zero norm are left untouched. The norm is clamped from below by
/// `1e-12`, matching the usual functional `normalize` definition.
pub fn l2_normalize_rows(values: &mut [f32], cols: usize) -> Result<()> {
    if cols == 0 || values.len() % cols != 0 {
        return Err(Error::ShapeMismatch(format!(
            "{} values cannot be split into rows of {}",
            values.len(),
            cols
        )));
    }

    let normalize = |row: &mut [f32]| {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            let inv = 1.0 / norm.max(1e-12);
            row.iter_mut().for_each(|v| *v *= inv);
        }
    };

    if values.len() >= PARALLEL_THRESHOLD {
        values.par_chunks_mut(cols).for_each(normalize);
    } else {
        values.chunks_mut(cols).for_each(normalize);
    }
    Ok(())
}

/// Check a bit width for a pre-quantized linear weight
pub fn validate_bit_width(bits: u8) -> Result<()> {
    if SUPPORTED_BIT_WIDTHS.contains(&bits) {
        Ok(())
    } else {
        Err(Error::UnsupportedDType(format!("{}-bit quantized linear weight", bits)))
    }
}

/// Per-output-channel scales widened to f32
pub fn scales_to_f32(dtype: DataType, data: &[u8]) -> Result<Vec<f32>> {
    if !dtype.is_float() {
        return Err(Error::UnsupportedDType(format!("{:?} quantization scales", dtype)));
    }
    to_f32_vec(dtype, data)
}
