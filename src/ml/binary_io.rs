// Binary persistence for materialized tensors.
//
// File layout (little-endian):
//   magic "QTML" | version u8 | content type u8 | tensor count u32 | tensor records
// Tensor record:
//   bits u8 (32/16/8) | rows u32 | columns u32 | channels u32 | quarter bias i32 | values

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use half::f16;

use super::{Bits, Shape, Tensor, TensorData};
use crate::error::{MlError, Result};

/// Magic bytes for file format identification: "QTML"
const MAGIC: &[u8; 4] = b"QTML";
/// Format version
const VERSION: u8 = 1;

// Content type constants
pub const TYPE_TENSOR: u8 = 1;
pub const TYPE_FULLY_CONNECTED: u8 = 2;
pub const TYPE_BIAS: u8 = 3;
pub const TYPE_CONVOLUTION_2D: u8 = 4;

/// Write header (magic + version + content type)
pub fn write_header<W: Write>(writer: &mut W, content_type: u8) -> Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION, content_type])?;
    Ok(())
}

/// Read and verify header
pub fn read_header<R: Read>(reader: &mut R, expected_type: u8) -> Result<()> {
    let mut magic_buf = [0u8; 4];
    reader.read_exact(&mut magic_buf)?;
    if &magic_buf != MAGIC {
        return Err(MlError::InvalidFormat("magic bytes mismatch".to_string()));
    }

    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    let [version, content_type] = buf;
    if version != VERSION {
        return Err(MlError::InvalidFormat(format!(
            "unsupported version: {version}"
        )));
    }
    if content_type != expected_type {
        return Err(MlError::InvalidFormat(format!(
            "content type mismatch: expected {expected_type}, got {content_type}"
        )));
    }
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Materialize `tensor` at `bits` and write one tensor record.
pub fn write_tensor<W: Write>(writer: &mut W, tensor: &Tensor, bits: Bits) -> Result<()> {
    let tensor = match tensor.bits() {
        Some(current) if current == bits => tensor.clone(),
        _ => tensor.materialize(bits),
    };
    let shape = tensor.shape();
    writer.write_all(&[bits.bits()])?;
    for dim in [shape.rows, shape.columns, shape.channels] {
        writer.write_all(&(dim as u32).to_le_bytes())?;
    }
    writer.write_all(&tensor.quarter_bias().unwrap_or(0).to_le_bytes())?;

    match tensor.data() {
        Some(TensorData::F32(values)) => {
            for value in values {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        Some(TensorData::F16(values)) => {
            for value in values {
                writer.write_all(&value.to_bits().to_le_bytes())?;
            }
        }
        Some(TensorData::Quarter { data, .. }) => writer.write_all(data)?,
        _ => {
            return Err(MlError::InvalidArgument(
                "tensor did not materialize to a buffer".to_string(),
            ))
        }
    }
    Ok(())
}

/// Read one tensor record, restoring its bit width and quarter bias.
///
/// Extents come from the file, so the payload is read through a bounded reader and a
/// short payload is reported as [`MlError::InvalidFormat`].
pub fn read_tensor<R: Read>(reader: &mut R) -> Result<Tensor> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    let bits = Bits::from_bits(tag[0]).map_err(|e| MlError::InvalidFormat(e.to_string()))?;
    let rows = read_u32(reader)? as usize;
    let columns = read_u32(reader)? as usize;
    let channels = read_u32(reader)? as usize;
    let bias = read_u32(reader)? as i32;
    let shape = Shape::new(rows, columns, channels);

    let byte_len = rows
        .checked_mul(columns)
        .and_then(|n| n.checked_mul(channels))
        .and_then(|n| n.checked_mul(usize::from(bits.bits() / 8)))
        .ok_or_else(|| MlError::InvalidFormat(format!("tensor extents overflow: {shape}")))?;
    let mut payload = Vec::new();
    reader
        .by_ref()
        .take(byte_len as u64)
        .read_to_end(&mut payload)?;
    if payload.len() != byte_len {
        return Err(MlError::InvalidFormat(format!(
            "{shape} tensor needs {byte_len} bytes, file holds {}",
            payload.len()
        )));
    }

    let data = match bits {
        Bits::F32 => TensorData::F32(
            payload
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
        Bits::F16 => TensorData::F16(
            payload
                .chunks_exact(2)
                .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])))
                .collect(),
        ),
        Bits::Quarter => TensorData::Quarter {
            data: payload,
            bias,
        },
    };
    Tensor::from_data(shape, data)
}

/// Write a header followed by every tensor in `tensors`.
pub fn save_tensors(path: &Path, content_type: u8, tensors: &[Tensor], bits: Bits) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    write_header(&mut writer, content_type)?;
    writer.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for tensor in tensors {
        write_tensor(&mut writer, tensor, bits)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn load_tensors(path: &Path, content_type: u8) -> Result<Vec<Tensor>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    read_header(&mut reader, content_type)?;
    let count = read_u32(&mut reader)? as usize;
    (0..count).map(|_| read_tensor(&mut reader)).collect()
}

pub fn save_tensor(path: &Path, tensor: &Tensor, bits: Bits) -> Result<()> {
    save_tensors(path, TYPE_TENSOR, std::slice::from_ref(tensor), bits)
}

pub fn load_tensor(path: &Path) -> Result<Tensor> {
    let mut tensors = load_tensors(path, TYPE_TENSOR)?;
    match tensors.pop() {
        Some(tensor) if tensors.is_empty() => Ok(tensor),
        _ => Err(MlError::InvalidFormat(
            "expected exactly one tensor".to_string(),
        )),
    }
}
