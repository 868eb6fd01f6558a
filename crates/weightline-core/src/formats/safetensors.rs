/// Safetensors streaming reader
///
/// Layout: an 8-byte little-endian header length, a JSON header mapping
/// tensor names to `{dtype, shape, data_offsets}`, then the raw byte buffer.
/// Offsets in the header are relative to the start of that buffer.
use crate::error::{Error, Result};
use crate::tensor::{DataType, Shape, SourceTensor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

/// Upper bound on header size, rejects garbage before allocating
const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

/// One tensor described by the header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: DataType,
    pub shape: Shape,
    /// Absolute file offset of the first byte
    pub offset: u64,
    pub size_bytes: usize,
}

#[derive(Deserialize)]
struct RawEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [u64; 2],
}

/// Safetensors reader over any seekable source
pub struct SafetensorsReader<R: Read + Seek> {
    reader: R,
    tensors: Vec<TensorEntry>,
    metadata: HashMap<String, String>,
}

impl<R: Read + Seek> SafetensorsReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, tensors: Vec::new(), metadata: HashMap::new() }
    }

    /// Open and parse the header in one step
    pub fn open(reader: R) -> Result<Self> {
        let mut this = Self::new(reader);
        this.parse_header()?;
        Ok(this)
    }

    /// Parse the header; tensors come back in storage order
    pub fn parse_header(&mut self) -> Result<&[TensorEntry]> {
        self.reader.seek(SeekFrom::Start(0))?;
        let header_len = self.read_u64()?;
        if header_len > MAX_HEADER_LEN {
            return Err(Error::InvalidFormat(format!(
                "safetensors header of {} bytes",
                header_len
            )));
        }

        let mut header = vec![0u8; header_len as usize];
        self.reader.read_exact(&mut header)?;
        let header: Map<String, Value> = serde_json::from_slice(&header)
            .map_err(|e| Error::InvalidFormat(format!("Invalid safetensors header: {}", e)))?;

        let data_start = 8 + header_len;
        let file_len = self.reader.seek(SeekFrom::End(0))?;

        let mut tensors = Vec::with_capacity(header.len());
        let mut metadata = HashMap::new();
        for (name, value) in header {
            if name == "__metadata__" {
                if let Value::Object(map) = value {
                    for (k, v) in map {
                        if let Value::String(s) = v {
                            metadata.insert(k, s);
                        }
                    }
                }
                continue;
            }

            let raw: RawEntry = serde_json::from_value(value)
                .map_err(|e| Error::InvalidFormat(format!("{}: {}", name, e)))?;
            let dtype = DataType::from_safetensors(&raw.dtype)?;
            let [begin, end] = raw.data_offsets;
            let size_bytes = end.checked_sub(begin).ok_or_else(|| {
                Error::InvalidFormat(format!("{}: data offsets {} > {}", name, begin, end))
            })? as usize;
            let data_end = data_start.checked_add(end).ok_or_else(|| {
                Error::InvalidFormat(format!("{}: data offset {} overflows", name, end))
            })?;
            if data_end > file_len {
                return Err(Error::InvalidFormat(format!(
                    "{}: data ends at {} past end of file {}",
                    name, data_end, file_len
                )));
            }

            let shape = Shape::new(raw.shape);
            let needed = shape.checked_byte_len(dtype.size()).ok_or_else(|| {
                Error::InvalidFormat(format!("{}: shape {} is too large", name, shape))
            })?;
            if needed != size_bytes {
                return Err(Error::ShapeMismatch(format!(
                    "{}: shape {} as {:?} needs {} bytes, header says {}",
                    name, shape, dtype, needed, size_bytes
                )));
            }

            tensors.push(TensorEntry { name, dtype, shape, offset: data_start + begin, size_bytes });
        }
        tensors.sort_by_key(|t| t.offset);

        self.tensors = tensors;
        self.metadata = metadata;
        Ok(&self.tensors)
    }

    pub fn tensors(&self) -> &[TensorEntry] {
        &self.tensors
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn entry(&self, name: &str) -> Option<&TensorEntry> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Read tensor data chunk
    pub fn read_tensor_data(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; size];
        self.reader.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Read one tensor into an owned `SourceTensor`
    pub fn read_tensor(&mut self, name: &str) -> Result<SourceTensor> {
        let entry = self
            .entry(name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("Tensor not found: {}", name)))?;
        let data = self.read_tensor_data(entry.offset, entry.size_bytes)?;
        Ok(SourceTensor { name: entry.name, shape: entry.shape, dtype: entry.dtype, data })
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Write tensors as a safetensors file, in the given order
pub fn write_safetensors<W: Write>(writer: &mut W, tensors: &[SourceTensor]) -> Result<()> {
    let mut header = Map::new();
    let mut offset = 0u64;
    for t in tensors {
        t.validate()?;
        let end = offset + t.data.len() as u64;
        header.insert(
            t.name.clone(),
            serde_json::json!({
                "dtype": t.dtype.safetensors_tag(),
                "shape": t.shape.dims(),
                "data_offsets": [offset, end],
            }),
        );
        offset = end;
    }

    let mut header = serde_json::to_vec(&Value::Object(header))?;
    // data section starts 8-byte aligned
    while header.len() % 8 != 0 {
        header.push(b' ');
    }

    writer.write_all(&(header.len() as u64).to_le_bytes())?;
    writer.write_all(&header)?;
    for t in tensors {
        writer.write_all(&t.data)?;
    }
    Ok(())
}
