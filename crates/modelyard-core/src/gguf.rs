//! GGUF container metadata reader.
//!
//! Parses the header, key/value metadata, and tensor directory of a GGUF
//! weight file without touching the tensor data itself, and derives a
//! human-facing summary (architecture, quantization, context length) from
//! the well-known metadata keys. Everything is read from an in-memory byte
//! slice; the reader performs no I/O beyond [`parse_file`] loading the file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// The fixed 4-byte token at the start of every GGUF file.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Oldest header layout this reader understands.
pub const GGUF_VERSION_MIN: u32 = 1;

/// Newest known header layout. Later versions are attempted with this
/// layout on a best-effort basis.
pub const GGUF_VERSION_LATEST: u32 = 3;

/// Nested metadata arrays deeper than this are rejected as corrupt.
const MAX_ARRAY_DEPTH: usize = 16;

/// Fixed header of a GGUF file. The magic is validated, not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
}

/// A decoded metadata value. The wire format tags these 0..=12 in this
/// order; the enum is matched exhaustively everywhere so an unhandled tag
/// is a compile-time gap, not a silent misread.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widening read of any non-negative integer value.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            GgufValue::U8(n) => Some(u64::from(*n)),
            GgufValue::U16(n) => Some(u64::from(*n)),
            GgufValue::U32(n) => Some(u64::from(*n)),
            GgufValue::U64(n) => Some(*n),
            GgufValue::I8(n) => u64::try_from(*n).ok(),
            GgufValue::I16(n) => u64::try_from(*n).ok(),
            GgufValue::I32(n) => u64::try_from(*n).ok(),
            GgufValue::I64(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }
}

/// Directory entry for one tensor. Element type tags are advisory and kept
/// numeric even when unknown; only the metadata section is load-bearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub type_tag: u32,
    pub offset: u64,
}

/// Full parse result for one weight file. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMetadata {
    pub architecture: String,
    pub display_name: String,
    pub parameter_count: Option<u64>,
    /// Mode of the tensor element types, as a human-readable label.
    pub quantization: String,
    pub context_length: Option<u64>,
    pub file_size: u64,
    /// Raw metadata entries in file order. Keys are unique; on a duplicate
    /// key the last value wins but the first position is kept.
    pub entries: Vec<(String, GgufValue)>,
    pub tensors: Vec<TensorInfo>,
}

impl ModelMetadata {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(GgufValue::as_str)
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(GgufValue::as_u64)
    }
}

/// Serde-friendly summary of a parse, used by the scan catalog and the
/// on-disk metadata cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub architecture: String,
    pub display_name: String,
    pub parameter_count: Option<u64>,
    pub quantization: String,
    pub context_length: Option<u64>,
    pub file_size: u64,
}

impl From<&ModelMetadata> for ModelSummary {
    fn from(meta: &ModelMetadata) -> Self {
        Self {
            architecture: meta.architecture.clone(),
            display_name: meta.display_name.clone(),
            parameter_count: meta.parameter_count,
            quantization: meta.quantization.clone(),
            context_length: meta.context_length,
            file_size: meta.file_size,
        }
    }
}

/// Parse a GGUF file from disk. The display-name fallback is derived from
/// the filename stem.
pub fn parse_file(path: &Path) -> Result<ModelMetadata> {
    let data = std::fs::read(path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    parse_bytes(&data, &stem)
}

/// Parse a GGUF file from raw bytes. `source_name` is the display-name
/// fallback when the file carries no `general.name` entry.
pub fn parse_bytes(data: &[u8], source_name: &str) -> Result<ModelMetadata> {
    if data.len() < 4 || data[..4] != GGUF_MAGIC {
        return Err(Error::InvalidFormat(format!(
            "'{source_name}' does not start with the GGUF magic"
        )));
    }

    let mut reader = Reader {
        data,
        pos: GGUF_MAGIC.len(),
    };
    let header = read_header(&mut reader)?;
    debug!(
        version = header.version,
        tensors = header.tensor_count,
        kv = header.kv_count,
        "parsing GGUF metadata"
    );

    let mut entries: Vec<(String, GgufValue)> = Vec::new();
    for _ in 0..header.kv_count {
        let key = reader.read_string()?;
        let tag_offset = reader.pos as u64;
        let tag = reader.read_u32()?;
        let value = read_value(&mut reader, tag, tag_offset, 0)?;
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => entries.push((key, value)),
        }
    }

    let mut tensors = Vec::new();
    for _ in 0..header.tensor_count {
        tensors.push(read_tensor_info(&mut reader)?);
    }

    let architecture = entries
        .iter()
        .find(|(k, _)| k == "general.architecture")
        .and_then(|(_, v)| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let mut meta = ModelMetadata {
        architecture,
        display_name: String::new(),
        parameter_count: None,
        quantization: quantization_mode(&tensors),
        context_length: None,
        file_size: data.len() as u64,
        entries,
        tensors,
    };

    meta.display_name = meta
        .get_str("general.name")
        .unwrap_or(source_name)
        .to_string();
    meta.parameter_count = meta.get_u64("general.parameter_count");
    if meta.architecture != "unknown" {
        meta.context_length = meta.get_u64(&format!("{}.context_length", meta.architecture));
    }

    Ok(meta)
}

/// Probe whether a file starts with the GGUF magic. Reads only 4 bytes.
pub fn is_gguf_file(path: &Path) -> bool {
    use std::io::Read;

    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).is_ok() && magic == GGUF_MAGIC
}

fn read_header(reader: &mut Reader<'_>) -> Result<GgufHeader> {
    let version = reader.read_u32()?;
    if version < GGUF_VERSION_MIN {
        return Err(Error::UnsupportedVersion(version));
    }
    if version > GGUF_VERSION_LATEST {
        warn!(version, "GGUF version newer than supported; reading with the v{GGUF_VERSION_LATEST} layout");
    }

    // Version 1 carries 32-bit counts; everything later uses 64-bit.
    let (tensor_count, kv_count) = if version == 1 {
        (
            u64::from(reader.read_u32()?),
            u64::from(reader.read_u32()?),
        )
    } else {
        (reader.read_u64()?, reader.read_u64()?)
    };

    Ok(GgufHeader {
        version,
        tensor_count,
        kv_count,
    })
}

fn read_value(
    reader: &mut Reader<'_>,
    tag: u32,
    tag_offset: u64,
    depth: usize,
) -> Result<GgufValue> {
    match tag {
        0 => Ok(GgufValue::U8(reader.read_u8()?)),
        1 => Ok(GgufValue::I8(reader.read_i8()?)),
        2 => Ok(GgufValue::U16(reader.read_u16()?)),
        3 => Ok(GgufValue::I16(reader.read_i16()?)),
        4 => Ok(GgufValue::U32(reader.read_u32()?)),
        5 => Ok(GgufValue::I32(reader.read_i32()?)),
        6 => Ok(GgufValue::F32(reader.read_f32()?)),
        7 => Ok(GgufValue::Bool(reader.read_bool()?)),
        8 => Ok(GgufValue::String(reader.read_string()?)),
        9 => {
            if depth >= MAX_ARRAY_DEPTH {
                return Err(Error::CorruptFile {
                    offset: tag_offset,
                    reason: format!("metadata array nested deeper than {MAX_ARRAY_DEPTH} levels"),
                });
            }
            let elem_tag_offset = reader.pos as u64;
            let elem_tag = reader.read_u32()?;
            let count_offset = reader.pos as u64;
            let count = reader.read_u64()?;
            // Every element occupies at least one byte on the wire, so a
            // count beyond the remaining input is unsatisfiable.
            if count > reader.remaining() as u64 {
                return Err(Error::CorruptFile {
                    offset: count_offset,
                    reason: format!(
                        "array length {count} exceeds the {} bytes left in the file",
                        reader.remaining()
                    ),
                });
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(read_value(reader, elem_tag, elem_tag_offset, depth + 1)?);
            }
            Ok(GgufValue::Array(items))
        }
        10 => Ok(GgufValue::U64(reader.read_u64()?)),
        11 => Ok(GgufValue::I64(reader.read_i64()?)),
        12 => Ok(GgufValue::F64(reader.read_f64()?)),
        other => Err(Error::CorruptFile {
            offset: tag_offset,
            reason: format!("unknown metadata type tag {other}"),
        }),
    }
}

fn read_tensor_info(reader: &mut Reader<'_>) -> Result<TensorInfo> {
    let name = reader.read_string()?;
    let dims_offset = reader.pos as u64;
    let n_dims = reader.read_u32()?;
    // Eight bytes per dimension on the wire.
    if u64::from(n_dims) * 8 > reader.remaining() as u64 {
        return Err(Error::CorruptFile {
            offset: dims_offset,
            reason: format!(
                "tensor '{name}' declares {n_dims} dimensions but only {} bytes remain",
                reader.remaining()
            ),
        });
    }
    let mut dims = Vec::with_capacity(n_dims as usize);
    for _ in 0..n_dims {
        dims.push(reader.read_u64()?);
    }
    let type_tag = reader.read_u32()?;
    let offset = reader.read_u64()?;
    Ok(TensorInfo {
        name,
        dims,
        type_tag,
        offset,
    })
}

/// Human-readable label for a GGML tensor element type tag, per the GGUF v3
/// type enumeration. Returns `None` for tags the table does not know.
pub fn quant_label(tag: u32) -> Option<&'static str> {
    Some(match tag {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        6 => "Q5_0",
        7 => "Q5_1",
        8 => "Q8_0",
        9 => "Q8_1",
        10 => "Q2_K",
        11 => "Q3_K",
        12 => "Q4_K",
        13 => "Q5_K",
        14 => "Q6_K",
        15 => "Q8_K",
        16 => "IQ2_XXS",
        17 => "IQ2_XS",
        18 => "IQ3_XXS",
        19 => "IQ1_S",
        20 => "IQ4_NL",
        21 => "IQ3_S",
        22 => "IQ2_S",
        23 => "IQ4_XS",
        24 => "I8",
        25 => "I16",
        26 => "I32",
        27 => "I64",
        28 => "F64",
        29 => "IQ1_M",
        30 => "BF16",
        _ => return None,
    })
}

/// The dominant quantization of a tensor set: the statistical mode of the
/// element type tags, rendered through [`quant_label`]. Ties break toward
/// the smaller tag; unmapped tags render as `unknown(<tag>)`.
fn quantization_mode(tensors: &[TensorInfo]) -> String {
    let mut counts: Vec<(u32, usize)> = Vec::new();
    for info in tensors {
        match counts.iter_mut().find(|(tag, _)| *tag == info.type_tag) {
            Some(entry) => entry.1 += 1,
            None => counts.push((info.type_tag, 1)),
        }
    }
    let Some((tag, _)) = counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
    else {
        return "unknown".to_string();
    };
    match quant_label(tag) {
        Some(label) => label.to_string(),
        None => format!("unknown({tag})"),
    }
}

/// Bounds-checked little-endian cursor over the input bytes. Every short
/// read reports the offset where the field began.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::CorruptFile {
                offset: self.pos as u64,
                reason: format!("needed {n} bytes but only {} remain", self.remaining()),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// String: u64 byte length followed by UTF-8 bytes. Lengths are byte
    /// counts, never character counts. A length beyond the remaining input
    /// is rejected before any allocation happens.
    fn read_string(&mut self) -> Result<String> {
        let len_offset = self.pos as u64;
        let len = self.read_u64()?;
        if len > self.remaining() as u64 {
            return Err(Error::CorruptFile {
                offset: len_offset,
                reason: format!(
                    "string length {len} exceeds the {} bytes left in the file",
                    self.remaining()
                ),
            });
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::CorruptFile {
            offset: len_offset,
            reason: format!("string is not valid UTF-8: {e}"),
        })
    }
}
