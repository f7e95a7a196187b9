use crate::model::{HasDtypeAndShape, TensorRecord, TensorTy};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{self, Read};
use thiserror::Error;

/// Reserved header key holding free-form string annotations.
pub const METADATA_KEY: &str = "__metadata__";

const PREFIX_LEN: u64 = 8;
const HEADER_MIB_LIMIT: u64 = 100;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("file is truncated: needed {needed} bytes but only {available} are available")]
    Truncated { needed: u64, available: u64 },
    #[error(
        "header is {0} bytes, over the {limit}MiB limit; is this a safetensors file?",
        limit = HEADER_MIB_LIMIT
    )]
    HeaderTooLarge(u64),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("tensor {name:?} has invalid data_offsets [{begin}, {end}]: {problem}")]
    InvalidOffsets {
        name: String,
        begin: u64,
        end: u64,
        problem: OffsetProblem,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OffsetProblem {
    #[error("range is inverted")]
    Inverted,
    #[error("range ends past the {data_len} byte data section")]
    OutOfRange { data_len: u64 },
    #[error("range holds {actual} bytes but dtype and shape need {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("range overlaps tensor {other:?}")]
    Overlaps { other: String },
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: (u64, u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub name: String,
    pub dtype: TensorTy,
    pub shape: Vec<u64>,
    pub data_offsets: (u64, u64),
}

impl TensorDescriptor {
    fn expected_len(&self) -> Option<u64> {
        let numel = self
            .shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))?;
        self.dtype.size_bytes()?.checked_mul(numel)
    }

    fn offset_error(&self, problem: OffsetProblem) -> FormatError {
        let (begin, end) = self.data_offsets;
        FormatError::InvalidOffsets {
            name: self.name.clone(),
            begin,
            end,
            problem,
        }
    }
}

impl HasDtypeAndShape for TensorDescriptor {
    fn dtype(&self) -> TensorTy {
        self.dtype.clone()
    }

    fn shape(&self) -> &[u64] {
        &self.shape
    }
}

impl From<::safetensors::Dtype> for TensorTy {
    fn from(value: ::safetensors::Dtype) -> Self {
        use ::safetensors::Dtype;
        use TensorTy::*;
        match value {
            Dtype::BOOL => BOOL,
            Dtype::U8 => U8,
            Dtype::I8 => I8,
            Dtype::F8_E5M2 => F8_E5M2,
            Dtype::F8_E4M3 => F8_E4M3,
            Dtype::I16 => I16,
            Dtype::U16 => U16,
            Dtype::F16 => F16,
            Dtype::BF16 => BF16,
            Dtype::I32 => I32,
            Dtype::U32 => U32,
            Dtype::F32 => F32,
            Dtype::F64 => F64,
            Dtype::I64 => I64,
            Dtype::U64 => U64,
            _ => Unknown(format!("{:?}", value)),
        }
    }
}

/// Tags the `safetensors` crate knows map onto [`TensorTy`]; anything else
/// is kept verbatim.
fn dtype_from_tag(tag: &str) -> TensorTy {
    match serde_json::from_value::<::safetensors::Dtype>(Value::String(tag.to_string())) {
        Ok(dtype) => dtype.into(),
        Err(_) => TensorTy::Unknown(tag.to_string()),
    }
}

/// The decoded JSON header of a safetensors file.
#[derive(Debug, Clone, Default)]
pub struct Header {
    /// Length of the JSON text, excluding the 8 byte prefix.
    pub header_len: u64,
    /// Bytes following the header, where tensor data lives.
    pub data_len: u64,
    /// Tensors in the order the header lists them.
    pub tensors: Vec<TensorDescriptor>,
    pub metadata: BTreeMap<String, String>,
}

impl Header {
    pub fn parse(bytes: &[u8], data_len: u64) -> Result<Header, FormatError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| FormatError::InvalidHeader(format!("header is not UTF-8: {e}")))?;
        let map: Map<String, Value> =
            serde_json::from_str(text).map_err(|e| FormatError::InvalidHeader(e.to_string()))?;

        let mut header = Header {
            header_len: bytes.len() as u64,
            data_len,
            tensors: Vec::with_capacity(map.len()),
            metadata: BTreeMap::new(),
        };
        for (name, value) in map {
            if name == METADATA_KEY {
                let metadata: Option<BTreeMap<String, String>> = serde_json::from_value(value)
                    .map_err(|e| FormatError::InvalidHeader(format!("{METADATA_KEY}: {e}")))?;
                header.metadata = metadata.unwrap_or_default();
                continue;
            }
            if name.is_empty() {
                return Err(FormatError::InvalidHeader("empty tensor name".to_string()));
            }
            let raw: RawDescriptor = serde_json::from_value(value)
                .map_err(|e| FormatError::InvalidHeader(format!("tensor {name:?}: {e}")))?;
            header.tensors.push(TensorDescriptor {
                dtype: dtype_from_tag(&raw.dtype),
                name,
                shape: raw.shape,
                data_offsets: raw.data_offsets,
            });
        }
        Ok(header)
    }

    pub fn records(&self) -> Vec<TensorRecord> {
        self.tensors
            .iter()
            .map(|tensor| TensorRecord::from_tensor(tensor.name.clone(), tensor))
            .collect()
    }

    /// Checks every `data_offsets` range against the data section. Problems
    /// come back as [`FormatError::InvalidOffsets`]; they never invalidate
    /// the header itself.
    pub fn validate_offsets(&self) -> Vec<FormatError> {
        let mut errors = Vec::new();
        let mut ranges = Vec::with_capacity(self.tensors.len());
        for (idx, tensor) in self.tensors.iter().enumerate() {
            let (begin, end) = tensor.data_offsets;
            if begin > end {
                errors.push(tensor.offset_error(OffsetProblem::Inverted));
                continue;
            }
            if end > self.data_len {
                errors.push(tensor.offset_error(OffsetProblem::OutOfRange {
                    data_len: self.data_len,
                }));
                continue;
            }
            match tensor.expected_len() {
                Some(expected) if expected != end - begin => {
                    errors.push(tensor.offset_error(OffsetProblem::SizeMismatch {
                        expected,
                        actual: end - begin,
                    }));
                }
                _ => (),
            }
            if begin < end {
                ranges.push((begin, end, idx));
            }
        }

        ranges.sort_unstable();
        let mut reach: Option<(u64, usize)> = None;
        for (begin, end, idx) in ranges {
            if let Some((reach_end, owner)) = reach {
                if begin < reach_end {
                    errors.push(self.tensors[idx].offset_error(OffsetProblem::Overlaps {
                        other: self.tensors[owner].name.clone(),
                    }));
                }
                if end <= reach_end {
                    continue;
                }
            }
            reach = Some((end, idx));
        }
        errors
    }
}

fn read_exact<I: Read>(io: &mut I, buf: &mut [u8], file_len: u64) -> Result<(), FormatError> {
    io.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FormatError::Truncated {
            needed: buf.len() as u64,
            available: file_len,
        },
        _ => FormatError::Io(e),
    })
}

/// Reads only the length prefix and the JSON header from `io`, which must be
/// positioned at the start of a file of `file_len` bytes.
pub fn read_header<I: Read>(io: &mut I, file_len: u64) -> Result<Header, FormatError> {
    if file_len < PREFIX_LEN {
        return Err(FormatError::Truncated {
            needed: PREFIX_LEN,
            available: file_len,
        });
    }
    let mut header_size_bytes = [0u8; PREFIX_LEN as usize];
    read_exact(io, &mut header_size_bytes, file_len)?;
    let n = u64::from_le_bytes(header_size_bytes);

    let available = file_len - PREFIX_LEN;
    if n > available {
        return Err(FormatError::Truncated {
            needed: PREFIX_LEN.saturating_add(n),
            available: file_len,
        });
    }
    if n > HEADER_MIB_LIMIT * 1024 * 1024 {
        return Err(FormatError::HeaderTooLarge(n));
    }

    let mut metadata_bytes = vec![0u8; n as usize];
    read_exact(io, &mut metadata_bytes, file_len)?;
    Header::parse(&metadata_bytes, available - n)
}

/// Decodes the header of an in-memory safetensors file.
pub fn decode(bytes: &[u8]) -> Result<Header, FormatError> {
    read_header(&mut &bytes[..], bytes.len() as u64)
}
