use std::fmt;

/// Dtype reported for checkpoint entries that are not tensors.
pub const UNKNOWN_DTYPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum TensorTy {
    BOOL,
    U8,
    I8,
    F8_E5M2,
    F8_E4M3,
    I16,
    U16,
    F16,
    BF16,
    I32,
    U32,
    F32,
    F64,
    I64,
    U64,
    C64,
    C128,
    Unknown(String),
}

impl TensorTy {
    /// Bytes per element, when the tag is one we know.
    pub fn size_bytes(&self) -> Option<u64> {
        use TensorTy::*;
        Some(match self {
            BOOL | U8 | I8 | F8_E5M2 | F8_E4M3 => 1,
            I16 | U16 | F16 | BF16 => 2,
            I32 | U32 | F32 => 4,
            F64 | I64 | U64 | C64 => 8,
            C128 => 16,
            Unknown(_) => return None,
        })
    }
}

impl fmt::Display for TensorTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TensorTy::*;
        let text = match self {
            BOOL => "BOOL",
            U8 => "U8",
            I8 => "I8",
            F8_E5M2 => "F8_E5M2",
            F8_E4M3 => "F8_E4M3",
            I16 => "I16",
            U16 => "U16",
            F16 => "F16",
            BF16 => "BF16",
            I32 => "I32",
            U32 => "U32",
            F32 => "F32",
            F64 => "F64",
            I64 => "I64",
            U64 => "U64",
            C64 => "C64",
            C128 => "C128",
            Unknown(text) => text,
        };
        write!(f, "{}", text)
    }
}

/// Anything that can describe a tensor without holding its data.
pub trait HasDtypeAndShape {
    fn dtype(&self) -> TensorTy;
    fn shape(&self) -> &[u64];
}

/// One output line: a tensor's name, element type and shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRecord {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<u64>,
}

impl TensorRecord {
    pub fn from_tensor(name: impl Into<String>, tensor: &impl HasDtypeAndShape) -> Self {
        TensorRecord {
            name: name.into(),
            dtype: tensor.dtype().to_string(),
            shape: tensor.shape().to_vec(),
        }
    }

    pub fn unknown(name: impl Into<String>) -> Self {
        TensorRecord {
            name: name.into(),
            dtype: UNKNOWN_DTYPE.to_string(),
            shape: Vec::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.dtype == UNKNOWN_DTYPE
    }

    /// Element count; zero for entries that are not tensors. Saturates at
    /// `u64::MAX` for shapes too large to count.
    pub fn params(&self) -> u64 {
        if self.is_unknown() || self.shape.contains(&0) {
            return 0;
        }
        self.shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
            .unwrap_or(u64::MAX)
    }
}

/// Parameter count across records, saturating like [`TensorRecord::params`].
pub fn total_params(records: &[TensorRecord]) -> u64 {
    records
        .iter()
        .map(TensorRecord::params)
        .fold(0, u64::saturating_add)
}

/// Renders a shape as `(2, 3)`, `(10)` or `()`.
pub struct Shape<'a>(pub &'a [u64]);

impl fmt::Display for Shape<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for TensorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.name, self.dtype, Shape(&self.shape))
    }
}
