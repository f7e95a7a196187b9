use crate::model::{HasDtypeAndShape, TensorRecord, TensorTy};
use anyhow::Error;
use std::collections::HashMap;
use std::io::{Read, Seek};
use torch_pickle::{Dtype, Tensor, Value};
use tracing::{debug, warn};

/// Conventional key under which checkpoints nest their parameters.
pub const STATE_DICT_KEY: &str = "state_dict";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLeaf {
    pub dtype: TensorTy,
    pub shape: Vec<u64>,
}

impl TensorLeaf {
    pub fn of(tensor: &impl HasDtypeAndShape) -> Self {
        TensorLeaf {
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
        }
    }
}

impl HasDtypeAndShape for TensorLeaf {
    fn dtype(&self) -> TensorTy {
        self.dtype.clone()
    }

    fn shape(&self) -> &[u64] {
        &self.shape
    }
}

impl From<Dtype> for TensorTy {
    fn from(value: Dtype) -> Self {
        use TensorTy::*;
        match value {
            Dtype::Bool => BOOL,
            Dtype::U8 => U8,
            Dtype::I8 => I8,
            Dtype::I16 => I16,
            Dtype::U16 => U16,
            Dtype::I32 => I32,
            Dtype::U32 => U32,
            Dtype::I64 => I64,
            Dtype::U64 => U64,
            Dtype::F16 => F16,
            Dtype::BF16 => BF16,
            Dtype::F32 => F32,
            Dtype::F64 => F64,
            Dtype::F8E4M3 => F8_E4M3,
            Dtype::F8E5M2 => F8_E5M2,
            Dtype::C64 => C64,
            Dtype::C128 => C128,
            Dtype::Other(name) => Unknown(name),
        }
    }
}

impl HasDtypeAndShape for Tensor {
    fn dtype(&self) -> TensorTy {
        self.dtype.clone().into()
    }

    fn shape(&self) -> &[u64] {
        &self.shape
    }
}

/// A deserialized checkpoint, reduced to what metadata extraction needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointNode {
    /// Entries in the checkpoint's own key order.
    Mapping(Vec<(String, CheckpointNode)>),
    TensorLeaf(TensorLeaf),
    /// Anything else, described by its type name.
    OpaqueLeaf(String),
}

impl CheckpointNode {
    /// Converts the root mapping and its `state_dict`. Values nested deeper
    /// are only classified, never expanded.
    pub fn from_value(value: &Value) -> Self {
        let Some(items) = value.dict_items() else {
            return Self::classify(value);
        };
        let state_dict = items
            .iter()
            .rposition(|(key, _)| key.as_str() == Some(STATE_DICT_KEY));
        let entries = Self::entries(&items, |idx, child| {
            if Some(idx) == state_dict {
                match child.dict_items() {
                    Some(inner) => CheckpointNode::Mapping(Self::entries(&inner, |_, leaf| {
                        Self::classify(leaf)
                    })),
                    None => Self::classify(child),
                }
            } else {
                Self::classify(child)
            }
        });
        CheckpointNode::Mapping(entries)
    }

    fn entries(
        items: &[(Value, Value)],
        convert: impl Fn(usize, &Value) -> CheckpointNode,
    ) -> Vec<(String, CheckpointNode)> {
        let mut entries = Vec::with_capacity(items.len());
        for (idx, (key, child)) in items.iter().enumerate() {
            match key.as_key() {
                Some(name) => entries.push((name, convert(idx, child))),
                None => debug!(key = %key.type_name(), "skipping non-scalar checkpoint key"),
            }
        }
        entries
    }

    /// A single value as a leaf: tensors and numpy arrays keep their dtype
    /// and shape, everything else only its type name.
    fn classify(value: &Value) -> Self {
        if let Some(tensor) = value.as_tensor() {
            return CheckpointNode::TensorLeaf(TensorLeaf::of(tensor));
        }
        match torch_pickle::numpy::describe(value) {
            Some(array) => CheckpointNode::TensorLeaf(TensorLeaf::of(&array)),
            None => CheckpointNode::OpaqueLeaf(value.type_name()),
        }
    }

    /// Looks up a key; with repeated keys the last one wins, like a dict.
    pub fn get(&self, key: &str) -> Option<&CheckpointNode> {
        match self {
            CheckpointNode::Mapping(entries) => entries
                .iter()
                .rev()
                .find(|(name, _)| name == key)
                .map(|(_, node)| node),
            _ => None,
        }
    }

    fn kind(&self) -> &str {
        match self {
            CheckpointNode::Mapping(_) => "mapping",
            CheckpointNode::TensorLeaf(_) => "tensor",
            CheckpointNode::OpaqueLeaf(type_name) => type_name,
        }
    }
}

/// Deserializes a checkpoint stream and classifies its contents.
pub fn load<R: Read + Seek>(io: R) -> Result<CheckpointNode, Error> {
    let value = torch_pickle::read_checkpoint(io)?;
    Ok(CheckpointNode::from_value(&value))
}

/// Lists the entries of the checkpoint's state dict (or of the root when
/// there is none), one level deep.
pub fn walk(root: &CheckpointNode) -> Vec<TensorRecord> {
    let CheckpointNode::Mapping(root_entries) = root else {
        warn!("checkpoint root is not a mapping; no tensors to list");
        return Vec::new();
    };
    let target = match root.get(STATE_DICT_KEY) {
        Some(CheckpointNode::Mapping(entries)) => entries,
        Some(other) => {
            warn!(
                found = %other.kind(),
                "ignoring {STATE_DICT_KEY} that is not a mapping; listing the checkpoint root"
            );
            root_entries
        }
        None => root_entries,
    };

    let mut records: Vec<TensorRecord> = Vec::with_capacity(target.len());
    let mut seen: HashMap<&str, usize> = HashMap::with_capacity(target.len());
    for (name, node) in target {
        if name.is_empty() {
            warn!("skipping checkpoint entry with an empty name");
            continue;
        }
        let record = match node {
            CheckpointNode::TensorLeaf(leaf) => TensorRecord::from_tensor(name.as_str(), leaf),
            _ => TensorRecord::unknown(name.as_str()),
        };
        match seen.get(name.as_str()) {
            Some(&idx) => {
                warn!(name = %name, "duplicate checkpoint key; keeping the last value");
                records[idx] = record;
            }
            None => {
                seen.insert(name, records.len());
                records.push(record);
            }
        }
    }
    records
}
