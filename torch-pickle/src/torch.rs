use crate::value::{Global, Object, Value};
use anyhow::{Error, anyhow, bail, ensure};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dtype {
    Bool,
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F16,
    BF16,
    F32,
    F64,
    F8E4M3,
    F8E5M2,
    C64,
    C128,
    Other(String),
}

impl Dtype {
    /// Maps a legacy typed-storage class (`torch.FloatStorage`, ...) to its
    /// element type.
    pub fn from_storage_class(name: &str) -> Option<Dtype> {
        use Dtype::*;
        let stem = name.strip_suffix("Storage")?;
        Some(match stem {
            "Bool" => Bool,
            "Byte" => U8,
            "Char" => I8,
            "Short" => I16,
            "UInt16" => U16,
            "Int" => I32,
            "UInt32" => U32,
            "Long" => I64,
            "UInt64" => U64,
            "Half" => F16,
            "BFloat16" => BF16,
            "Float" => F32,
            "Double" => F64,
            "Float8_e4m3fn" => F8E4M3,
            "Float8_e5m2" => F8E5M2,
            "ComplexFloat" => C64,
            "ComplexDouble" => C128,
            "Untyped" => U8,
            other => Other(other.to_string()),
        })
    }

    /// Maps a `torch.<dtype>` attribute name to its element type.
    pub fn from_torch_name(name: &str) -> Option<Dtype> {
        use Dtype::*;
        Some(match name {
            "bool" => Bool,
            "uint8" => U8,
            "int8" => I8,
            "int16" | "short" => I16,
            "uint16" => U16,
            "int32" | "int" => I32,
            "uint32" => U32,
            "int64" | "long" => I64,
            "uint64" => U64,
            "float16" | "half" => F16,
            "bfloat16" => BF16,
            "float32" | "float" => F32,
            "float64" | "double" => F64,
            "float8_e4m3fn" => F8E4M3,
            "float8_e5m2" => F8E5M2,
            "complex64" | "cfloat" => C64,
            "complex128" | "cdouble" => C128,
            "qint8" | "quint8" | "qint32" | "quint4x2" => Other(name.to_string()),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    pub dtype: Dtype,
    pub key: String,
}

/// What `torch.load` would rebuild, minus the data: element type, shape and
/// where the elements live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub stride: Vec<u64>,
    pub storage_offset: u64,
    pub storage: Option<Rc<Storage>>,
}

fn opaque(class: Value, args: Vec<Value>) -> Value {
    Value::new_object(Object {
        class: Some(class),
        args,
        ..Object::default()
    })
}

fn tuple_items(value: Value, what: &str) -> Result<Vec<Value>, Error> {
    match value {
        Value::Tuple(items) => Ok(items),
        Value::List(items) => Ok(items.borrow().clone()),
        _ => bail!("{what} expected a tuple, got {}", value.type_name()),
    }
}

pub(crate) fn dims(value: &Value, what: &str) -> Result<Vec<u64>, Error> {
    let items = match value {
        Value::Tuple(items) => items.clone(),
        Value::List(items) => items.borrow().clone(),
        _ => bail!("{what} expected a tuple of ints, got {}", value.type_name()),
    };
    items
        .iter()
        .map(|dim| {
            dim.as_u64()
                .ok_or_else(|| anyhow!("{what} has a non-integer or negative entry"))
        })
        .collect()
}

/// Resolves a `BINPERSID`/`PERSID` reference. Torch pickles storages as
/// `("storage", storage_type, key, location, numel[, view_metadata])`, of
/// which the type and key are kept; anything else is kept as an opaque
/// reference.
pub fn persistent_load(pid: Value) -> Result<Value, Error> {
    let items = match pid {
        Value::Tuple(items) => items,
        other => {
            return Ok(opaque(
                Value::Global(Global::new("pickle", "persistent_id")),
                vec![other],
            ));
        }
    };
    if items.first().and_then(Value::as_str) != Some("storage") {
        return Ok(opaque(
            Value::Global(Global::new("pickle", "persistent_id")),
            items,
        ));
    }
    ensure!(
        items.len() >= 5,
        "storage persistent id has {} fields, expected at least 5",
        items.len()
    );
    let dtype = match &items[1] {
        Value::Global(g) => Dtype::from_storage_class(&g.name)
            .or_else(|| Dtype::from_torch_name(&g.name))
            .ok_or_else(|| anyhow!("unsupported storage type {}.{}", g.module, g.name))?,
        other => bail!("storage type must be a global, got {}", other.type_name()),
    };
    let key = items[2]
        .as_key()
        .ok_or_else(|| anyhow!("storage key must be a string"))?;
    ensure!(
        items[4].as_u64().is_some(),
        "storage size must be a non-negative integer"
    );
    Ok(Value::Storage(Rc::new(Storage { dtype, key })))
}

fn rebuild_tensor(args: Vec<Value>, name: &str) -> Result<Value, Error> {
    ensure!(
        args.len() >= 4,
        "{name} expected at least 4 arguments, got {}",
        args.len()
    );
    let Value::Storage(storage) = &args[0] else {
        bail!("{name} expected a storage, got {}", args[0].type_name());
    };
    let storage_offset = args[1]
        .as_u64()
        .ok_or_else(|| anyhow!("{name} storage offset must be a non-negative integer"))?;
    Ok(Value::Tensor(Rc::new(Tensor {
        dtype: storage.dtype.clone(),
        shape: dims(&args[2], name)?,
        stride: dims(&args[3], name)?,
        storage_offset,
        storage: Some(storage.clone()),
    })))
}

fn rebuild_meta_tensor(args: Vec<Value>) -> Result<Value, Error> {
    ensure!(
        args.len() >= 3,
        "_rebuild_meta_tensor_no_storage expected at least 3 arguments"
    );
    let dtype = match &args[0] {
        Value::Global(g) => Dtype::from_torch_name(&g.name)
            .unwrap_or_else(|| Dtype::Other(g.name.clone())),
        other => bail!("meta tensor dtype must be a global, got {}", other.type_name()),
    };
    Ok(Value::Tensor(Rc::new(Tensor {
        dtype,
        shape: dims(&args[1], "_rebuild_meta_tensor_no_storage")?,
        stride: dims(&args[2], "_rebuild_meta_tensor_no_storage")?,
        storage_offset: 0,
        storage: None,
    })))
}

fn pairs(items: &[Value]) -> Vec<(Value, Value)> {
    items
        .iter()
        .filter_map(|pair| match pair {
            Value::Tuple(kv) if kv.len() == 2 => Some((kv[0].clone(), kv[1].clone())),
            Value::List(kv) if kv.borrow().len() == 2 => {
                let kv = kv.borrow();
                Some((kv[0].clone(), kv[1].clone()))
            }
            _ => None,
        })
        .collect()
}

/// Applies `REDUCE`. Only the callables needed to see dictionaries and
/// tensors are understood; every other call becomes an opaque object.
pub fn reduce(callable: Value, args: Value) -> Result<Value, Error> {
    let Value::Global(global) = &callable else {
        return Ok(opaque(callable, tuple_items(args, "REDUCE")?));
    };
    let mut args = tuple_items(args, "REDUCE")?;
    match (global.module.as_str(), global.name.as_str()) {
        ("collections", "OrderedDict") | ("builtins" | "__builtin__", "dict") => {
            let items = match args.first() {
                Some(Value::List(items)) => pairs(&items.borrow()),
                Some(Value::Tuple(items)) => pairs(items),
                Some(Value::Dict(items)) => items.borrow().clone(),
                _ => Vec::new(),
            };
            Ok(Value::new_dict(items))
        }
        ("builtins" | "__builtin__", "set" | "frozenset") => {
            let items = match args.first() {
                Some(Value::List(items)) => items.borrow().clone(),
                Some(Value::Tuple(items)) => items.clone(),
                _ => Vec::new(),
            };
            Ok(Value::new_set(items))
        }
        ("torch", "Size") => match args.pop() {
            Some(dims @ (Value::Tuple(_) | Value::List(_))) => {
                Ok(Value::Tuple(tuple_items(dims, "torch.Size")?))
            }
            _ => Ok(Value::Tuple(Vec::new())),
        },
        (
            "torch._utils",
            name @ ("_rebuild_tensor" | "_rebuild_tensor_v2" | "_rebuild_tensor_v3"
            | "_rebuild_qtensor"),
        ) => rebuild_tensor(args, name),
        ("torch._utils", "_rebuild_parameter" | "_rebuild_parameter_with_state") => {
            match args.into_iter().next() {
                Some(tensor @ Value::Tensor(_)) => Ok(tensor),
                Some(other) => Ok(opaque(callable, vec![other])),
                None => bail!("{} expected arguments", global.name),
            }
        }
        ("torch._utils", "_rebuild_meta_tensor_no_storage") => rebuild_meta_tensor(args),
        ("torch._tensor", "_rebuild_from_type_v2") => {
            ensure!(
                args.len() >= 3,
                "_rebuild_from_type_v2 expected at least 3 arguments"
            );
            let inner_args = args.swap_remove(2);
            let func = args.swap_remove(0);
            if let Value::Global(inner) = &func {
                ensure!(
                    !inner.is("torch._tensor", "_rebuild_from_type_v2"),
                    "nested _rebuild_from_type_v2"
                );
            }
            reduce(func, inner_args)
        }
        _ => Ok(opaque(callable, args)),
    }
}

/// `NEWOBJ` and friends: `cls.__new__(cls, *args)`.
pub fn new_object(class: Value, args: Value) -> Result<Value, Error> {
    match &class {
        Value::Global(g) if g.is("collections", "OrderedDict") => Ok(Value::new_dict(Vec::new())),
        _ => Ok(opaque(class, tuple_items(args, "NEWOBJ")?)),
    }
}
