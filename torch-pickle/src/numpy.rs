//! numpy arrays and scalars as pickled by `ndarray.__reduce__` and
//! `numpy.generic.__reduce__`.

use crate::torch::{Dtype, Tensor, dims};
use crate::value::{Object, Value};

const MULTIARRAY_MODULES: [&str; 2] = ["numpy.core.multiarray", "numpy._core.multiarray"];

/// Describes a pickled `numpy.ndarray` or numpy scalar as a storage-less
/// [`Tensor`]. Returns `None` for anything else.
pub fn describe(value: &Value) -> Option<Tensor> {
    let Value::Object(object) = value else {
        return None;
    };
    let object = object.borrow();
    let Some(Value::Global(class)) = &object.class else {
        return None;
    };
    if !MULTIARRAY_MODULES.contains(&class.module.as_str()) {
        return None;
    }
    let (dtype, shape) = match class.name.as_str() {
        // state: (version, shape, dtype, is_fortran, data)
        "_reconstruct" => match &object.state {
            Some(Value::Tuple(state)) if state.len() >= 3 => {
                (array_dtype(&state[2])?, dims(&state[1], "ndarray").ok()?)
            }
            _ => return None,
        },
        // args: (dtype, data)
        "scalar" => (array_dtype(object.args.first()?)?, Vec::new()),
        _ => return None,
    };
    Some(Tensor {
        dtype,
        shape,
        stride: Vec::new(),
        storage_offset: 0,
        storage: None,
    })
}

/// Reads the type code of a pickled `numpy.dtype`, e.g. `f4` or `<i8`.
fn array_dtype(value: &Value) -> Option<Dtype> {
    let Value::Object(object) = value else {
        return None;
    };
    let object = object.borrow();
    let Object { class, args, .. } = &*object;
    match class {
        Some(Value::Global(g)) if g.is("numpy", "dtype") => (),
        _ => return None,
    }
    let code = args.first()?.as_str()?;
    Some(dtype_from_code(code.trim_start_matches(['<', '>', '=', '|'])))
}

fn dtype_from_code(code: &str) -> Dtype {
    use Dtype::*;
    match code {
        "b1" | "?" => Bool,
        "u1" => U8,
        "i1" => I8,
        "i2" => I16,
        "u2" => U16,
        "i4" => I32,
        "u4" => U32,
        "i8" => I64,
        "u8" => U64,
        "f2" => F16,
        "f4" => F32,
        "f8" => F64,
        "c8" => C64,
        "c16" => C128,
        other => Other(other.to_string()),
    }
}
