use crate::torch::{Storage, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Containers are shared so that memo references observe later mutation,
/// the same way they alias in the unpickled Python object graph.
pub type Shared<T> = Rc<RefCell<T>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub module: String,
    pub name: String,
}

impl Global {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Global {
            module: module.into(),
            name: name.into(),
        }
    }

    pub fn is(&self, module: &str, name: &str) -> bool {
        self.module == module && self.name == name
    }
}

/// An instance of a class the reader does not model. Nothing is executed:
/// the callable, its arguments and any `BUILD` state are just recorded.
#[derive(Debug, Default)]
pub struct Object {
    pub class: Option<Value>,
    pub args: Vec<Value>,
    pub state: Option<Value>,
    pub dict_items: Vec<(Value, Value)>,
    pub list_items: Vec<Value>,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Little-endian two's complement, as pickled by `LONG1`/`LONG4`.
    BigInt(Vec<u8>),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Shared<Vec<Value>>),
    Dict(Shared<Vec<(Value, Value)>>),
    Set(Shared<Vec<Value>>),
    Global(Global),
    Object(Shared<Object>),
    Storage(Rc<Storage>),
    Tensor(Rc<Tensor>),
}

impl Value {
    pub fn new_list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn new_dict(items: Vec<(Value, Value)>) -> Value {
        Value::Dict(Rc::new(RefCell::new(items)))
    }

    pub fn new_set(items: Vec<Value>) -> Value {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    pub fn new_object(object: Object) -> Value {
        Value::Object(Rc::new(RefCell::new(object)))
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(i) => Some(*i as i128),
            Value::BigInt(bytes) if bytes.len() <= 16 => {
                let fill = match bytes.last() {
                    Some(b) if b & 0x80 != 0 => 0xff,
                    _ => 0x00,
                };
                let mut buf = [fill; 16];
                buf[..bytes.len()].copy_from_slice(bytes);
                Some(i128::from_le_bytes(buf))
            }
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|i| u64::try_from(i).ok())
    }

    /// Dictionary entries, for plain dicts and for instances of dict
    /// subclasses that were filled through `SETITEM(S)`.
    pub fn dict_items(&self) -> Option<Vec<(Value, Value)>> {
        match self {
            Value::Dict(items) => Some(items.borrow().clone()),
            Value::Object(object) => {
                let object = object.borrow();
                (!object.dict_items.is_empty()).then(|| object.dict_items.clone())
            }
            _ => None,
        }
    }

    /// Renders a dictionary key the way Python would print it as a name.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Bool(true) => Some("True".to_string()),
            Value::Bool(false) => Some("False".to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::BigInt(_) => self.as_i128().map(|i| i.to_string()),
            _ => None,
        }
    }

    /// A short Python-flavoured type name, used when describing values that
    /// are not tensors.
    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) | Value::BigInt(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::String(_) => "str".to_string(),
            Value::Bytes(_) => "bytes".to_string(),
            Value::Tuple(_) => "tuple".to_string(),
            Value::List(_) => "list".to_string(),
            Value::Dict(_) => "dict".to_string(),
            Value::Set(_) => "set".to_string(),
            Value::Global(g) => format!("{}.{}", g.module, g.name),
            Value::Object(object) => match &object.borrow().class {
                Some(Value::Global(g)) => format!("{}.{}", g.module, g.name),
                _ => "object".to_string(),
            },
            Value::Storage(_) => "torch.storage".to_string(),
            Value::Tensor(_) => "torch.Tensor".to_string(),
        }
    }
}
