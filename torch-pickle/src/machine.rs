use crate::torch;
use crate::value::{Global, Value};
use anyhow::{Error, anyhow, bail, ensure};
use byteorder::{BE, LE, ReadBytesExt};
use std::collections::HashMap;
use std::io::{BufRead, ErrorKind, Read};

const HIGHEST_PROTOCOL: u8 = 5;

/// A pickle virtual machine that builds [`Value`]s without importing or
/// calling anything. One machine can read several pickles back to back from
/// the same stream, as torch's legacy format requires.
pub struct Machine<R> {
    read: R,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<usize, Value>,
}

impl<R: BufRead> Machine<R> {
    pub fn new(read: R) -> Self {
        Machine {
            read,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    /// Reads one pickle up to its `STOP` opcode. Returns `None` when the
    /// stream is already exhausted.
    pub fn load(&mut self) -> Result<Option<Value>, Error> {
        self.stack.clear();
        self.marks.clear();
        self.memo.clear();

        let mut first = true;
        loop {
            let op = match self.read.read_u8() {
                Ok(op) => op,
                Err(e) if first && e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    bail!("pickle stream ended before STOP")
                }
                Err(e) => return Err(e.into()),
            };
            first = false;
            if op == b'.' {
                return self.pop().map(Some);
            }
            self.step(op)?;
        }
    }

    fn step(&mut self, op: u8) -> Result<(), Error> {
        match op {
            // PROTO
            0x80 => {
                let version = self.read.read_u8()?;
                ensure!(
                    version <= HIGHEST_PROTOCOL,
                    "unsupported pickle protocol {version}"
                );
            }
            // FRAME
            0x95 => {
                self.read.read_u64::<LE>()?;
            }
            b'(' => self.marks.push(self.stack.len()),
            // POP
            b'0' => {
                self.pop()?;
            }
            // POP_MARK
            b'1' => {
                self.pop_mark()?;
            }
            // DUP
            b'2' => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }

            b'N' => self.stack.push(Value::None),
            0x88 => self.stack.push(Value::Bool(true)),
            0x89 => self.stack.push(Value::Bool(false)),

            // INT, which protocol 0 also uses for booleans
            b'I' => {
                let line = self.read_line()?;
                let value = match line.as_str() {
                    "00" => Value::Bool(false),
                    "01" => Value::Bool(true),
                    text => Value::Int(text.parse()?),
                };
                self.stack.push(value);
            }
            // LONG
            b'L' => {
                let line = self.read_line()?;
                let value: i128 = line.trim_end_matches('L').parse()?;
                self.stack.push(match i64::try_from(value) {
                    Ok(small) => Value::Int(small),
                    Err(_) => Value::BigInt(value.to_le_bytes().to_vec()),
                });
            }
            // BININT
            b'J' => {
                let v = self.read.read_i32::<LE>()?;
                self.stack.push(Value::Int(v as i64));
            }
            // BININT1
            b'K' => {
                let v = self.read.read_u8()?;
                self.stack.push(Value::Int(v as i64));
            }
            // BININT2
            b'M' => {
                let v = self.read.read_u16::<LE>()?;
                self.stack.push(Value::Int(v as i64));
            }
            // LONG1
            0x8a => {
                let n = self.read.read_u8()? as u64;
                let bytes = self.read_bytes(n)?;
                self.stack.push(decode_long(bytes));
            }
            // LONG4
            0x8b => {
                let n = self.read.read_i32::<LE>()?;
                ensure!(n >= 0, "LONG4 with negative length");
                let bytes = self.read_bytes(n as u64)?;
                self.stack.push(decode_long(bytes));
            }
            // FLOAT
            b'F' => {
                let line = self.read_line()?;
                self.stack.push(Value::Float(line.parse()?));
            }
            // BINFLOAT is the only big-endian field in the format
            b'G' => {
                let v = self.read.read_f64::<BE>()?;
                self.stack.push(Value::Float(v));
            }

            // STRING
            b'S' => {
                let line = self.read_line()?;
                let text = line
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| line.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                    .ok_or_else(|| anyhow!("STRING argument is not quoted"))?;
                self.stack.push(Value::String(text.to_string()));
            }
            // BINSTRING
            b'T' => {
                let n = self.read.read_i32::<LE>()?;
                ensure!(n >= 0, "BINSTRING with negative length");
                let bytes = self.read_bytes(n as u64)?;
                self.stack
                    .push(Value::String(String::from_utf8_lossy(&bytes).into_owned()));
            }
            // SHORT_BINSTRING
            b'U' => {
                let n = self.read.read_u8()? as u64;
                let bytes = self.read_bytes(n)?;
                self.stack
                    .push(Value::String(String::from_utf8_lossy(&bytes).into_owned()));
            }
            // UNICODE
            b'V' => {
                let line = self.read_line()?;
                self.stack.push(Value::String(line));
            }
            // BINUNICODE
            b'X' => {
                let n = self.read.read_u32::<LE>()? as u64;
                let s = self.read_utf8(n)?;
                self.stack.push(Value::String(s));
            }
            // SHORT_BINUNICODE
            0x8c => {
                let n = self.read.read_u8()? as u64;
                let s = self.read_utf8(n)?;
                self.stack.push(Value::String(s));
            }
            // BINUNICODE8
            0x8d => {
                let n = self.read.read_u64::<LE>()?;
                let s = self.read_utf8(n)?;
                self.stack.push(Value::String(s));
            }
            // BINBYTES
            b'B' => {
                let n = self.read.read_u32::<LE>()? as u64;
                let bytes = self.read_bytes(n)?;
                self.stack.push(Value::Bytes(bytes));
            }
            // SHORT_BINBYTES
            b'C' => {
                let n = self.read.read_u8()? as u64;
                let bytes = self.read_bytes(n)?;
                self.stack.push(Value::Bytes(bytes));
            }
            // BINBYTES8, BYTEARRAY8
            0x8e | 0x96 => {
                let n = self.read.read_u64::<LE>()?;
                let bytes = self.read_bytes(n)?;
                self.stack.push(Value::Bytes(bytes));
            }

            // EMPTY_TUPLE
            b')' => self.stack.push(Value::Tuple(Vec::new())),
            // TUPLE
            b't' => {
                let items = self.pop_mark()?;
                self.stack.push(Value::Tuple(items));
            }
            // TUPLE1
            0x85 => {
                let a = self.pop()?;
                self.stack.push(Value::Tuple(vec![a]));
            }
            // TUPLE2
            0x86 => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Tuple(vec![a, b]));
            }
            // TUPLE3
            0x87 => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Tuple(vec![a, b, c]));
            }

            // EMPTY_LIST
            b']' => self.stack.push(Value::new_list(Vec::new())),
            // LIST
            b'l' => {
                let items = self.pop_mark()?;
                self.stack.push(Value::new_list(items));
            }
            // APPEND
            b'a' => {
                let item = self.pop()?;
                self.extend_list(vec![item])?;
            }
            // APPENDS
            b'e' => {
                let items = self.pop_mark()?;
                self.extend_list(items)?;
            }

            // EMPTY_DICT
            b'}' => self.stack.push(Value::new_dict(Vec::new())),
            // DICT
            b'd' => {
                let items = self.pop_mark()?;
                let pairs = into_pairs(items)?;
                self.stack.push(Value::new_dict(pairs));
            }
            // SETITEM
            b's' => {
                let value = self.pop()?;
                let key = self.pop()?;
                self.extend_dict(vec![(key, value)])?;
            }
            // SETITEMS
            b'u' => {
                let items = self.pop_mark()?;
                let pairs = into_pairs(items)?;
                self.extend_dict(pairs)?;
            }

            // EMPTY_SET
            0x8f => self.stack.push(Value::new_set(Vec::new())),
            // ADDITEMS
            0x90 => {
                let items = self.pop_mark()?;
                match self.top()? {
                    Value::Set(set) => set.borrow_mut().extend(items),
                    other => bail!("ADDITEMS on {}", other.type_name()),
                }
            }
            // FROZENSET
            0x91 => {
                let items = self.pop_mark()?;
                self.stack.push(Value::new_set(items));
            }

            // GLOBAL
            b'c' => {
                let module = self.read_line()?;
                let name = self.read_line()?;
                self.stack.push(Value::Global(Global { module, name }));
            }
            // STACK_GLOBAL
            0x93 => {
                let name = self.pop()?;
                let module = self.pop()?;
                match (module, name) {
                    (Value::String(module), Value::String(name)) => {
                        self.stack.push(Value::Global(Global { module, name }))
                    }
                    _ => bail!("STACK_GLOBAL expects two strings"),
                }
            }
            // REDUCE
            b'R' => {
                let args = self.pop()?;
                let callable = self.pop()?;
                self.stack.push(torch::reduce(callable, args)?);
            }
            // NEWOBJ
            0x81 => {
                let args = self.pop()?;
                let class = self.pop()?;
                self.stack.push(torch::new_object(class, args)?);
            }
            // NEWOBJ_EX
            0x92 => {
                let _kwargs = self.pop()?;
                let args = self.pop()?;
                let class = self.pop()?;
                self.stack.push(torch::new_object(class, args)?);
            }
            // INST
            b'i' => {
                let module = self.read_line()?;
                let name = self.read_line()?;
                let args = self.pop_mark()?;
                let class = Value::Global(Global { module, name });
                self.stack.push(torch::reduce(class, Value::Tuple(args))?);
            }
            // OBJ
            b'o' => {
                let mut items = self.pop_mark()?;
                ensure!(!items.is_empty(), "OBJ without a class");
                let class = items.remove(0);
                self.stack.push(torch::reduce(class, Value::Tuple(items))?);
            }
            // BUILD
            b'b' => {
                let state = self.pop()?;
                if let Value::Object(object) = self.top()? {
                    object.borrow_mut().state = Some(state);
                }
            }

            // PERSID
            b'P' => {
                let pid = self.read_line()?;
                self.stack.push(torch::persistent_load(Value::String(pid))?);
            }
            // BINPERSID
            b'Q' => {
                let pid = self.pop()?;
                self.stack.push(torch::persistent_load(pid)?);
            }

            // PUT
            b'p' => {
                let idx = self.read_line()?.parse()?;
                self.memo_put(idx)?;
            }
            // BINPUT
            b'q' => {
                let idx = self.read.read_u8()? as usize;
                self.memo_put(idx)?;
            }
            // LONG_BINPUT
            b'r' => {
                let idx = self.read.read_u32::<LE>()? as usize;
                self.memo_put(idx)?;
            }
            // MEMOIZE
            0x94 => {
                let idx = self.memo.len();
                self.memo_put(idx)?;
            }
            // GET
            b'g' => {
                let idx = self.read_line()?.parse()?;
                self.memo_get(idx)?;
            }
            // BINGET
            b'h' => {
                let idx = self.read.read_u8()? as usize;
                self.memo_get(idx)?;
            }
            // LONG_BINGET
            b'j' => {
                let idx = self.read.read_u32::<LE>()? as usize;
                self.memo_get(idx)?;
            }

            other => bail!("unsupported pickle opcode 0x{other:02x}"),
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Error> {
        self.stack.pop().ok_or_else(|| anyhow!("pickle stack underflow"))
    }

    fn top(&self) -> Result<&Value, Error> {
        self.stack.last().ok_or_else(|| anyhow!("pickle stack underflow"))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, Error> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| anyhow!("pickle mark stack underflow"))?;
        ensure!(mark <= self.stack.len(), "pickle mark past end of stack");
        Ok(self.stack.split_off(mark))
    }

    fn extend_list(&mut self, items: Vec<Value>) -> Result<(), Error> {
        match self.top()? {
            Value::List(list) => list.borrow_mut().extend(items),
            Value::Object(object) => object.borrow_mut().list_items.extend(items),
            other => bail!("APPEND on {}", other.type_name()),
        }
        Ok(())
    }

    fn extend_dict(&mut self, pairs: Vec<(Value, Value)>) -> Result<(), Error> {
        match self.top()? {
            Value::Dict(dict) => dict.borrow_mut().extend(pairs),
            Value::Object(object) => object.borrow_mut().dict_items.extend(pairs),
            other => bail!("SETITEM on {}", other.type_name()),
        }
        Ok(())
    }

    fn memo_put(&mut self, idx: usize) -> Result<(), Error> {
        let value = self.top()?.clone();
        self.memo.insert(idx, value);
        Ok(())
    }

    fn memo_get(&mut self, idx: usize) -> Result<(), Error> {
        let value = self
            .memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| anyhow!("missing memo entry {idx}"))?;
        self.stack.push(value);
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, Error> {
        let mut line = Vec::new();
        self.read.read_until(b'\n', &mut line)?;
        ensure!(line.pop() == Some(b'\n'), "pickle stream ended inside a line");
        Ok(String::from_utf8(line)?)
    }

    fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>, Error> {
        // Lengths come from the file, so grow the buffer as bytes arrive
        // instead of trusting them up front.
        let mut bytes = Vec::new();
        (&mut self.read).take(n).read_to_end(&mut bytes)?;
        ensure!(
            bytes.len() as u64 == n,
            "pickle stream ended inside a {n} byte argument"
        );
        Ok(bytes)
    }

    fn read_utf8(&mut self, n: u64) -> Result<String, Error> {
        Ok(String::from_utf8(self.read_bytes(n)?)?)
    }
}

fn decode_long(bytes: Vec<u8>) -> Value {
    if bytes.len() <= 8 {
        let fill = match bytes.last() {
            Some(b) if b & 0x80 != 0 => 0xff,
            _ => 0x00,
        };
        let mut buf = [fill; 8];
        buf[..bytes.len()].copy_from_slice(&bytes);
        Value::Int(i64::from_le_bytes(buf))
    } else {
        Value::BigInt(bytes)
    }
}

fn into_pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>, Error> {
    ensure!(
        items.len() % 2 == 0,
        "odd number of items for a dictionary"
    );
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Unpickles a single object from an in-memory buffer.
pub fn loads(bytes: &[u8]) -> Result<Value, Error> {
    Machine::new(bytes)
        .load()?
        .ok_or_else(|| anyhow!("empty pickle"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_2_ordered_dict_with_memo() {
        // pickle.dumps(OrderedDict([("a", 1), ("b", [1, 2])]), protocol=2)
        let bytes = b"\x80\x02ccollections\nOrderedDict\nq\x00)Rq\x01(X\x01\x00\x00\x00aq\x02K\x01X\x01\x00\x00\x00bq\x03]q\x04(K\x01K\x02eu.";
        let value = loads(bytes).unwrap();
        let items = value.dict_items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0.as_str(), Some("a"));
        assert_eq!(items[0].1.as_i128(), Some(1));
        match &items[1].1 {
            Value::List(list) => assert_eq!(list.borrow().len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn protocol_4_frames_and_stack_global() {
        // pickle.dumps({"x": None, "y": 1.5}, protocol=4)
        let bytes = b"\x80\x04\x95\x17\x00\x00\x00\x00\x00\x00\x00}\x94(\x8c\x01x\x94N\x8c\x01y\x94G?\xf8\x00\x00\x00\x00\x00\x00u.";
        let value = loads(bytes).unwrap();
        let items = value.dict_items().unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0].1, Value::None));
        assert!(matches!(items[1].1, Value::Float(f) if f == 1.5));
    }

    #[test]
    fn memo_references_see_later_mutation() {
        // l = []; d = {}; l.append(d); d["k"] = 7
        let bytes = b"\x80\x02]q\x00}q\x01ah\x01X\x01\x00\x00\x00kK\x07s0.";
        let value = loads(bytes).unwrap();
        let Value::List(list) = value else {
            panic!("expected list");
        };
        let inner = list.borrow()[0].dict_items().unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].0.as_str(), Some("k"));
    }

    #[test]
    fn long1_and_protocol_0_forms() {
        let value = loads(b"\x8a\x02\xff\x00.").unwrap();
        assert_eq!(value.as_i128(), Some(255));
        let value = loads(b"I01\n.").unwrap();
        assert!(matches!(value, Value::Bool(true)));
        let value = loads(b"S'abc'\np0\n.").unwrap();
        assert_eq!(value.as_str(), Some("abc"));
        let value = loads(b"(lp0\nI1\naI2\na.").unwrap();
        match value {
            Value::List(list) => assert_eq!(list.borrow().len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn unknown_classes_are_recorded_not_called() {
        // pickle of an instance: copyreg-style NEWOBJ with BUILD state
        let bytes = b"\x80\x02c__main__\nFoo\nq\x00)\x81q\x01}q\x02X\x01\x00\x00\x00aK\x01sb.";
        let value = loads(bytes).unwrap();
        assert_eq!(value.type_name(), "__main__.Foo");
        match value {
            Value::Object(object) => assert!(object.borrow().state.is_some()),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn malformed_streams_fail() {
        assert!(loads(b"").is_err());
        assert!(loads(b"\x80\x02}").is_err());
        assert!(loads(b"\x80\x09}.").is_err());
        assert!(loads(b"\x80\x02\xff.").is_err());
        assert!(loads(b"\x80\x02X\xff\x00\x00\x00ab.").is_err());
        assert!(loads(b"\x80\x02h\x05.").is_err());
    }

    #[test]
    fn consecutive_pickles_share_one_stream() {
        let mut machine = Machine::new(&b"K\x01.K\x02."[..]);
        assert_eq!(machine.load().unwrap().unwrap().as_i128(), Some(1));
        assert_eq!(machine.load().unwrap().unwrap().as_i128(), Some(2));
        assert!(machine.load().unwrap().is_none());
    }
}
