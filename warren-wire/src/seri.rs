//! Self-describing value serializer for structured message payloads.
//!
//! Every value starts with a tag byte: the low 3 bits are the type, the
//! high 5 bits a subtype (`type | subtype << 3`). Integers are written in
//! the narrowest encoding that fits; the 1- and 2-byte encodings read back
//! unsigned so `0x80..=0xFF` survives the round trip. Containers carry an
//! array part (length inline when < 31) followed by key/value pairs and a
//! nil terminator. Nesting is bounded at 32 levels in both directions.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    parse::{new_le_u16, new_le_u32, new_u8, take},
    WireError,
};

const TYPE_MASK: u8 = 0x07;
const MAX_COOKIE: u8 = 32;
const MAX_DEPTH: usize = 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum Type {
    Nil = 0,
    Boolean = 1,
    Number = 2,
    Pointer = 3,
    ShortString = 4,
    LongString = 5,
    Table = 6,
}

// Number subtypes; the value doubles as the encoded width except for Zero.
const NUMBER_ZERO: u8 = 0;
const NUMBER_BYTE: u8 = 1;
const NUMBER_WORD: u8 = 2;
const NUMBER_DWORD: u8 = 4;
const NUMBER_QWORD: u8 = 6;
const NUMBER_REAL: u8 = 8;

fn combine(t: Type, subtype: u8) -> u8 {
    debug_assert!(subtype < MAX_COOKIE);
    u8::from(t) | subtype << 3
}

/// A deserialized value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    /// Address-sized opaque pointer, meaningful only within a process.
    Pointer(usize),
    /// Byte string (not required to be UTF-8).
    Str(Vec<u8>),
    Table(Table),
}

/// Container with an array part and a keyed part.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub array: Vec<Value>,
    pub map: Vec<(Value, Value)>,
}

impl Value {
    pub fn string(s: impl Into<Vec<u8>>) -> Self {
        Value::Str(s.into())
    }
}

fn pack_int(out: &mut Vec<u8>, v: i64) {
    if v == 0 {
        out.push(combine(Type::Number, NUMBER_ZERO));
    } else if i64::from(v as i32) != v {
        out.push(combine(Type::Number, NUMBER_QWORD));
        out.extend_from_slice(&v.to_le_bytes());
    } else if v < 0 {
        out.push(combine(Type::Number, NUMBER_DWORD));
        out.extend_from_slice(&(v as i32).to_le_bytes());
    } else if v < 0x100 {
        out.push(combine(Type::Number, NUMBER_BYTE));
        out.push(v as u8);
    } else if v < 0x10000 {
        out.push(combine(Type::Number, NUMBER_WORD));
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else {
        out.push(combine(Type::Number, NUMBER_DWORD));
        out.extend_from_slice(&(v as u32).to_le_bytes());
    }
}

fn pack_string(out: &mut Vec<u8>, s: &[u8]) {
    if s.len() < MAX_COOKIE as usize {
        out.push(combine(Type::ShortString, s.len() as u8));
    } else if s.len() < 0x10000 {
        out.push(combine(Type::LongString, 2));
        out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    } else {
        out.push(combine(Type::LongString, 4));
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(s);
}

fn pack_one(out: &mut Vec<u8>, v: &Value, depth: usize) -> Result<(), WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    match v {
        Value::Nil => out.push(combine(Type::Nil, 0)),
        Value::Bool(b) => out.push(combine(Type::Boolean, *b as u8)),
        Value::Int(n) => pack_int(out, *n),
        Value::Real(r) => {
            out.push(combine(Type::Number, NUMBER_REAL));
            out.extend_from_slice(&r.to_le_bytes());
        }
        Value::Pointer(p) => {
            out.push(combine(Type::Pointer, 0));
            out.extend_from_slice(&p.to_le_bytes());
        }
        Value::Str(s) => pack_string(out, s),
        Value::Table(t) => {
            if t.array.len() >= MAX_COOKIE as usize - 1 {
                out.push(combine(Type::Table, MAX_COOKIE - 1));
                pack_int(out, t.array.len() as i64);
            } else {
                out.push(combine(Type::Table, t.array.len() as u8));
            }
            for item in &t.array {
                pack_one(out, item, depth + 1)?;
            }
            for (k, val) in &t.map {
                pack_one(out, k, depth + 1)?;
                pack_one(out, val, depth + 1)?;
            }
            out.push(combine(Type::Nil, 0));
        }
    }
    Ok(())
}

/// Serialize a sequence of values into one buffer.
pub fn pack(values: &[Value]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(128);
    for v in values {
        pack_one(&mut out, v, 0)?;
    }
    Ok(out)
}

fn unpack_int<'a>(i: &'a [u8], subtype: u8) -> Result<(&'a [u8], i64), WireError> {
    match subtype {
        NUMBER_ZERO => Ok((i, 0)),
        NUMBER_BYTE => {
            let (i, b) = new_u8(i)?;
            Ok((i, i64::from(b)))
        }
        NUMBER_WORD => {
            let (i, w) = new_le_u16(i)?;
            Ok((i, i64::from(w)))
        }
        NUMBER_DWORD => {
            let (i, d) = new_le_u32(i)?;
            Ok((i, i64::from(d as i32)))
        }
        NUMBER_QWORD => {
            let (i, raw) = take(i, 8)?;
            let q = i64::from_le_bytes(raw.try_into().expect("length checked"));
            Ok((i, q))
        }
        other => Err(WireError::InvalidTag(combine(Type::Number, other))),
    }
}

fn unpack_one<'a>(i: &'a [u8], depth: usize) -> Result<(&'a [u8], Value), WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    let (i, tag) = new_u8(i)?;
    let subtype = tag >> 3;
    let ty = Type::try_from(tag & TYPE_MASK).map_err(|_| WireError::InvalidTag(tag))?;

    match ty {
        Type::Nil => Ok((i, Value::Nil)),
        Type::Boolean => Ok((i, Value::Bool(subtype != 0))),
        Type::Number => {
            if subtype == NUMBER_REAL {
                let (i, raw) = take(i, 8)?;
                let r = f64::from_le_bytes(raw.try_into().expect("length checked"));
                Ok((i, Value::Real(r)))
            } else {
                let (i, n) = unpack_int(i, subtype)?;
                Ok((i, Value::Int(n)))
            }
        }
        Type::Pointer => {
            let (i, raw) = take(i, size_of::<usize>())?;
            let p = usize::from_le_bytes(raw.try_into().expect("length checked"));
            Ok((i, Value::Pointer(p)))
        }
        Type::ShortString => {
            let (i, raw) = take(i, subtype as usize)?;
            Ok((i, Value::Str(raw.to_vec())))
        }
        Type::LongString => {
            let (i, len) = match subtype {
                2 => {
                    let (i, len) = new_le_u16(i)?;
                    (i, len as usize)
                }
                4 => {
                    let (i, len) = new_le_u32(i)?;
                    (i, len as usize)
                }
                _ => return Err(WireError::InvalidTag(tag)),
            };
            let (i, raw) = take(i, len)?;
            Ok((i, Value::Str(raw.to_vec())))
        }
        Type::Table => {
            let (mut i, array_len) = if subtype == MAX_COOKIE - 1 {
                let (i, tag) = new_u8(i)?;
                if tag & TYPE_MASK != u8::from(Type::Number) || tag >> 3 == NUMBER_REAL {
                    return Err(WireError::InvalidTag(tag));
                }
                let (i, n) = unpack_int(i, tag >> 3)?;
                (i, n as usize)
            } else {
                (i, subtype as usize)
            };

            let mut table = Table {
                array: Vec::with_capacity(array_len.min(4096)),
                map: Vec::new(),
            };
            for _ in 0..array_len {
                let (rest, v) = unpack_one(i, depth + 1)?;
                table.array.push(v);
                i = rest;
            }
            loop {
                let (rest, key) = unpack_one(i, depth + 1)?;
                i = rest;
                if key == Value::Nil {
                    break;
                }
                let (rest, val) = unpack_one(i, depth + 1)?;
                table.map.push((key, val));
                i = rest;
            }
            Ok((i, Value::Table(table)))
        }
    }
}

/// Deserialize a buffer back into the sequence of values it encodes.
pub fn unpack(buf: &[u8]) -> Result<Vec<Value>, WireError> {
    let mut values = Vec::new();
    let mut i = buf;
    while !i.is_empty() {
        let (rest, v) = unpack_one(i, 0)?;
        values.push(v);
        i = rest;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip(v: Value) {
        let packed = pack(std::slice::from_ref(&v)).unwrap();
        let unpacked = unpack(&packed).unwrap();
        assert_eq!(unpacked, vec![v]);
    }

    #[test]
    fn scalar_round_trips() {
        round_trip(Value::Nil);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Real(3.25));
        round_trip(Value::Pointer(0xDEAD_BEEF));
        round_trip(Value::string("short"));
        round_trip(Value::Str(vec![0xFF; 31]));
        round_trip(Value::Str(vec![1; 32]));
        round_trip(Value::Str(vec![2; 0x10000]));
    }

    #[test]
    fn integer_width_boundaries() {
        for v in [
            0i64,
            1,
            0xFF,
            0x100,
            0xFFFF,
            0x10000,
            i64::from(i32::MAX),
            -1,
            i64::from(i32::MIN),
            i64::from(i32::MAX) + 1,
            i64::MIN,
            i64::MAX,
        ] {
            round_trip(Value::Int(v));
        }
    }

    #[test]
    fn smallest_width_is_chosen() {
        assert_eq!(pack(&[Value::Int(0)]).unwrap(), vec![0x02]);
        // 200 must encode as one unsigned byte, not a sign-extended i8
        assert_eq!(pack(&[Value::Int(200)]).unwrap(), vec![0x0A, 200]);
        assert_eq!(pack(&[Value::Int(0x100)]).unwrap(), vec![0x12, 0x00, 0x01]);
        assert_eq!(
            pack(&[Value::Int(-1)]).unwrap(),
            vec![0x22, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(pack(&[Value::Int(0x1_0000_0000)]).unwrap().len(), 9);
    }

    #[test]
    fn unsigned_readback() {
        let packed = pack(&[Value::Int(0x80), Value::Int(0xFF00)]).unwrap();
        assert_eq!(
            unpack(&packed).unwrap(),
            vec![Value::Int(0x80), Value::Int(0xFF00)]
        );
    }

    #[test]
    fn table_round_trip() {
        let t = Table {
            array: vec![Value::Int(1), Value::string("two"), Value::Nil],
            map: vec![
                (Value::string("key"), Value::Real(0.5)),
                (Value::Int(100), Value::Bool(true)),
            ],
        };
        round_trip(Value::Table(t));
    }

    #[test]
    fn long_array_table() {
        let t = Table {
            array: (0..100).map(Value::Int).collect(),
            map: Vec::new(),
        };
        round_trip(Value::Table(t));
    }

    #[test]
    fn nested_tables_round_trip() {
        let mut v = Value::Int(9);
        for _ in 0..31 {
            v = Value::Table(Table {
                array: vec![v],
                map: Vec::new(),
            });
        }
        round_trip(v);
    }

    #[test]
    fn too_deep_rejected_both_ways() {
        let mut v = Value::Int(9);
        for _ in 0..40 {
            v = Value::Table(Table {
                array: vec![v],
                map: Vec::new(),
            });
        }
        assert_eq!(pack(&[v]), Err(WireError::TooDeep));

        // hand-build a 40-deep stream of single-element tables
        let mut raw = vec![combine(Type::Table, 1); 40];
        raw.push(0x02); // Int(0)
        raw.extend(std::iter::repeat(0u8).take(40)); // nil terminators
        assert_eq!(unpack(&raw), Err(WireError::TooDeep));
    }

    #[test]
    fn value_sequence() {
        let values = vec![Value::Int(7), Value::string("x"), Value::Bool(false)];
        let packed = pack(&values).unwrap();
        assert_eq!(unpack(&packed).unwrap(), values);
    }

    #[test]
    fn truncated_input_rejected() {
        let packed = pack(&[Value::Str(vec![3; 100])]).unwrap();
        assert_eq!(unpack(&packed[..50]), Err(WireError::Truncated));
    }
}
