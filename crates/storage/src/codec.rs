use crate::{Result, StorageError};
use micadb_types::{IntWidth, Row, TextKind, Value};

// Value tags of the record format.
const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;
const TAG_VECTOR: u8 = 5;
const TAG_JSON: u8 = 6;

/// Encode a row into its stored form: a `u16` column count followed by one
/// tagged value per column.
pub fn encode_row(row: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 * row.len() + 2);
    out.extend_from_slice(&(row.len() as u16).to_le_bytes());
    for value in row {
        encode_value(&mut out, value);
    }
    out
}

fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Int { v, width } => {
            out.push(TAG_INT);
            out.push(match width {
                IntWidth::I8 => 0,
                IntWidth::I16 => 1,
                IntWidth::I32 => 2,
                IntWidth::I64 => 3,
            });
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Text { v, kind } => {
            out.push(TAG_TEXT);
            match kind {
                TextKind::Unbounded => out.push(0),
                TextKind::Varchar(n) => {
                    out.push(1);
                    out.extend_from_slice(&n.to_le_bytes());
                }
                TextKind::Char(n) => {
                    out.push(2);
                    out.extend_from_slice(&n.to_le_bytes());
                }
            }
            put_slice(out, v.as_bytes());
        }
        Value::Blob(b) => {
            out.push(TAG_BLOB);
            put_slice(out, b);
        }
        Value::Vector(v) => {
            out.push(TAG_VECTOR);
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        Value::Json(v) => {
            out.push(TAG_JSON);
            put_slice(out, v.as_bytes());
        }
    }
}

fn put_slice(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
    out.extend_from_slice(b);
}

/// Decode a stored row. Values are copied into owned [`Value`]s, so the
/// caller may reuse or discard the input buffer immediately.
pub fn decode_row(buf: &[u8]) -> Result<Row> {
    let mut r = Dec { buf, pos: 0 };
    let count = r.u16()? as usize;
    let mut row = Vec::with_capacity(count);
    for _ in 0..count {
        row.push(r.value()?);
    }
    Ok(row)
}

struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Dec<'_> {
    fn corrupt(&self, what: &str) -> StorageError {
        let end = self.buf.len().min(self.pos + 8);
        let start = self.pos.min(end);
        StorageError::Corrupt(format!(
            "{what} at offset {} (bytes {})",
            self.pos,
            hex::encode(&self.buf[start..end])
        ))
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.buf.len() {
            return Err(self.corrupt("truncated record"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let n = self.u32()? as usize;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.corrupt("invalid utf8"))
    }

    fn value(&mut self) -> Result<Value> {
        let tag = self.u8()?;
        Ok(match tag {
            TAG_NULL => Value::Null,
            TAG_INT => {
                let width = match self.u8()? {
                    0 => IntWidth::I8,
                    1 => IntWidth::I16,
                    2 => IntWidth::I32,
                    3 => IntWidth::I64,
                    _ => return Err(self.corrupt("bad int width")),
                };
                Value::Int {
                    v: self.i64()?,
                    width,
                }
            }
            TAG_FLOAT => Value::Float(f64::from_le_bytes(self.take(8)?.try_into().unwrap())),
            TAG_TEXT => {
                let kind = match self.u8()? {
                    0 => TextKind::Unbounded,
                    1 => TextKind::Varchar(self.u32()?),
                    2 => TextKind::Char(self.u32()?),
                    _ => return Err(self.corrupt("bad text kind")),
                };
                Value::Text {
                    v: self.string()?,
                    kind,
                }
            }
            TAG_BLOB => {
                let n = self.u32()? as usize;
                Value::Blob(self.take(n)?.to_vec())
            }
            TAG_VECTOR => {
                let dim = self.u32()? as usize;
                let mut v = Vec::with_capacity(dim);
                for _ in 0..dim {
                    v.push(f32::from_le_bytes(self.take(4)?.try_into().unwrap()));
                }
                Value::Vector(v)
            }
            TAG_JSON => Value::Json(self.string()?),
            _ => return Err(self.corrupt("unknown value tag")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_variant() {
        let row: Row = vec![
            Value::Null,
            Value::int(-42),
            Value::int_width(7, IntWidth::I16),
            Value::Float(2.75),
            Value::text("hello"),
            Value::Text {
                v: "ab ".into(),
                kind: TextKind::Char(3),
            },
            Value::Text {
                v: "vv".into(),
                kind: TextKind::Varchar(16),
            },
            Value::Blob(vec![0, 1, 2, 255]),
            Value::Vector(vec![0.5, -1.5, 3.0]),
            Value::Json(r#"{"k": [1, 2]}"#.into()),
        ];
        let decoded = decode_row(&encode_row(&row)).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn empty_row() {
        assert_eq!(decode_row(&encode_row(&[])).unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let bytes = encode_row(&[Value::text("truncate me")]);
        assert!(decode_row(&bytes[..bytes.len() - 3]).is_err());
    }
}
