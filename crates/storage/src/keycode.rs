use micadb_types::Value;

// Class prefixes keep heterogeneous key columns totally ordered.
const K_NULL: u8 = 0x01;
const K_INT: u8 = 0x02;
const K_FLOAT: u8 = 0x03;
const K_TEXT: u8 = 0x04;
const K_BLOB: u8 = 0x05;
const K_VECTOR: u8 = 0x06;
const K_JSON: u8 = 0x07;

/// Order-preserving encoding of index key columns.
///
/// Each value is a class tag followed by a class-specific sortable form:
/// integers and floats are sign-flipped big-endian bits, byte strings are
/// zero-escaped and double-zero terminated so that no key is a prefix of
/// another. A non-unique index appends the 8-byte rowid (see
/// [`rowid_key`]) to the output of this function to keep entries distinct.
pub fn encode_index_key(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 10);
    for value in values {
        match value {
            Value::Null => out.push(K_NULL),
            Value::Int { v, .. } => {
                out.push(K_INT);
                out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
            }
            Value::Float(f) => {
                out.push(K_FLOAT);
                out.extend_from_slice(&f64_sort_bits(*f).to_be_bytes());
            }
            Value::Text { v, .. } => {
                out.push(K_TEXT);
                put_escaped(&mut out, v.as_bytes());
            }
            Value::Blob(b) => {
                out.push(K_BLOB);
                put_escaped(&mut out, b);
            }
            Value::Vector(v) => {
                out.push(K_VECTOR);
                out.extend_from_slice(&(v.len() as u32).to_be_bytes());
                for x in v {
                    out.extend_from_slice(&f32_sort_bits(*x).to_be_bytes());
                }
            }
            Value::Json(v) => {
                out.push(K_JSON);
                put_escaped(&mut out, v.as_bytes());
            }
        }
    }
    out
}

fn put_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

fn f64_sort_bits(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & (1 << 63) == 0 {
        bits | (1 << 63)
    } else {
        !bits
    }
}

fn f32_sort_bits(f: f32) -> u32 {
    let bits = f.to_bits();
    if bits & (1 << 31) == 0 {
        bits | (1 << 31)
    } else {
        !bits
    }
}

/// Primary-tree key for a rowid: 8-byte big-endian, so rowids ascend in key
/// order.
pub fn rowid_key(rowid: u64) -> [u8; 8] {
    rowid.to_be_bytes()
}

pub fn rowid_from_key(key: &[u8]) -> Option<u64> {
    key.try_into().ok().map(u64::from_be_bytes)
}
