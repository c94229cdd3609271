use std::cmp::Ordering;
use std::fmt;

/// Storage width of an integer value. All widths compare as one class; the
/// width only matters for declared-type range checks and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    I8,
    I16,
    I32,
    I64,
}

impl IntWidth {
    /// Inclusive range of values representable at this width.
    pub fn range(self) -> (i64, i64) {
        match self {
            IntWidth::I8 => (i8::MIN as i64, i8::MAX as i64),
            IntWidth::I16 => (i16::MIN as i64, i16::MAX as i64),
            IntWidth::I32 => (i32::MIN as i64, i32::MAX as i64),
            IntWidth::I64 => (i64::MIN, i64::MAX),
        }
    }

    pub fn contains(self, v: i64) -> bool {
        let (lo, hi) = self.range();
        lo <= v && v <= hi
    }
}

/// Declared shape of a text value.
///
/// `Varchar(n)` rejects over-length strings at coercion time; `Char(n)` is
/// blank-padded to exactly `n` characters. All kinds compare as one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextKind {
    Unbounded,
    Varchar(u32),
    Char(u32),
}

/// Coarse classes used for cross-type ordering. Integer widths collapse into
/// `Numeric` together with floats; all text kinds collapse into `Text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueClass {
    Null,
    Numeric,
    Text,
    Blob,
    Vector,
    Json,
}

/// A typed SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int { v: i64, width: IntWidth },
    Float(f64),
    Text { v: String, kind: TextKind },
    Blob(Vec<u8>),
    Vector(Vec<f32>),
    Json(String),
}

impl Value {
    pub fn int(v: i64) -> Self {
        Value::Int {
            v,
            width: IntWidth::I64,
        }
    }

    pub fn int_width(v: i64, width: IntWidth) -> Self {
        Value::Int { v, width }
    }

    pub fn text(v: impl Into<String>) -> Self {
        Value::Text {
            v: v.into(),
            kind: TextKind::Unbounded,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn class(&self) -> ValueClass {
        match self {
            Value::Null => ValueClass::Null,
            Value::Int { .. } | Value::Float(_) => ValueClass::Numeric,
            Value::Text { .. } => ValueClass::Text,
            Value::Blob(_) => ValueClass::Blob,
            Value::Vector(_) => ValueClass::Vector,
            Value::Json(_) => ValueClass::Json,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int { .. } => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Text { .. } => "TEXT",
            Value::Blob(_) => "BLOB",
            Value::Vector(_) => "VECTOR",
            Value::Json(_) => "JSON",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int { v, .. } => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value, widening integers to `f64`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int { v, .. } => Some(*v as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text { v, .. } => Some(v),
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Predicate truth of the value. NULL is unknown and therefore not true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int { v, .. } => *v != 0,
            Value::Float(f) => *f != 0.0,
            _ => false,
        }
    }

    /// SQL comparison: `None` when either side is NULL (unknown), otherwise
    /// the class rules of [`Value::total_cmp`] without the NULL tier.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.total_cmp(other))
    }

    /// Total ordering over all values.
    ///
    /// NULL sorts first and equal to NULL; mixed int/float compares as
    /// float; all integer widths are one class, as are all text kinds.
    /// Cross-class comparison falls back to the [`ValueClass`] rank so the
    /// comparator is total.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Int { v: a, .. }, Value::Int { v: b, .. }) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => f64_cmp(*a, *b),
            (Value::Int { v: a, .. }, Value::Float(b)) => f64_cmp(*a as f64, *b),
            (Value::Float(a), Value::Int { v: b, .. }) => f64_cmp(*a, *b as f64),
            (Value::Text { v: a, .. }, Value::Text { v: b, .. }) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::Vector(a), Value::Vector(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = f64_cmp(*x as f64, *y as f64);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Json(a), Value::Json(b)) => a.cmp(b),
            (a, b) => a.class().cmp(&b.class()),
        }
    }

    /// Equality under grouping/de-duplication rules: NULL equals NULL, and
    /// values are equal iff they compare equal within their class.
    pub fn group_eq(&self, other: &Value) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

fn f64_cmp(a: f64, b: f64) -> Ordering {
    // NaN sorts above every other float so the order stays total.
    a.partial_cmp(&b).unwrap_or_else(|| {
        let an = a.is_nan();
        let bn = b.is_nan();
        an.cmp(&bn)
    })
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int { v, .. } => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text { v, .. } => write!(f, "{v}"),
            Value::Blob(b) => {
                write!(f, "X'")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                write!(f, "'")
            }
            Value::Vector(v) => {
                write!(f, "[")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{x}")?;
                }
                write!(f, "]")
            }
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}
