use crate::value::Value;

/// A hashable projection of a [`Value`].
///
/// Group-by, hash-join, DISTINCT and set-operation keys all need `Eq + Hash`
/// over rows, and that equality must agree with [`Value::group_eq`]: NULL
/// equals NULL (but never the literal text `NULL`), and integers and floats
/// form one numeric class, so `1` and `1.0` key identically. Numerics key by
/// canonicalized `f64` bits, mirroring the comparator's float-widening
/// (`-0.0` folds into `0.0`, all NaNs fold into one).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Null,
    Numeric(u64),
    Text(String),
    Blob(Vec<u8>),
    Vector(Vec<u32>),
    Json(String),
}

impl From<&Value> for KeyValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => KeyValue::Null,
            Value::Int { v, .. } => KeyValue::Numeric(canonical_bits(*v as f64)),
            Value::Float(f) => KeyValue::Numeric(canonical_bits(*f)),
            Value::Text { v, .. } => KeyValue::Text(v.clone()),
            Value::Blob(b) => KeyValue::Blob(b.clone()),
            Value::Vector(v) => KeyValue::Vector(v.iter().map(|f| canonical_bits_f32(*f)).collect()),
            Value::Json(v) => KeyValue::Json(v.clone()),
        }
    }
}

fn canonical_bits(f: f64) -> u64 {
    if f.is_nan() {
        f64::NAN.to_bits()
    } else if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}

fn canonical_bits_f32(f: f32) -> u32 {
    if f.is_nan() {
        f32::NAN.to_bits()
    } else if f == 0.0 {
        0.0f32.to_bits()
    } else {
        f.to_bits()
    }
}

/// Hashable key over a whole row (or a projection of one).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey(Vec<KeyValue>);

impl RowKey {
    pub fn of_row(row: &[Value]) -> Self {
        RowKey(row.iter().map(KeyValue::from).collect())
    }

    pub fn of_value(v: &Value) -> Self {
        RowKey(vec![KeyValue::from(v)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::IntWidth;

    #[test]
    fn null_key_is_not_the_text_null() {
        let null = RowKey::of_value(&Value::Null);
        let text = RowKey::of_value(&Value::text("NULL"));
        assert_ne!(null, text);
        assert_eq!(null, RowKey::of_value(&Value::Null));
    }

    #[test]
    fn numerically_equal_int_and_float_share_a_key() {
        // Key equality mirrors group_eq: mixed int/float compares as float.
        assert_eq!(
            RowKey::of_value(&Value::int(1)),
            RowKey::of_value(&Value::Float(1.0))
        );
        assert_eq!(
            RowKey::of_value(&Value::int_width(7, IntWidth::I16)),
            RowKey::of_value(&Value::Float(7.0))
        );
        assert_ne!(
            RowKey::of_value(&Value::int(1)),
            RowKey::of_value(&Value::Float(1.5))
        );
    }

    #[test]
    fn key_equality_tracks_group_eq_for_numerics() {
        let pairs = [
            (Value::int(0), Value::Float(-0.0)),
            (Value::int(42), Value::Float(42.0)),
            (Value::Float(2.5), Value::Float(2.5)),
        ];
        for (a, b) in pairs {
            assert!(a.group_eq(&b));
            assert_eq!(RowKey::of_value(&a), RowKey::of_value(&b));
        }
    }

    #[test]
    fn negative_zero_folds_into_zero() {
        assert_eq!(
            RowKey::of_value(&Value::Float(-0.0)),
            RowKey::of_value(&Value::Float(0.0))
        );
    }
}
