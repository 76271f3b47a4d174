use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The probe budget for primary-key generation (see [`generate_key`]).
const KEY_PROBE_BUDGET: u64 = 100_000_000;

/// An immutable JSON object, frozen once accepted into the store.
///
/// `Record` is cheap to clone (it owns a `serde_json::Map`) and is always
/// handed to callers as an independent copy — the store never exposes a
/// `&mut` view into its own state.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Wrap a JSON object as a record. Fails if `value` is not an object.
    pub fn new(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(Error::NotAnObject),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Access a nested field using dot notation, e.g. `"user.address.city"`.
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        let mut current = self.0.get(path.split('.').next()?)?;
        let mut parts = path.split('.');
        parts.next();
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    pub fn primary_key<'a>(&'a self, field_name: &str) -> Option<&'a Value> {
        self.get_field(field_name)
    }
}

/// Rolling 32-bit additive string hash: `h = (h << 5) - h + byte`, i.e.
/// `h = h*31 + byte`, computed with wrapping arithmetic over the record's
/// canonical (compact) JSON serialization.
pub fn hash_record(value: &Value) -> u32 {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut h: u32 = 0;
    for byte in bytes {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(byte as u32);
    }
    h
}

/// Deterministically generate a fresh primary key for `record`, avoiding
/// every key in `existing`.
///
/// Probes `(hash + n) mod 2^31` for increasing `n`, base-36 encoding the
/// first free slot. Exhausts after [`KEY_PROBE_BUDGET`] probes.
pub fn generate_key<F>(record: &Value, taken: F) -> Result<Value>
where
    F: Fn(&str) -> bool,
{
    generate_key_with_budget(record, taken, KEY_PROBE_BUDGET)
}

fn generate_key_with_budget<F>(record: &Value, taken: F, budget: u64) -> Result<Value>
where
    F: Fn(&str) -> bool,
{
    let hash = hash_record(record) as u64 % (1u64 << 31);
    for n in 0..budget {
        let candidate = (hash + n) % (1u64 << 31);
        let key = to_base36(candidate);
        if !taken(&key) {
            return Ok(Value::String(key));
        }
    }
    Err(Error::KeyGenerationExhausted)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_field_access() {
        let rec = Record::new(json!({"a": {"b": {"c": 42}}})).unwrap();
        assert_eq!(rec.get_field("a.b.c"), Some(&json!(42)));
        assert_eq!(rec.get_field("a.b.missing"), None);
        assert_eq!(rec.get_field("x"), None);
    }

    #[test]
    fn non_object_rejected() {
        assert!(Record::new(json!([1, 2, 3])).is_err());
        assert!(Record::new(json!("hello")).is_err());
    }

    #[test]
    fn base36_roundtrip_shape() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn generate_key_picks_free_slot() {
        let rec = json!({"foo": "bar"});
        let key1 = generate_key(&rec, |_| false).unwrap();
        let taken = key1.clone();
        let key2 = generate_key(&rec, move |k| k == taken.as_str().unwrap()).unwrap();
        assert_ne!(key1, key2);
    }

    #[test]
    fn generate_key_exhaustion() {
        let rec = json!({});
        let err = generate_key_with_budget(&rec, |_| true, 10).unwrap_err();
        assert!(matches!(err, Error::KeyGenerationExhausted));
    }

    #[test]
    fn hash_is_deterministic() {
        let rec = json!({"a": 1, "b": "two"});
        assert_eq!(hash_record(&rec), hash_record(&rec));
    }
}
