use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::Record;

/// Reserved top-level field-name prefix. Any record whose top level
/// contains a key starting with this prefix is rejected before it ever
/// reaches the codec — see [`crate::index_set::IndexSet`].
pub const RESERVED_PREFIX: &str = "$$";

/// Serialize a single JSON value as one newline-framed log line. Used for
/// both plain records and the `$$`-sentinel envelope objects.
///
/// `serde_json::to_string` never emits a literal newline for a compact
/// (non-pretty) value, so the "no embedded newlines" contract holds by
/// construction.
pub fn encode_line(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode one line of the log. Empty/whitespace-only lines are not valid
/// here — callers (`Log::hydrate`) are expected to filter those out before
/// calling this, per the spec's "tolerate empty lines" contract.
pub fn decode_line(line: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| Error::Corrupt(format!("malformed log line: {e}")))?;
    if !value.is_object() {
        return Err(Error::Corrupt("log line is not a JSON object".into()));
    }
    Ok(value)
}

/// Encode a record to its on-disk line representation.
pub fn encode_record(record: &Record) -> Result<String> {
    encode_line(&record.clone().into_value())
}

/// Decode a record from its on-disk line representation.
pub fn decode_record(line: &str) -> Result<Record> {
    Record::new(decode_line(line)?)
}

/// Check a record for reserved top-level field names.
pub fn check_reserved(record: &Record) -> Result<()> {
    for field in record.as_map().keys() {
        if field.starts_with(RESERVED_PREFIX) {
            return Err(Error::ReservedField {
                field: field.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_object() {
        let rec = Record::new(json!({"_id": "1", "name": "Alice", "age": 30})).unwrap();
        let line = encode_record(&rec).unwrap();
        assert!(!line.contains('\n'));
        let decoded = decode_record(&line).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn roundtrip_date_sentinel() {
        let rec = Record::new(json!({"_id": "1", "created": {"$date": 1_700_000_000_000i64}}))
            .unwrap();
        let line = encode_record(&rec).unwrap();
        let decoded = decode_record(&line).unwrap();
        assert_eq!(decoded.get("created"), Some(&json!({"$date": 1_700_000_000_000i64})));
    }

    #[test]
    fn null_is_preserved_distinct_from_absent() {
        let rec = Record::new(json!({"_id": "1", "a": null})).unwrap();
        let line = encode_record(&rec).unwrap();
        let decoded = decode_record(&line).unwrap();
        assert_eq!(decoded.get("a"), Some(&Value::Null));
        assert_eq!(decoded.get("b"), None);
    }

    #[test]
    fn malformed_line_fails() {
        assert!(decode_line("{not json").is_err());
    }

    #[test]
    fn non_object_line_fails() {
        assert!(decode_line("[1,2,3]").is_err());
        assert!(decode_line("\"hello\"").is_err());
    }

    #[test]
    fn reserved_field_detected() {
        let rec = Record::new(json!({"_id": "1", "$$deleted": true})).unwrap();
        assert!(check_reserved(&rec).is_err());
    }

    #[test]
    fn ordinary_field_allowed() {
        let rec = Record::new(json!({"_id": "1", "foo": "bar"})).unwrap();
        assert!(check_reserved(&rec).is_ok());
    }
}
