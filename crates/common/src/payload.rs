use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque structured context carried by sagas, steps, and outbox messages.
///
/// The orchestrator never interprets a payload; compensation handlers and
/// undo actions read the fields they stored. Keeping a structured map at
/// the interface boundary (rather than serialized text) means serialization
/// happens exactly once, at the persistence edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of a serializable value.
    ///
    /// Values that fail to serialize are dropped; payload fields are plain
    /// data and serialization of plain data does not fail in practice.
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.0.insert(key.into(), value);
        }
        self
    }

    /// Inserts a value under the given key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.0.insert(key.into(), value);
        }
    }

    /// Returns the raw JSON value under a key, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Returns an integer field.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// Returns a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Parses a string field as a UUID.
    pub fn get_uuid(&self, key: &str) -> Option<Uuid> {
        self.get_str(key).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Returns true if the payload has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Converts to a JSON value for persistence or the wire.
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Builds a payload from a JSON value read back from storage.
    ///
    /// Non-object values yield an empty payload; stored payloads are always
    /// written as objects.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_and_get() {
        let payload = Payload::new()
            .with("user_id", "abc-123")
            .with("attempts", 3)
            .with("active", true);

        assert_eq!(payload.get_str("user_id"), Some("abc-123"));
        assert_eq!(payload.get_i64("attempts"), Some(3));
        assert_eq!(payload.get_bool("active"), Some(true));
        assert_eq!(payload.len(), 3);
    }

    #[test]
    fn get_uuid_parses_string_field() {
        let uuid = Uuid::new_v4();
        let payload = Payload::new().with("entity_id", uuid.to_string());
        assert_eq!(payload.get_uuid("entity_id"), Some(uuid));
        assert_eq!(payload.get_uuid("missing"), None);
    }

    #[test]
    fn json_roundtrip() {
        let payload = Payload::new().with("key", "value").with("count", 7);
        let json = payload.to_json();
        let restored = Payload::from_json(json);
        assert_eq!(payload, restored);
    }

    #[test]
    fn from_json_non_object_is_empty() {
        let payload = Payload::from_json(serde_json::json!("not a map"));
        assert!(payload.is_empty());
    }

    #[test]
    fn serde_transparent() {
        let payload = Payload::new().with("a", 1);
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"a":1}"#);
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
