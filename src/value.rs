//! Call payload values.
//!
//! A payload is a tree of plain data with blobs in explicit positions. The
//! blob type differs by direction:
//!
//! - [`OutgoingValue`] holds [`ProtocolBlob`]s to be streamed to the peer.
//! - [`IncomingValue`] holds [`BlobReader`]s for streams the peer opened.
//!
//! Plain leaves are `serde_json::Value`s; payload formats translate them to
//! and from their own encoding.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::blob::{BlobReader, ProtocolBlob};
use crate::error::{CallwireError, Result};

/// Payload tree with blobs of type `B`.
#[derive(Debug)]
pub enum Value<B> {
    /// Plain data without blobs.
    Plain(serde_json::Value),
    /// A blob streamed next to the payload.
    Blob(B),
    List(Vec<Value<B>>),
    Record(BTreeMap<String, Value<B>>),
}

/// Payload being sent.
pub type OutgoingValue = Value<ProtocolBlob>;

/// Payload being received.
pub type IncomingValue = Value<BlobReader>;

impl<B> Value<B> {
    /// JSON `null`.
    pub fn null() -> Self {
        Value::Plain(serde_json::Value::Null)
    }

    /// Plain value from anything serializable.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Value::Plain(serde_json::to_value(value)?))
    }

    /// Borrow the plain value at the root, if it is one.
    pub fn as_plain(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Plain(value) => Some(value),
            _ => None,
        }
    }

    /// Field of a record, or of a plain JSON object.
    pub fn take(&mut self, key: &str) -> Option<Value<B>> {
        match self {
            Value::Record(fields) => fields.remove(key),
            Value::Plain(serde_json::Value::Object(map)) => map.remove(key).map(Value::Plain),
            _ => None,
        }
    }

    pub fn into_blob(self) -> Option<B> {
        match self {
            Value::Blob(blob) => Some(blob),
            _ => None,
        }
    }

    /// Whether any blob appears in the tree.
    pub fn has_blobs(&self) -> bool {
        match self {
            Value::Plain(_) => false,
            Value::Blob(_) => true,
            Value::List(items) => items.iter().any(Value::has_blobs),
            Value::Record(fields) => fields.values().any(Value::has_blobs),
        }
    }

    /// Collapse a blob-free tree into one plain value.
    pub fn into_plain(self) -> Result<serde_json::Value> {
        match self {
            Value::Plain(value) => Ok(value),
            Value::Blob(_) => Err(CallwireError::InvalidValue(
                "Payload contains a blob where plain data was expected".into(),
            )),
            Value::List(items) => items
                .into_iter()
                .map(Value::into_plain)
                .collect::<Result<Vec<_>>>()
                .map(serde_json::Value::Array),
            Value::Record(fields) => fields
                .into_iter()
                .map(|(k, v)| v.into_plain().map(|v| (k, v)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
        }
    }

    /// Deserialize a blob-free tree into `T`.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.into_plain()?)?)
    }

    /// Visit blobs depth-first, mapping each to a new blob type.
    pub fn try_map_blobs<C, F>(self, f: &mut F) -> Result<Value<C>>
    where
        F: FnMut(B) -> Result<C>,
    {
        Ok(match self {
            Value::Plain(value) => Value::Plain(value),
            Value::Blob(blob) => Value::Blob(f(blob)?),
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| item.try_map_blobs(f))
                    .collect::<Result<_>>()?,
            ),
            Value::Record(fields) => Value::Record(
                fields
                    .into_iter()
                    .map(|(k, v)| v.try_map_blobs(f).map(|v| (k, v)))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

impl<B> From<serde_json::Value> for Value<B> {
    fn from(value: serde_json::Value) -> Self {
        Value::Plain(value)
    }
}

impl From<ProtocolBlob> for OutgoingValue {
    fn from(blob: ProtocolBlob) -> Self {
        Value::Blob(blob)
    }
}

impl<B> FromIterator<(String, Value<B>)> for Value<B> {
    fn from_iter<I: IntoIterator<Item = (String, Value<B>)>>(iter: I) -> Self {
        Value::Record(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        name: String,
    }

    fn mixed() -> Value<u32> {
        [
            ("user".to_string(), Value::Plain(json!({ "name": "ann" }))),
            (
                "files".to_string(),
                Value::List(vec![Value::Blob(1), Value::Blob(2)]),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_has_blobs() {
        assert!(mixed().has_blobs());
        assert!(!Value::<u32>::Plain(json!([1, 2])).has_blobs());
    }

    #[test]
    fn test_into_plain_rejects_blobs() {
        assert!(matches!(
            mixed().into_plain(),
            Err(CallwireError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_into_plain_collapses_structure() {
        let value: Value<u32> = Value::List(vec![
            Value::Plain(json!(1)),
            [("a".to_string(), Value::Plain(json!(true)))]
                .into_iter()
                .collect(),
        ]);
        assert_eq!(value.into_plain().unwrap(), json!([1, { "a": true }]));
    }

    #[test]
    fn test_take_and_deserialize() {
        let mut value = mixed();
        let user: User = value.take("user").unwrap().deserialize().unwrap();
        assert_eq!(user, User { name: "ann".into() });
        assert!(value.take("missing").is_none());

        let mut plain: Value<u32> = Value::Plain(json!({ "n": 3 }));
        assert_eq!(plain.take("n").unwrap().as_plain(), Some(&json!(3)));
    }

    #[test]
    fn test_try_map_blobs_in_order() {
        let mut seen = Vec::new();
        let mapped = mixed()
            .try_map_blobs(&mut |id| {
                seen.push(id);
                Ok(format!("stream-{id}"))
            })
            .unwrap();

        assert_eq!(seen, vec![1, 2]);
        let mut mapped = mapped;
        let files = mapped.take("files").unwrap();
        match files {
            Value::List(items) => {
                assert_eq!(items[0].as_plain(), None);
                assert_eq!(
                    items.into_iter().next().unwrap().into_blob().as_deref(),
                    Some("stream-1")
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_try_map_blobs_propagates_error() {
        let result: Result<Value<()>> =
            mixed().try_map_blobs(&mut |_| Err(CallwireError::InvalidValue("no".into())));
        assert!(result.is_err());
    }
}
