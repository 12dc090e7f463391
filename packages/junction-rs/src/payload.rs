//! Self-describing JSON payload envelopes.
//!
//! Serialized workflow inputs travel as a JSON object whose first key is
//! `$type`, carrying the input's fully-qualified type name. Rehydration
//! prefers an out-of-band type hint (the `input_type_name` column) and falls
//! back to the embedded `$type` discriminator.
//!
//! `serde_json` keeps object keys in map order, and `$type` sorts ahead of
//! every identifier character, so the discriminator lands first without a
//! custom serializer.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::DecodeError;

/// Key carrying the type discriminator inside an envelope.
pub const TYPE_KEY: &str = "$type";

/// Serialize `value` into an envelope tagged with `type_name`.
///
/// The value must serialize to a JSON object; scalar and array inputs have
/// nowhere to carry the discriminator.
pub fn encode<T: Serialize>(type_name: &str, value: &T) -> Result<Value, serde_json::Error> {
    let mut object = match serde_json::to_value(value)? {
        Value::Object(map) => map,
        other => {
            return Err(serde::ser::Error::custom(format!(
                "payload must serialize to an object, got {}",
                kind_of(&other)
            )))
        }
    };
    object.insert(TYPE_KEY.to_string(), Value::String(type_name.to_string()));
    Ok(Value::Object(object))
}

/// Read the embedded `$type` discriminator, if any.
pub fn embedded_type(payload: &Value) -> Option<&str> {
    payload.get(TYPE_KEY).and_then(Value::as_str)
}

/// Rehydrate an envelope into `T`.
///
/// `hint` is the out-of-band type name (preferred); the embedded `$type` is
/// the fallback. Whichever is present is checked against `expected` — the
/// type name the registration was created with — and a mismatch is a
/// [`DecodeError::TypeMismatch`]. With neither present the payload is
/// decoded as-is.
pub fn decode<T: DeserializeOwned>(
    workflow: &str,
    expected: &str,
    payload: &Value,
    hint: Option<&str>,
) -> Result<T, DecodeError> {
    let object = match payload {
        Value::Object(map) => map,
        _ => {
            return Err(DecodeError::NonObjectPayload {
                workflow: workflow.to_string(),
            })
        }
    };

    let declared = hint.or_else(|| embedded_type(payload));
    if let Some(found) = declared {
        if found != expected {
            return Err(DecodeError::TypeMismatch {
                workflow: workflow.to_string(),
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
    }

    let mut stripped = object.clone();
    stripped.remove(TYPE_KEY);
    serde_json::from_value(Value::Object(stripped)).map_err(|source| DecodeError::InvalidPayload {
        workflow: workflow.to_string(),
        source,
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SweepInput {
        region: String,
        batch: u32,
    }

    const TYPE_NAME: &str = "billing.SweepInput";

    fn sample() -> SweepInput {
        SweepInput {
            region: "us-east".into(),
            batch: 4,
        }
    }

    #[test]
    fn encode_embeds_discriminator() {
        let envelope = encode(TYPE_NAME, &sample()).unwrap();
        assert_eq!(embedded_type(&envelope), Some(TYPE_NAME));
        assert_eq!(envelope["region"], "us-east");
    }

    #[test]
    fn discriminator_serializes_first() {
        let envelope = encode(TYPE_NAME, &sample()).unwrap();
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.starts_with(r#"{"$type""#), "got {text}");
    }

    #[test]
    fn decode_round_trips() {
        let envelope = encode(TYPE_NAME, &sample()).unwrap();
        let back: SweepInput = decode("sweep", TYPE_NAME, &envelope, None).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn decode_prefers_hint_over_embedded_type() {
        let envelope = encode("something.Stale", &sample()).unwrap();
        // The hint matches the registration, so the stale $type is ignored.
        let back: SweepInput = decode("sweep", TYPE_NAME, &envelope, Some(TYPE_NAME)).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn decode_rejects_mismatched_type() {
        let envelope = encode("reports.Export", &sample()).unwrap();
        let err = decode::<SweepInput>("sweep", TYPE_NAME, &envelope, None).unwrap_err();
        assert!(matches!(err, DecodeError::TypeMismatch { .. }));
    }

    #[test]
    fn decode_without_any_discriminator_still_works() {
        let bare = serde_json::json!({"region": "eu-west", "batch": 1});
        let back: SweepInput = decode("sweep", TYPE_NAME, &bare, None).unwrap();
        assert_eq!(back.region, "eu-west");
    }

    #[test]
    fn decode_rejects_non_object() {
        let err = decode::<SweepInput>("sweep", TYPE_NAME, &Value::from(42), None).unwrap_err();
        assert!(matches!(err, DecodeError::NonObjectPayload { .. }));
    }

    #[test]
    fn encode_rejects_scalar_input() {
        assert!(encode(TYPE_NAME, &7u32).is_err());
    }

    #[test]
    fn decode_reports_shape_errors() {
        let envelope = serde_json::json!({"$type": TYPE_NAME, "region": 9});
        let err = decode::<SweepInput>("sweep", TYPE_NAME, &envelope, None).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
    }
}
