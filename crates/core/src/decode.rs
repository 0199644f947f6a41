//! Tolerant payload decoding.
//!
//! Stored payloads outlive the code that wrote them. A field may have been
//! renamed, retyped or added since the event was persisted. Rather than failing
//! the whole stream, `decode_lenient` keeps every field that still fits the
//! current type and falls back to the type's default for the rest.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// A decoded value plus the payload members that had to be dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub value: T,
    pub ignored_fields: Vec<String>,
}

impl<T> Decoded<T> {
    pub fn is_complete(&self) -> bool {
        self.ignored_fields.is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("default value does not round-trip: {0}")]
    Baseline(String),
}

/// Decode `payload` into `T`, tolerating members that no longer fit.
///
/// A strict decode is tried first. If it fails and the payload is an object,
/// fields are overlaid one at a time onto `T::default()` and kept only when
/// the merged object still decodes.
pub fn decode_lenient<T>(payload: &JsonValue) -> Result<Decoded<T>, DecodeError>
where
    T: DeserializeOwned + Serialize + Default,
{
    let strict_error = match serde_json::from_value::<T>(payload.clone()) {
        Ok(value) => {
            return Ok(Decoded {
                value,
                ignored_fields: Vec::new(),
            });
        }
        Err(e) => e,
    };

    let JsonValue::Object(fields) = payload else {
        return Err(DecodeError::NotAnObject(strict_error.to_string()));
    };

    let mut merged: Map<String, JsonValue> = match serde_json::to_value(T::default()) {
        Ok(JsonValue::Object(map)) => map,
        Ok(other) => {
            return Err(DecodeError::Baseline(format!(
                "default serializes to {other}, not an object"
            )));
        }
        Err(e) => return Err(DecodeError::Baseline(e.to_string())),
    };

    let mut ignored_fields = Vec::new();
    for (name, value) in fields {
        let previous = merged.insert(name.clone(), value.clone());
        if serde_json::from_value::<T>(JsonValue::Object(merged.clone())).is_err() {
            match previous {
                Some(previous) => {
                    merged.insert(name.clone(), previous);
                }
                None => {
                    merged.remove(name);
                }
            }
            ignored_fields.push(name.clone());
        }
    }

    let value = serde_json::from_value::<T>(JsonValue::Object(merged))
        .map_err(|e| DecodeError::Baseline(e.to_string()))?;

    Ok(Decoded {
        value,
        ignored_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Shipment {
        carrier: String,
        parcels: u32,
    }

    #[test]
    fn strict_payloads_decode_without_loss() {
        let decoded: Decoded<Shipment> =
            decode_lenient(&json!({ "carrier": "dhl", "parcels": 2 })).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.value.parcels, 2);
    }

    #[test]
    fn extra_members_are_ignored_by_serde() {
        let decoded: Decoded<Shipment> =
            decode_lenient(&json!({ "carrier": "dhl", "parcels": 2, "insured": true })).unwrap();
        assert!(decoded.is_complete());
    }

    #[test]
    fn mistyped_member_keeps_the_rest() {
        let decoded: Decoded<Shipment> =
            decode_lenient(&json!({ "carrier": "ups", "parcels": "three" })).unwrap();
        assert_eq!(decoded.value.carrier, "ups");
        assert_eq!(decoded.value.parcels, 0);
        assert_eq!(decoded.ignored_fields, vec!["parcels".to_string()]);
    }

    #[test]
    fn missing_member_falls_back_to_default() {
        let decoded: Decoded<Shipment> = decode_lenient(&json!({ "carrier": "ups" })).unwrap();
        assert_eq!(decoded.value.carrier, "ups");
        assert_eq!(decoded.value.parcels, 0);
        assert!(decoded.is_complete());
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        let err = decode_lenient::<Shipment>(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject(_)));
    }

    proptest! {
        #[test]
        fn well_formed_payloads_are_never_trimmed(carrier in "[a-z]{0,12}", parcels in any::<u32>()) {
            let payload = json!({ "carrier": carrier.clone(), "parcels": parcels });
            let decoded: Decoded<Shipment> = decode_lenient(&payload).unwrap();
            prop_assert!(decoded.is_complete());
            prop_assert_eq!(decoded.value, Shipment { carrier, parcels });
        }
    }
}
