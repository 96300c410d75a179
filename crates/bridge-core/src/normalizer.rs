//! Message normalizer.
//!
//! Turns raw broker payloads into typed events. This module is pure: it
//! never logs and never panics, callers decide what to do with a
//! [`ParseError`].

use crate::device::DeviceKey;
use crate::event::{StatusEvent, TelemetryReading};
use crate::topic::TopicRoute;
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;

/// Normalization errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Payload is not valid UTF-8.
    #[error("Payload is not valid UTF-8")]
    InvalidEncoding,

    /// Payload is empty.
    #[error("Payload is empty")]
    Empty,

    /// Telemetry payload is not a JSON object.
    #[error("Telemetry payload is not a JSON object")]
    NotStructured,

    /// A required field is missing or null.
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A field has a value of the wrong kind.
    #[error("Invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    /// The topic carries nothing this bridge can normalize.
    #[error("Topic is not routable")]
    Unroutable,
}

/// A raw payload, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Well-formed JSON.
    Structured(Value),
    /// UTF-8 text that is not JSON.
    PlainText(String),
    /// Not UTF-8.
    Invalid,
}

impl Payload {
    /// Classify raw payload bytes.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let Ok(text) = std::str::from_utf8(raw) else {
            return Payload::Invalid;
        };
        match serde_json::from_str(text) {
            Ok(value) => Payload::Structured(value),
            Err(_) => Payload::PlainText(text.to_string()),
        }
    }
}

/// A normalized broker message.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Telemetry(TelemetryReading),
    Status(StatusEvent),
}

/// Normalize a payload according to its topic classification.
///
/// # Errors
///
/// Returns an error if the payload is malformed or the route is
/// [`TopicRoute::Unrecognized`].
pub fn normalize(route: &TopicRoute, raw: &[u8]) -> Result<Normalized, ParseError> {
    match route {
        TopicRoute::Telemetry => parse_telemetry(raw).map(Normalized::Telemetry),
        TopicRoute::Status(device) => parse_status(device, raw).map(Normalized::Status),
        TopicRoute::Unrecognized => Err(ParseError::Unroutable),
    }
}

/// Parse a telemetry payload.
///
/// The payload must be a JSON object with `temperature`, `humidity` and
/// `light`. Numbers and numeric strings are accepted; zero is a legal value.
///
/// # Errors
///
/// Returns an error if a field is missing, null, or not numeric.
pub fn parse_telemetry(raw: &[u8]) -> Result<TelemetryReading, ParseError> {
    let object = match Payload::parse(raw) {
        Payload::Structured(Value::Object(object)) => object,
        Payload::Invalid => return Err(ParseError::InvalidEncoding),
        _ => return Err(ParseError::NotStructured),
    };

    let temperature = number_field(&object, "temperature")?;
    let humidity = number_field(&object, "humidity")?;
    let light = integer_field(&object, "light")?;

    Ok(TelemetryReading {
        temperature,
        humidity,
        light,
        timestamp: Utc::now(),
    })
}

/// Parse a status payload for `device`.
///
/// A JSON object must carry a string `status`. Text that is not JSON is
/// taken as the verbatim status token; other JSON values are rejected.
///
/// # Errors
///
/// Returns an error if the payload is empty, not UTF-8, a JSON scalar, or
/// an object without a usable `status`.
pub fn parse_status(device: &DeviceKey, raw: &[u8]) -> Result<StatusEvent, ParseError> {
    let action = match Payload::parse(raw) {
        Payload::Structured(Value::Object(object)) => match object.get("status") {
            None | Some(Value::Null) => return Err(ParseError::MissingField("status")),
            Some(Value::String(status)) => status.clone(),
            Some(other) => {
                return Err(ParseError::InvalidField {
                    field: "status",
                    value: other.to_string(),
                })
            }
        },
        // A JSON scalar carries no `status` field.
        Payload::Structured(_) => return Err(ParseError::MissingField("status")),
        Payload::PlainText(token) => token,
        Payload::Invalid => return Err(ParseError::InvalidEncoding),
    };

    if action.trim().is_empty() {
        return Err(if raw.is_empty() {
            ParseError::Empty
        } else {
            ParseError::InvalidField {
                field: "status",
                value: action,
            }
        });
    }

    Ok(StatusEvent::new(device.clone(), action))
}

fn field<'a>(object: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, ParseError> {
    match object.get(name) {
        None | Some(Value::Null) => Err(ParseError::MissingField(name)),
        Some(value) => Ok(value),
    }
}

fn invalid(name: &'static str, value: &Value) -> ParseError {
    ParseError::InvalidField {
        field: name,
        value: value.to_string(),
    }
}

fn number_field(object: &Map<String, Value>, name: &'static str) -> Result<f64, ParseError> {
    let value = field(object, name)?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number
        .filter(|n| n.is_finite())
        .ok_or_else(|| invalid(name, value))
}

fn integer_field(object: &Map<String, Value>, name: &'static str) -> Result<i64, ParseError> {
    let value = field(object, name)?;
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    let number = number_field(object, name)?.trunc();
    if number < i64::MIN as f64 || number > i64::MAX as f64 {
        return Err(invalid(name, value));
    }
    // Truncation toward zero, range checked above.
    Ok(number as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan() -> DeviceKey {
        DeviceKey::new("fan")
    }

    #[test]
    fn test_payload_classification() {
        assert_eq!(
            Payload::parse(br#"{"status":"on"}"#),
            Payload::Structured(serde_json::json!({"status": "on"}))
        );
        assert_eq!(Payload::parse(b"on"), Payload::PlainText("on".to_string()));
        assert_eq!(Payload::parse(&[0xff, 0xfe]), Payload::Invalid);
    }

    #[test]
    fn test_telemetry_valid() {
        let reading =
            parse_telemetry(br#"{"temperature":24.5,"humidity":61,"light":320}"#).unwrap();
        assert_eq!(reading.temperature, 24.5);
        assert_eq!(reading.humidity, 61.0);
        assert_eq!(reading.light, 320);
    }

    #[test]
    fn test_telemetry_zero_is_valid() {
        let reading = parse_telemetry(br#"{"temperature":0,"humidity":0,"light":0}"#).unwrap();
        assert_eq!(reading.temperature, 0.0);
        assert_eq!(reading.humidity, 0.0);
        assert_eq!(reading.light, 0);
    }

    #[test]
    fn test_telemetry_missing_or_null_fields() {
        let cases: [(&[u8], &str); 6] = [
            (br#"{"humidity":1,"light":1}"#, "temperature"),
            (br#"{"temperature":1,"light":1}"#, "humidity"),
            (br#"{"temperature":1,"humidity":1}"#, "light"),
            (br#"{"temperature":null,"humidity":1,"light":1}"#, "temperature"),
            (br#"{"temperature":1,"humidity":null,"light":1}"#, "humidity"),
            (br#"{"temperature":1,"humidity":1,"light":null}"#, "light"),
        ];
        for (payload, field) in cases {
            assert_eq!(
                parse_telemetry(payload).unwrap_err(),
                ParseError::MissingField(field),
                "payload {}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_telemetry_numeric_strings_are_coerced() {
        let reading =
            parse_telemetry(br#"{"temperature":"22.5","humidity":"40","light":"310.9"}"#).unwrap();
        assert_eq!(reading.temperature, 22.5);
        assert_eq!(reading.humidity, 40.0);
        assert_eq!(reading.light, 310);
    }

    #[test]
    fn test_telemetry_light_truncates() {
        let reading =
            parse_telemetry(br#"{"temperature":1,"humidity":1,"light":-12.7}"#).unwrap();
        assert_eq!(reading.light, -12);
    }

    #[test]
    fn test_telemetry_rejects_non_numeric() {
        assert!(matches!(
            parse_telemetry(br#"{"temperature":"warm","humidity":1,"light":1}"#),
            Err(ParseError::InvalidField { field: "temperature", .. })
        ));
        assert!(matches!(
            parse_telemetry(br#"{"temperature":1,"humidity":[1],"light":1}"#),
            Err(ParseError::InvalidField { field: "humidity", .. })
        ));
    }

    #[test]
    fn test_telemetry_rejects_unstructured() {
        assert_eq!(parse_telemetry(b"24.5").unwrap_err(), ParseError::NotStructured);
        assert_eq!(parse_telemetry(b"hello").unwrap_err(), ParseError::NotStructured);
        assert_eq!(parse_telemetry(&[0xc3, 0x28]).unwrap_err(), ParseError::InvalidEncoding);
    }

    #[test]
    fn test_status_json_and_text_agree() {
        let structured = parse_status(&fan(), br#"{"status":"on"}"#).unwrap();
        let bare = parse_status(&fan(), b"on").unwrap();
        assert_eq!(structured.action, "on");
        assert_eq!(bare.action, "on");
        assert_eq!(structured.device, bare.device);
        assert!(structured.is_on() && bare.is_on());
    }

    #[test]
    fn test_status_other_tokens_verbatim() {
        assert_eq!(parse_status(&fan(), b"off").unwrap().action, "off");
        assert_eq!(parse_status(&fan(), b"standby").unwrap().action, "standby");
        assert_eq!(parse_status(&fan(), b"On ").unwrap().action, "On ");
    }

    #[test]
    fn test_status_rejects_json_scalars() {
        for raw in [&b"null"[..], b"true", b"1", br#""on""#] {
            assert_eq!(
                parse_status(&fan(), raw).unwrap_err(),
                ParseError::MissingField("status"),
                "payload {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_status_rejects_bad_objects() {
        assert_eq!(
            parse_status(&fan(), br#"{"state":"on"}"#).unwrap_err(),
            ParseError::MissingField("status")
        );
        assert!(matches!(
            parse_status(&fan(), br#"{"status":true}"#),
            Err(ParseError::InvalidField { field: "status", .. })
        ));
        assert_eq!(parse_status(&fan(), b"").unwrap_err(), ParseError::Empty);
        assert!(parse_status(&fan(), b"   ").is_err());
    }

    #[test]
    fn test_normalize_dispatches_on_route() {
        let telemetry = normalize(
            &TopicRoute::Telemetry,
            br#"{"temperature":1,"humidity":2,"light":3}"#,
        )
        .unwrap();
        assert!(matches!(telemetry, Normalized::Telemetry(_)));

        let status = normalize(&TopicRoute::Status(fan()), b"off").unwrap();
        assert!(matches!(status, Normalized::Status(ref e) if e.action == "off"));

        assert_eq!(
            normalize(&TopicRoute::Unrecognized, b"on").unwrap_err(),
            ParseError::Unroutable
        );
    }
}
