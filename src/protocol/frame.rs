//! State frame decoding.
//!
//! The roaster pushes its state as an ASCII frame over the notify channel:
//!
//! ```text
//! [<environment_temp>,<bean_temp>,<heater>,<fan>]
//! ```
//!
//! Frames may be padded with NUL bytes and surrounded by whitespace.

use thiserror::Error;
use tracing::trace;

/// Number of comma-separated fields in a state frame.
pub const FRAME_FIELD_COUNT: usize = 4;

/// Reasons a notification frame is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame is not valid UTF-8 text.
    #[error("frame is not valid text")]
    InvalidEncoding,

    /// The payload is not wrapped in a single `[...]` pair.
    #[error("frame is not wrapped in a single bracket pair")]
    MissingBrackets,

    /// The payload does not hold exactly four fields.
    #[error("expected {FRAME_FIELD_COUNT} fields, found {found}")]
    FieldCount {
        /// The number of fields that were present.
        found: usize,
    },

    /// A field failed numeric parsing.
    #[error("invalid {field} value '{value}'")]
    InvalidField {
        /// Which field was malformed.
        field: &'static str,
        /// The raw text of the field.
        value: String,
    },
}

/// The values carried by one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReading {
    /// Environment (exhaust) temperature.
    pub environment_temperature: f64,
    /// Bean temperature.
    pub bean_temperature: f64,
    /// Heater output, 0-100.
    pub heater: i32,
    /// Fan output, 0-100.
    pub fan: i32,
}

/// Decode a raw notification frame.
///
/// Nothing is mutated here; callers apply the reading to their state only
/// when decoding succeeds.
///
/// # Example
///
/// ```
/// use matchbox_bridge::protocol::decode;
///
/// let reading = decode(b"[25.0,101.3,40,60]\0\0").unwrap();
/// assert_eq!(reading.bean_temperature, 101.3);
/// assert_eq!(reading.fan, 60);
/// ```
pub fn decode(frame: &[u8]) -> Result<FrameReading, DecodeError> {
    let text = std::str::from_utf8(frame).map_err(|_| DecodeError::InvalidEncoding)?;
    let text = text.replace('\0', "");
    let text = text.trim();

    trace!("Decoding frame: {:?}", text);

    let inner = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or(DecodeError::MissingBrackets)?;

    if inner.contains(['[', ']']) {
        return Err(DecodeError::MissingBrackets);
    }

    let fields: Vec<&str> = inner.split(',').map(str::trim).collect();
    if fields.len() != FRAME_FIELD_COUNT {
        return Err(DecodeError::FieldCount {
            found: fields.len(),
        });
    }

    Ok(FrameReading {
        environment_temperature: parse_field(fields[0], "environment temperature")?,
        bean_temperature: parse_field(fields[1], "bean temperature")?,
        heater: parse_field(fields[2], "heater")?,
        fan: parse_field(fields[3], "fan")?,
    })
}

fn parse_field<T: std::str::FromStr>(raw: &str, field: &'static str) -> Result<T, DecodeError> {
    raw.parse().map_err(|_| DecodeError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_valid_frame() {
        let reading = decode(b"[25.0,101.3,40,60]").unwrap();
        assert_eq!(reading.environment_temperature, 25.0);
        assert_eq!(reading.bean_temperature, 101.3);
        assert_eq!(reading.heater, 40);
        assert_eq!(reading.fan, 60);
    }

    #[test]
    fn test_decode_strips_padding() {
        let reading = decode(b"  [25.5,100.2,50,75]\r\n\0\0\0\0").unwrap();
        assert_eq!(reading.environment_temperature, 25.5);
        assert_eq!(reading.fan, 75);
    }

    #[test]
    fn test_decode_missing_brackets() {
        assert_eq!(decode(b"25.0,101.3,40,60"), Err(DecodeError::MissingBrackets));
        assert_eq!(decode(b"[25.0,101.3,40,60"), Err(DecodeError::MissingBrackets));
        assert_eq!(decode(b"25.0,101.3,40,60]"), Err(DecodeError::MissingBrackets));
        assert_eq!(decode(b"[[25.0,101.3,40,60]]"), Err(DecodeError::MissingBrackets));
        assert_eq!(decode(b""), Err(DecodeError::MissingBrackets));
    }

    #[test]
    fn test_decode_wrong_field_count() {
        assert_eq!(
            decode(b"[25.0,101.3,40]"),
            Err(DecodeError::FieldCount { found: 3 })
        );
        assert_eq!(
            decode(b"[25.0,101.3,40,60,1]"),
            Err(DecodeError::FieldCount { found: 5 })
        );
        assert_eq!(decode(b"[]"), Err(DecodeError::FieldCount { found: 1 }));
    }

    #[test]
    fn test_decode_non_numeric_field() {
        assert_eq!(
            decode(b"[25.0,hot,40,60]"),
            Err(DecodeError::InvalidField {
                field: "bean temperature",
                value: "hot".to_string(),
            })
        );
        // Heater and fan are integers
        assert!(matches!(
            decode(b"[25.0,101.3,40.5,60]"),
            Err(DecodeError::InvalidField { field: "heater", .. })
        ));
        assert!(matches!(
            decode(b"[25.0,101.3,40,]"),
            Err(DecodeError::InvalidField { field: "fan", .. })
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert_eq!(decode(&[0x5B, 0xFF, 0x5D]), Err(DecodeError::InvalidEncoding));
    }

    proptest! {
        #[test]
        fn test_decode_yields_exact_fields(
            env in -50.0f64..500.0,
            bean in -50.0f64..500.0,
            heater in 0i32..=100,
            fan in 0i32..=100,
        ) {
            let frame = format!("[{},{},{},{}]", env, bean, heater, fan);
            let reading = decode(frame.as_bytes()).unwrap();
            prop_assert_eq!(reading.environment_temperature, env);
            prop_assert_eq!(reading.bean_temperature, bean);
            prop_assert_eq!(reading.heater, heater);
            prop_assert_eq!(reading.fan, fan);
        }

        #[test]
        fn test_decode_rejects_unbracketed(body in "[0-9.,]{0,24}") {
            prop_assert_eq!(decode(body.as_bytes()), Err(DecodeError::MissingBrackets));
        }
    }
}
