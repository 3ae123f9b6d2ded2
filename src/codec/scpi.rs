//! SCPI scalar and response-grammar helpers
//!
//! SCPI reports overflow as `9.9E37` (negative overflow as `-9.9E37`) and
//! "not a number" as `9.91E37`. These helpers map those sentinels onto the
//! IEEE values and back.

use crate::error::{VisaError, VisaResult};

/// Positive overflow sentinel.
pub const OVERFLOW: f64 = 9.9e37;
/// Not-a-number sentinel.
pub const NOT_A_NUMBER: f64 = 9.91e37;

/// Parse a SCPI numeric response.
///
/// Overflow sentinels become ±infinity; `9.91E37`, empty and unparsable
/// responses become NaN.
pub fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return f64::NAN;
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v == NOT_A_NUMBER => f64::NAN,
        Ok(v) if v >= OVERFLOW => f64::INFINITY,
        Ok(v) if v <= -OVERFLOW => f64::NEG_INFINITY,
        Ok(v) => v,
        Err(_) => f64::NAN,
    }
}

/// Format a number for a SCPI command, emitting sentinels for non-finite values.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "9.91E+37".to_string()
    } else if value == f64::INFINITY {
        "9.9E+37".to_string()
    } else if value == f64::NEG_INFINITY {
        "-9.9E+37".to_string()
    } else {
        value.to_string()
    }
}

/// Parse a SCPI boolean; `None` for anything but `1/ON/TRUE` and `0/OFF/FALSE`.
pub fn parse_bool(text: &str) -> Option<bool> {
    let trimmed = text.trim();
    if trimmed == "1"
        || trimmed.eq_ignore_ascii_case("ON")
        || trimmed.eq_ignore_ascii_case("TRUE")
    {
        Some(true)
    } else if trimmed == "0"
        || trimmed.eq_ignore_ascii_case("OFF")
        || trimmed.eq_ignore_ascii_case("FALSE")
    {
        Some(false)
    } else {
        None
    }
}

/// SCPI spelling of a boolean argument.
pub fn format_bool(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

/// Fields of an `*IDN?` response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    /// First `*IDN?` field
    pub manufacturer: String,
    /// Second `*IDN?` field
    pub model: String,
    /// Empty when the instrument omits it
    pub serial_number: String,
    /// Firmware revision, the last field
    pub firmware: String,
}

/// Parse `<manufacturer>,<model>,<serial>,<firmware>`.
///
/// Missing trailing fields are left empty; extra commas stay in the firmware field.
///
/// # Errors
/// [`VisaError::Protocol`] for an empty response.
pub fn parse_idn(text: &str) -> VisaResult<Identity> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(VisaError::Protocol("empty *IDN? response".into()));
    }

    let mut fields = trimmed.splitn(4, ',').map(|f| f.trim().to_string());
    Ok(Identity {
        manufacturer: fields.next().unwrap_or_default(),
        model: fields.next().unwrap_or_default(),
        serial_number: fields.next().unwrap_or_default(),
        firmware: fields.next().unwrap_or_default(),
    })
}

/// One entry of the instrument error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiErrorEntry {
    /// SCPI error number, 0 for "No error"
    pub code: i32,
    /// Text without the surrounding quotes
    pub message: String,
}

impl ScpiErrorEntry {
    /// Code 0 means the queue is empty.
    pub fn is_no_error(&self) -> bool {
        self.code == 0
    }
}

/// Parse a `:SYST:ERR?` response: `<code>,"<message>"`.
///
/// # Errors
/// [`VisaError::Protocol`] when the code is not an integer.
pub fn parse_error(text: &str) -> VisaResult<ScpiErrorEntry> {
    let trimmed = text.trim();
    let (code, message) = match trimmed.split_once(',') {
        Some((code, message)) => (code, message),
        None => (trimmed, ""),
    };
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| VisaError::Protocol(format!("malformed error queue entry '{}'", trimmed)))?;
    let message = message.trim();
    let message = message
        .strip_prefix('"')
        .and_then(|m| m.strip_suffix('"'))
        .unwrap_or(message);

    Ok(ScpiErrorEntry {
        code,
        message: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_sentinels() {
        assert_eq!(parse_number("9.9E37"), f64::INFINITY);
        assert_eq!(parse_number("9.9E+37"), f64::INFINITY);
        assert_eq!(parse_number("-9.9E37"), f64::NEG_INFINITY);
        assert!(parse_number("9.91E37").is_nan());
        assert!(parse_number("****").is_nan());
        assert!(parse_number("").is_nan());
        assert_eq!(parse_number(" +1.250E-3\n"), 1.25e-3);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(f64::INFINITY), "9.9E+37");
        assert_eq!(format_number(f64::NEG_INFINITY), "-9.9E+37");
        assert!(parse_number(&format_number(f64::NAN)).is_nan());
        assert_eq!(format_number(2.5), "2.5");
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("OFF"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("0\n"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(format_bool(true), "ON");
    }

    #[test]
    fn test_parse_idn() {
        let id = parse_idn("RIGOL TECHNOLOGIES,DS1104Z,DS1ZA123456789,00.04.04.SP3\n").unwrap();
        assert_eq!(id.manufacturer, "RIGOL TECHNOLOGIES");
        assert_eq!(id.model, "DS1104Z");
        assert_eq!(id.serial_number, "DS1ZA123456789");
        assert_eq!(id.firmware, "00.04.04.SP3");

        let short = parse_idn("ACME,PSU1").unwrap();
        assert_eq!(short.serial_number, "");
        assert!(parse_idn("  ").is_err());
    }

    #[test]
    fn test_parse_error_queue_entry() {
        let none = parse_error("0,\"No error\"").unwrap();
        assert!(none.is_no_error());
        assert_eq!(none.message, "No error");

        let entry = parse_error("-113,\"Undefined header; CHAN5\"").unwrap();
        assert_eq!(entry.code, -113);
        assert_eq!(entry.message, "Undefined header; CHAN5");

        assert!(parse_error("garbage").is_err());
    }
}
