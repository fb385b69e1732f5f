//! Byte-size parsing for buffer and file limits
//!
//! Accepts plain integers in any base Go-style (`1024`, `0x12`, `0b111`,
//! `0o12`, leading-zero octal, `_` digit separators) with an optional
//! `kb`/`mb`/`gb`/`tb` suffix, case-insensitive. Empty or whitespace-only
//! input falls back to the supplied default.

use crate::error::{ReflowError, Result};
use regex::Regex;

const KB: i64 = 1 << 10;
const MB: i64 = 1 << 20;
const GB: i64 = 1 << 30;
const TB: i64 = 1 << 40;

/// Parse a human byte-size string into bytes.
///
/// `fallback` replaces an empty or whitespace-only `size` so callers can
/// keep their flag defaults when a flag is passed with no value.
pub fn parse_byte_size(size: &str, fallback: &str) -> Result<i64> {
    let number = Regex::new(r"(?i)^(?:0b|0x|0o)?[\da-f_]+$");
    let with_unit = Regex::new(r"(?i)^(?:0b|0x|0o)?[\da-f_]+(kb|mb|gb|tb)$");
    let empty = Regex::new(r"^[\n\t\r 0.\x0c\x07]*$");
    let (number, with_unit, empty) = match (number, with_unit, empty) {
        (Ok(a), Ok(b), Ok(c)) => (a, b, c),
        _ => return Err(ReflowError::Config("invalid size pattern".to_string())),
    };

    let mut size = size;
    if empty.is_match(size) {
        size = fallback;
    }

    if let Some(caps) = with_unit.captures(size) {
        let unit = match caps
            .get(1)
            .map(|m| m.as_str().to_ascii_lowercase())
            .as_deref()
        {
            Some("kb") => KB,
            Some("mb") => MB,
            Some("gb") => GB,
            _ => TB,
        };
        let n = parse_prefixed_int(&size[..size.len() - 2])?;
        return n
            .checked_mul(unit)
            .ok_or_else(|| ReflowError::config("size", format!("overflow in {:?}", size)));
    }

    if number.is_match(size) {
        return parse_prefixed_int(size);
    }

    Err(ReflowError::config("size", format!("invalid buffer {:?}", size)))
}

/// Parse an integer with Go `strconv.ParseInt(s, 0, 64)` semantics:
/// `0x`/`0o`/`0b` prefixes, legacy leading-zero octal, `_` separators.
fn parse_prefixed_int(s: &str) -> Result<i64> {
    let cleaned: String = s.chars().filter(|c| *c != '_').collect();
    let lower = cleaned.to_ascii_lowercase();

    let (radix, digits) = if let Some(rest) = lower.strip_prefix("0x") {
        (16, rest)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (8, rest)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (8, &lower[1..])
    } else {
        (10, lower.as_str())
    };

    i64::from_str_radix(digits, radix)
        .map_err(|e| ReflowError::config("size", format!("{:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_units() {
        let cases: &[(&str, i64)] = &[
            ("42mb", 42 << 20),
            ("4_2", 42),
            ("00", 0),
            ("\n\n 0.0\r\t\x0c", 0),
            ("0_600tb", 384 << 40),
            ("0600Tb", 384 << 40),
            ("0o12Mb", 10 << 20),
            ("0b_10010001111_1kb", 2335 << 10),
            ("1024", 1 << 10),
            ("0b111", 7),
            ("0x12gB", 18 << 30),
            ("0x_67_7a_2f_cc_40_c6", 113774485586118),
            ("121562380192901", 121562380192901),
        ];

        for (input, expected) in cases {
            let got = parse_byte_size(input, "0").unwrap();
            assert_eq!(got, *expected, "parsing {:?}", input);
        }
    }

    #[test]
    fn test_empty_uses_fallback() {
        assert_eq!(parse_byte_size("", "32mb").unwrap(), 32 << 20);
        assert_eq!(parse_byte_size("   \t\r\n", "5mb").unwrap(), 5 << 20);
    }

    #[test]
    fn test_invalid_rejected() {
        assert!(parse_byte_size("12pb", "0").is_err());
        assert!(parse_byte_size("mb", "0").is_err());
        assert!(parse_byte_size("-5mb", "0").is_err());
    }
}
