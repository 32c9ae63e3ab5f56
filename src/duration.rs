/*!
 * Human duration strings such as `7d10h`, `1.5h` or `90s`
 *
 * Units: `ns`, `us` (`µs`, `μs`), `ms`, `s`, `m`, `h`, `d`, `w`, and `y`
 * (365 days). Components may carry a decimal fraction and are summed.
 */

use std::time::Duration;
use thiserror::Error;

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const HOUR: u64 = 3600 * NANOS_PER_SECOND;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("invalid empty duration")]
    Empty,

    #[error("invalid duration {0}")]
    Invalid(String),

    #[error("negative duration {0} is not allowed")]
    Negative(String),

    #[error("missing unit in duration {0}")]
    MissingUnit(String),

    #[error("unknown unit {unit} in duration {input}")]
    UnknownUnit { unit: String, input: String },
}

fn unit_nanos(unit: &str) -> Option<u64> {
    let nanos = match unit {
        "ns" => 1,
        "us" | "µs" | "μs" => 1_000,
        "ms" => 1_000_000,
        "s" => NANOS_PER_SECOND,
        "m" => 60 * NANOS_PER_SECOND,
        "h" => HOUR,
        "d" => DAY,
        "w" => 7 * DAY,
        "y" => 365 * DAY,
        _ => return None,
    };
    Some(nanos)
}

/// Consume leading ASCII digits; `None` on overflow
fn leading_int(s: &str) -> Option<(u64, &str)> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(s.len(), |(i, _)| i);

    let mut value: u64 = 0;
    for b in s[..end].bytes() {
        value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some((value, &s[end..]))
}

/// Parse a duration string
///
/// ```
/// use ferry::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("7d10h").unwrap(), Duration::from_secs(7 * 86400 + 10 * 3600));
/// assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
/// assert!(parse_duration("10x").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    if input.trim().is_empty() {
        return Err(DurationError::Empty);
    }

    let invalid = || DurationError::Invalid(input.to_string());
    let mut s = input;

    if let Some(rest) = s.strip_prefix('-') {
        if rest == "0" {
            return Ok(Duration::ZERO);
        }
        return Err(DurationError::Negative(input.to_string()));
    }
    if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    while !s.is_empty() {
        if !s.starts_with(|c: char| c == '.' || c.is_ascii_digit()) {
            return Err(invalid());
        }

        let before = s.len();
        let (whole, rest) = leading_int(s).ok_or_else(invalid)?;
        s = rest;
        let has_whole = before != s.len();

        let mut fraction = 0u64;
        let mut scale = 1f64;
        let mut has_fraction = false;
        if let Some(rest) = s.strip_prefix('.') {
            let before = rest.len();
            let (digits, rest) = leading_int(rest).ok_or_else(invalid)?;
            s = rest;
            for _ in 0..(before - s.len()) {
                scale *= 10.0;
            }
            fraction = digits;
            has_fraction = before != s.len();
        }
        if !has_whole && !has_fraction {
            return Err(invalid());
        }

        let unit_end = s
            .char_indices()
            .find(|(_, c)| *c == '.' || c.is_ascii_digit())
            .map_or(s.len(), |(i, _)| i);
        if unit_end == 0 {
            return Err(DurationError::MissingUnit(input.to_string()));
        }
        let unit = &s[..unit_end];
        s = &s[unit_end..];

        let unit_value = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit {
            unit: unit.to_string(),
            input: input.to_string(),
        })?;

        let mut component = whole.checked_mul(unit_value).ok_or_else(invalid)?;
        if fraction > 0 {
            let extra = (fraction as f64 * (unit_value as f64 / scale)) as u64;
            component = component.checked_add(extra).ok_or_else(invalid)?;
        }
        total = total.checked_add(component).ok_or_else(invalid)?;
    }

    Ok(Duration::from_nanos(total))
}
