//! Human-readable durations
//!
//! Configuration files express every interval as a short string
//! (`"250ms"`, `"90s"`, `"15m"`, `"6h"`, `"5d"`). This module parses those
//! strings, formats durations back for logs and API payloads, and provides
//! the serde adapter used by the config structs.

use crate::{Error, Result};
use std::time::Duration;

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 3_600;
const SECS_PER_DAY: u64 = 86_400;

/// Parse a human-readable duration.
///
/// Accepts an unsigned integer followed by one of `ms`, `s`, `m`, `h`, `d`.
/// A bare integer is read as seconds.
///
/// # Examples
///
/// ```
/// use sigscan_common::human_time::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
/// assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
/// ```
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("empty duration".to_string()));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration '{}'", input)))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(SECS_PER_MINUTE)),
        "h" => Duration::from_secs(value.saturating_mul(SECS_PER_HOUR)),
        "d" => Duration::from_secs(value.saturating_mul(SECS_PER_DAY)),
        other => {
            return Err(Error::Config(format!(
                "unknown duration unit '{}' in '{}'",
                other, input
            )))
        }
    };

    Ok(duration)
}

/// Format a duration using the largest unit that divides it exactly.
///
/// Output is always accepted by [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1_000 != 0 {
        return format!("{}ms", millis);
    }

    let secs = duration.as_secs();
    if secs == 0 {
        "0s".to_string()
    } else if secs % SECS_PER_DAY == 0 {
        format!("{}d", secs / SECS_PER_DAY)
    } else if secs % SECS_PER_HOUR == 0 {
        format!("{}h", secs / SECS_PER_HOUR)
    } else if secs % SECS_PER_MINUTE == 0 {
        format!("{}m", secs / SECS_PER_MINUTE)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for `Duration` fields written as human-readable strings.
///
/// Integers are accepted on input and read as seconds.
///
/// ```ignore
/// #[serde(with = "sigscan_common::human_time::serde_duration")]
/// pub deadline: Duration,
/// ```
pub mod serde_duration {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> de::Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration such as \"250ms\", \"90s\" or \"15m\"")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
                parse_duration(value).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
                u64::try_from(value)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("duration must not be negative"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Serde adapter for lists of human-readable durations.
pub mod serde_duration_vec {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        durations
            .iter()
            .map(|d| format_duration(*d))
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| parse_duration(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("0ms").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("750ms").unwrap(), Duration::from_millis(750));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("5d").unwrap(), Duration::from_secs(432_000));
        assert_eq!(parse_duration(" 12 ").unwrap(), Duration::from_secs(12));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn test_format_picks_largest_exact_unit() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(900)), "15m");
        assert_eq!(format_duration(Duration::from_secs(7_200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(86_400 * 20)), "20d");
    }

    #[test]
    fn test_serde_adapter_accepts_strings_and_integers() {
        #[derive(serde::Deserialize, serde::Serialize)]
        struct Holder {
            #[serde(with = "serde_duration")]
            ttl: Duration,
        }

        let from_str: Holder = toml::from_str("ttl = \"15m\"").unwrap();
        assert_eq!(from_str.ttl, Duration::from_secs(900));

        let from_int: Holder = toml::from_str("ttl = 30").unwrap();
        assert_eq!(from_int.ttl, Duration::from_secs(30));

        let written = toml::to_string(&from_str).unwrap();
        assert!(written.contains("\"15m\""));
    }
}
