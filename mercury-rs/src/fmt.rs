//! Provides helpers to parse and format the sizes and durations used in the configuration.
//!
//! Operators specify values like `512m` or `30s` in **settings.yml**. The parsers defined here
//! turn these into bytes or a [Duration]. The formatters produce the same notation for log
//! messages and the stats endpoint.
use std::fmt::Write;
use std::time::Duration;

const SIZE_UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

const DURATION_UNITS: [(u128, &str); 5] = [
    (1000 * 60 * 60 * 24, "d"),
    (1000 * 60 * 60, "h"),
    (1000 * 60, "m"),
    (1000, "s"),
    (1, "ms"),
];

/// Formats a given size in bytes using the most concise binary unit.
///
/// # Examples
///
/// ```
/// assert_eq!(mercury::fmt::format_size(0), "0 bytes");
/// assert_eq!(mercury::fmt::format_size(1), "1 byte");
/// assert_eq!(mercury::fmt::format_size(300), "300 bytes");
/// assert_eq!(mercury::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(mercury::fmt::format_size(87_340_000), "83.3 MiB");
/// assert_eq!(mercury::fmt::format_size(256 * 1024 * 1024), "256 MiB");
/// assert_eq!(mercury::fmt::format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    match size_in_bytes {
        1 => return "1 byte".to_owned(),
        0..=1023 => return format!("{} bytes", size_in_bytes),
        _ => (),
    }

    let mut size = size_in_bytes as f64 / 1024.;
    let mut unit = 0;
    while size >= 1024. && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.;
        unit += 1;
    }

    if size < 10. {
        format!("{:.2} {}", size, SIZE_UNITS[unit])
    } else if size < 100. {
        format!("{:.1} {}", size, SIZE_UNITS[unit])
    } else {
        format!("{:.0} {}", size, SIZE_UNITS[unit])
    }
}

/// Parses a size like **512m** into a number of bytes.
///
/// The number can be followed by one of the following (case-insensitive) suffixes:
/// * **b**: bytes (same as no suffix)
/// * **k**: KiB (1024 bytes)
/// * **m**: MiB
/// * **g**: GiB
/// * **t**: TiB
///
/// # Examples
///
/// ```
/// assert_eq!(mercury::fmt::parse_size("100").unwrap(), 100);
/// assert_eq!(mercury::fmt::parse_size("100b").unwrap(), 100);
/// assert_eq!(mercury::fmt::parse_size("8k").unwrap(), 8192);
/// assert_eq!(mercury::fmt::parse_size("256 M").unwrap(), 256 * 1024 * 1024);
/// assert_eq!(mercury::fmt::parse_size("1g").unwrap(), 1024 * 1024 * 1024);
///
/// assert_eq!(mercury::fmt::parse_size("3 Y").is_err(), true);
/// assert_eq!(mercury::fmt::parse_size("1.5g").is_err(), true);
/// assert_eq!(mercury::fmt::parse_size("-1").is_err(), true);
/// ```
pub fn parse_size(value: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref SIZE: regex::Regex =
            regex::Regex::new(r"^\s*(\d+)\s*([bBkKmMgGtT]?)\s*$").unwrap();
    }

    let value = value.as_ref();
    let captures = SIZE.captures(value).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a size. Expected a positive number and optionally \
             'b', 'k', 'm', 'g' or 't' as suffix.",
            value
        )
    })?;

    let number = captures[1]
        .parse::<usize>()
        .map_err(|_| anyhow::anyhow!("The size '{}' is too large.", value))?;
    let factor: usize = match captures[2].to_ascii_lowercase().as_str() {
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => 1,
    };

    number
        .checked_mul(factor)
        .ok_or_else(|| anyhow::anyhow!("The size '{}' is too large.", value))
}

/// Parses a duration like **30s** or **5m**.
///
/// The number can be followed by one of the following (case-insensitive) suffixes:
/// * **ms**: milliseconds (same as no suffix)
/// * **s**: seconds
/// * **m**: minutes
/// * **h**: hours
/// * **d**: days
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(mercury::fmt::parse_duration("250").unwrap(), Duration::from_millis(250));
/// assert_eq!(mercury::fmt::parse_duration("100 ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(mercury::fmt::parse_duration("30s").unwrap(), Duration::from_secs(30));
/// assert_eq!(mercury::fmt::parse_duration("5M").unwrap(), Duration::from_secs(300));
/// assert_eq!(mercury::fmt::parse_duration("2h").unwrap(), Duration::from_secs(7200));
/// assert_eq!(mercury::fmt::parse_duration("1d").unwrap(), Duration::from_secs(86400));
///
/// assert_eq!(mercury::fmt::parse_duration("3 weeks").is_err(), true);
/// assert_eq!(mercury::fmt::parse_duration("1.5s").is_err(), true);
/// ```
pub fn parse_duration(value: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref DURATION: regex::Regex =
            regex::Regex::new(r"^\s*(\d+)\s*((?i)ms|s|m|h|d)?\s*$").unwrap();
    }

    let value = value.as_ref();
    let captures = DURATION.captures(value).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. Expected a positive number and optionally \
             'ms', 's', 'm', 'h' or 'd' as suffix.",
            value
        )
    })?;

    let number = captures[1]
        .parse::<u64>()
        .map_err(|_| anyhow::anyhow!("The duration '{}' is too large.", value))?;
    let unit = captures
        .get(2)
        .map(|unit| unit.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let seconds = match unit.as_str() {
        "" | "ms" => return Ok(Duration::from_millis(number)),
        "s" => Some(number),
        "m" => number.checked_mul(60),
        "h" => number.checked_mul(60 * 60),
        _ => number.checked_mul(60 * 60 * 24),
    };

    seconds
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("The duration '{}' is too large.", value))
}

/// Formats a duration like "1h 2m 3s".
///
/// Units which are zero are omitted. A zero duration is formatted as "0ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(mercury::fmt::format_duration(Duration::ZERO), "0ms");
/// assert_eq!(mercury::fmt::format_duration(Duration::from_millis(1013)), "1s 13ms");
/// assert_eq!(mercury::fmt::format_duration(Duration::from_secs(300)), "5m");
/// assert_eq!(mercury::fmt::format_duration(Duration::from_secs(3600 + 59)), "1h 59s");
/// assert_eq!(mercury::fmt::format_duration(Duration::from_secs(86400 + 3600 + 60)), "1d 1h 1m");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut remaining = duration.as_millis();
    if remaining == 0 {
        return "0ms".to_owned();
    }

    let mut result = String::new();
    for (millis, unit) in DURATION_UNITS {
        let amount = remaining / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            remaining %= millis;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use crate::fmt::{format_duration, parse_duration, parse_size};
    use std::time::Duration;

    #[test]
    fn overflows_are_reported_as_errors() {
        assert!(parse_size("99999999999999999999").is_err());
        assert!(parse_size("99999999999t").is_err());
        assert!(parse_duration("999999999999999999d").is_err());
    }

    #[test]
    fn formatted_durations_can_be_parsed_per_unit() {
        for value in ["5d", "3h", "17m", "2s", "12ms"] {
            assert_eq!(format_duration(parse_duration(value).unwrap()), value);
        }
        assert_eq!(
            parse_duration(" 10 S ").unwrap(),
            Duration::from_secs(10)
        );
    }
}
