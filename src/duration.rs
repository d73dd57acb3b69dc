//! Human-readable durations for config files and CLI flags ("1h", "30s", "500ms").

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serializer};

const SECS_PER_DAY: u64 = 24 * 60 * 60;
const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_MINUTE: u64 = 60;

/// Parse a duration string like "1d", "1h", "30m", "15s" or "500ms".
///
/// Input is case-insensitive and surrounding whitespace is ignored.
///
/// ```
/// use kurabak::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num, unit_millis): (&str, u64) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('d') {
        (num, SECS_PER_DAY * 1000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, SECS_PER_HOUR * 1000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, SECS_PER_MINUTE * 1000)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1000)
    } else {
        anyhow::bail!("Duration must end with d, h, m, s or ms");
    };

    let num: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("Invalid number in duration: {s}"))?;
    let millis = num
        .checked_mul(unit_millis)
        .context("Duration is too large")?;

    Ok(Duration::from_millis(millis))
}

/// Format a duration using the largest unit that divides it evenly.
///
/// Sub-second remainders are written as milliseconds; anything else that does not
/// divide evenly falls back to whole seconds.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 && d.as_secs() < SECS_PER_MINUTE {
        return format!("{}ms", d.as_millis());
    }

    let secs = d.as_secs();
    if secs >= SECS_PER_DAY && secs % SECS_PER_DAY == 0 {
        format!("{}d", secs / SECS_PER_DAY)
    } else if secs >= SECS_PER_HOUR && secs % SECS_PER_HOUR == 0 {
        format!("{}h", secs / SECS_PER_HOUR)
    } else if secs >= SECS_PER_MINUTE && secs % SECS_PER_MINUTE == 0 {
        format!("{}m", secs / SECS_PER_MINUTE)
    } else {
        format!("{secs}s")
    }
}

/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

/// Writes a duration back in the same notation [`deserialize_duration`] reads.
pub fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}
