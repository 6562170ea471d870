//! Utils for serialization and deserialization of nested config fields into simple types.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Deserializes float seconds to duration object.
pub fn deserialize_float_seconds_to_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: f64 = Deserialize::deserialize(de)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

/// Serializes a duration object to float seconds.
pub fn serialize_duration_to_float_seconds<S>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Parses durations as they are written in chain configurations: a sequence of decimal numbers,
/// each with a unit out of `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`, e.g. `30s`, `1.5s`,
/// `1m30s` or `1h2m3.5s`. A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    if raw.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return parse_amount(raw, raw);
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let unit_start =
            rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        let (amount, tail) = rest.split_at(unit_start);
        let unit_end = tail.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        if unit.is_empty() {
            return Err(format!("missing unit in {raw:?}"));
        }
        let amount = parse_amount(amount, raw)?;
        let part = match unit {
            "h" => amount.checked_mul(3_600),
            "m" => amount.checked_mul(60),
            "s" => Some(amount),
            "ms" => Some(amount / 1_000),
            "us" | "µs" => Some(amount / 1_000_000),
            "ns" => Some(amount / 1_000_000_000),
            _ => return Err(format!("unknown unit {unit:?} in {raw:?}")),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("duration {raw:?} overflows"))?;
        rest = tail;
    }
    Ok(total)
}

/// Reads a decimal amount as a number of seconds.
fn parse_amount(amount: &str, raw: &str) -> Result<Duration, String> {
    let secs: f64 = amount.parse().map_err(|_| format!("invalid amount in {raw:?}"))?;
    Duration::try_from_secs_f64(secs).map_err(|err| err.to_string())
}
