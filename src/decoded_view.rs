//! Renders the `?decode=true` view: the header and body JSON of a claim,
//! pretty-printed, with embedded activation tokens expanded in place and
//! every `iat`/`exp` timestamp annotated with an ISO date, followed by the
//! raw signature segment.

use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE64URL_NOPAD;
use serde_json::Value;

use crate::error::ResolverError;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

pub fn render(encoded: &str) -> Result<String, ResolverError> {
    let segments: Vec<&str> = encoded.split('.').collect();
    let [header_seg, body_seg, sig_seg] = segments[..] else {
        return Err(ResolverError::Malformed(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    };

    let header: Value = decode_segment(header_seg)?;
    let mut body: Value = decode_segment(body_seg)?;
    expand_tokens(&mut body);

    let pretty_header = serde_json::to_string_pretty(&header)
        .map_err(|err| ResolverError::Malformed(err.to_string()))?;
    let pretty_body = serde_json::to_string_pretty(&body)
        .map_err(|err| ResolverError::Malformed(err.to_string()))?;
    let annotated_body = annotate_dates(&pretty_body);

    Ok(format!("{pretty_header}\n{annotated_body}\n{sig_seg}"))
}

fn decode_segment(segment: &str) -> Result<Value, ResolverError> {
    let bytes = BASE64URL_NOPAD
        .decode(segment.as_bytes())
        .map_err(|err| ResolverError::Malformed(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| ResolverError::Malformed(err.to_string()))
}

/// Walks the JSON tree and replaces any `"token": "<encoded-claim>"` value
/// with its decoded body, recursively, so a nested activation token reads
/// as an inline object rather than an opaque encoded string.
fn expand_tokens(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(token)) = map.get("token").cloned() {
                if let Ok(mut decoded) = decode_token_body(&token) {
                    expand_tokens(&mut decoded);
                    map.insert("token".to_string(), decoded);
                }
            }
            for (_, v) in map.iter_mut() {
                expand_tokens(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_tokens(item);
            }
        }
        _ => {}
    }
}

fn decode_token_body(encoded: &str) -> Result<Value, ()> {
    let segments: Vec<&str> = encoded.split('.').collect();
    if segments.len() != 3 {
        return Err(());
    }
    decode_segment(segments[1]).map_err(|_| ())
}

/// Appends ` (YYYY-MM-DD, in 3h)`-style annotation after the numeric value
/// on any line shaped like `"iat": 1700000000` or `"exp": 0`, preserving a
/// trailing comma if present. Intentionally a text pass over the
/// pretty-printed JSON rather than a `Value` transform, since the
/// annotation isn't valid JSON.
fn annotate_dates(pretty: &str) -> String {
    pretty
        .lines()
        .map(annotate_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn annotate_line(line: &str) -> String {
    for key in ["\"iat\"", "\"exp\""] {
        let Some(key_pos) = line.find(key) else {
            continue;
        };
        let after_key = &line[key_pos + key.len()..];
        let Some(colon_pos) = after_key.find(':') else {
            continue;
        };
        let after_colon = &after_key[colon_pos + 1..];
        let trimmed = after_colon.trim_start();
        let leading_ws = after_colon.len() - trimmed.len();
        let digits_len = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits_len == 0 {
            continue;
        }
        let Ok(seconds) = trimmed[..digits_len].parse::<i64>() else {
            continue;
        };
        let rest = &trimmed[digits_len..];
        let value_start = key_pos + key.len() + colon_pos + 1 + leading_ws;
        let mut out = String::with_capacity(line.len() + 32);
        out.push_str(&line[..value_start]);
        out.push_str(&trimmed[..digits_len]);
        if seconds == 0 {
            out.push_str(" (never)");
        } else {
            let relative = claimsrv_claims::human_relative(now(), seconds as u64);
            out.push_str(&format!(" ({}, {relative})", iso_date(seconds)));
        }
        out.push_str(rest);
        return out;
    }
    line.to_string()
}

/// Formats a unix timestamp as `YYYY-MM-DD` (UTC). Callers treat `0`
/// specially as "never expires" before reaching here.
fn iso_date(unix_secs: i64) -> String {
    let days = unix_secs.div_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    format!("{year:04}-{month:02}-{day:02}")
}

/// Howard Hinnant's `civil_from_days`: days since the unix epoch to a
/// proleptic Gregorian (year, month, day), valid over the full `i64` range.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn iso_date_formats_known_timestamp() {
        // 2024-01-01T00:00:00Z
        assert_eq!(iso_date(1_704_067_200), "2024-01-01");
    }

    #[test]
    fn annotate_line_appends_date_before_comma() {
        let annotated = annotate_line("  \"iat\": 1704067200,");
        assert!(annotated.starts_with("  \"iat\": 1704067200 (2024-01-01, "));
        assert!(annotated.ends_with("),"));
    }

    #[test]
    fn annotate_line_marks_zero_as_never() {
        let annotated = annotate_line("  \"exp\": 0");
        assert_eq!(annotated, "  \"exp\": 0 (never)");
    }

    #[test]
    fn annotate_line_leaves_unrelated_lines_untouched() {
        assert_eq!(annotate_line("  \"sub\": \"ABCDEF\","), "  \"sub\": \"ABCDEF\",");
    }
}
