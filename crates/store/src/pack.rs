use crate::StoreError;

/// One `key|encoded` line of the bulk-transfer pack format.
#[derive(Debug)]
pub struct PackEntry {
    pub key: String,
    pub encoded: String,
}

/// Serializes entries into the newline-delimited pack format. Entries past
/// `max` are dropped (caller picks which `max` entries to pass in); `max < 0`
/// means unlimited, in which case every passed entry is written.
pub fn encode(entries: &[(String, String)], max: i64) -> String {
    let limit = if max < 0 {
        entries.len()
    } else {
        entries.len().min(max as usize)
    };
    entries[..limit]
        .iter()
        .map(|(key, encoded)| format!("{key}|{encoded}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses a pack body into `(key, encoded)` pairs. Blank lines are ignored;
/// a line without exactly one `|` separator aborts the whole merge.
pub fn decode(body: &str) -> Result<Vec<PackEntry>, StoreError> {
    let mut out = Vec::new();
    for line in body.lines() {
        if line.is_empty() {
            continue;
        }
        if line.matches('|').count() != 1 {
            return Err(bad_line(line));
        }
        let (key, encoded) = line.split_once('|').ok_or_else(|| bad_line(line))?;
        out.push(PackEntry {
            key: key.to_string(),
            encoded: encoded.to_string(),
        });
    }
    Ok(out)
}

fn bad_line(line: &str) -> StoreError {
    StoreError::Format(format!("expected exactly one '|' in line: {line:?}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_entries() {
        let entries = vec![
            ("a".to_string(), "enc-a".to_string()),
            ("b".to_string(), "enc-b".to_string()),
        ];
        let packed = encode(&entries, -1);
        let decoded = decode(&packed).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].key, "a");
        assert_eq!(decoded[1].encoded, "enc-b");
    }

    #[test]
    fn max_bounds_entry_count() {
        let entries = vec![
            ("a".to_string(), "enc-a".to_string()),
            ("b".to_string(), "enc-b".to_string()),
            ("c".to_string(), "enc-c".to_string()),
        ];
        let packed = encode(&entries, 2);
        let decoded = decode(&packed).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let decoded = decode("a|enc-a\n\nb|enc-b\n").unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn missing_separator_is_a_format_error() {
        let err = decode("no-separator-here").unwrap_err();
        assert!(matches!(err, StoreError::Format(_)));
    }

    #[test]
    fn extra_separator_is_a_format_error() {
        let err = decode("a|enc|extra").unwrap_err();
        assert!(matches!(err, StoreError::Format(_)));
    }
}
