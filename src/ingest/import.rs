//! File import for collector exports (JSON array or JSON lines).

use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use super::{RawReading, WideRecord};
use crate::error::Result;

/// Read raw readings from `path`.
///
/// Both narrow records (`metric_name` + `value`) and wide per-animal rows
/// (`temperature`, `heart_rate`, ...) are accepted, mixed freely. Lines that
/// are not JSON objects are skipped with a warning; field-level problems are
/// left for the normalizer to reject, except fields whose JSON type cannot
/// be held at all (e.g. a numeric `farm_id`), which skip the record.
pub fn read_file(path: &Path) -> Result<Vec<RawReading>> {
    let content = std::fs::read_to_string(path)?;
    let raws = parse_str(&content)?;
    info!(path = %path.display(), records = raws.len(), "imported raw readings");
    Ok(raws)
}

pub fn parse_str(content: &str) -> Result<Vec<RawReading>> {
    let trimmed = content.trim_start();
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        let mut values = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(v) => values.push(v),
                Err(e) => warn!(line = line_no + 1, error = %e, "skipping unparsable line"),
            }
        }
        values
    };

    let mut raws = Vec::with_capacity(values.len());
    for value in values {
        let Some(object) = value.as_object() else {
            warn!("skipping non-object record");
            continue;
        };
        let narrow = object.contains_key("metric_name") || object.contains_key("metric");
        let parsed = if narrow {
            serde_json::from_value::<RawReading>(value).map(|r| vec![r])
        } else {
            serde_json::from_value::<WideRecord>(value).map(WideRecord::explode)
        };
        match parsed {
            Ok(batch) => raws.extend(batch),
            Err(e) => warn!(error = %e, "skipping record with mistyped fields"),
        }
    }
    Ok(raws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_lines_mixed_shapes() {
        let content = r#"
{"animal_id": "A1", "farm_id": "f1", "timestamp": "2024-01-01T00:00:00Z", "metric_name": "temperature", "value": 38.4}
not json at all
{"tag_id": "A2", "farm_id": "f1", "date": "2024-01-01", "temperature": 38.9, "heart_rate": 71}
"#;
        let raws = parse_str(content).unwrap();
        assert_eq!(raws.len(), 3);
        assert_eq!(raws[0].animal_id.as_deref(), Some("A1"));
        assert_eq!(raws[2].metric_name.as_deref(), Some("heart_rate"));
    }

    #[test]
    fn test_parse_json_array() {
        let content = r#"[
            {"animal_id": "A1", "farm_id": "f1", "timestamp": "2024-01-01", "metric": "activity_level", "value": "1.1"},
            42
        ]"#;
        let raws = parse_str(content).unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].metric_name.as_deref(), Some("activity_level"));
    }

    #[test]
    fn test_read_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("readings.jsonl");
        std::fs::write(
            &path,
            "{\"animal_id\":\"A1\",\"farm_id\":\"f1\",\"timestamp\":\"2024-01-01\",\"metric_name\":\"temperature\",\"value\":38.5}\n",
        )
        .unwrap();
        assert_eq!(read_file(&path).unwrap().len(), 1);
    }
}
