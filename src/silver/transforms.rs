//! Reusable pipeline stages.
//!
//! Each function builds a named [`Stage`] for a transformation that comes up
//! in most pipelines. Stages ignore columns that do not exist, so the same
//! stage list can serve sources with slightly different schemas.

use super::Stage;
use crate::batch::{Batch, Value};
use chrono::NaiveDateTime;
use indexmap::IndexMap;

/// Rename every column to snake_case (`OrderID` → `order_id`,
/// `First Name` → `first_name`).
pub fn normalize_column_names() -> Stage {
    Stage::new("normalize_column_names", |mut batch: Batch| {
        let renames: Vec<(String, String)> = batch
            .column_names()
            .map(|name| (name.to_string(), to_snake_case(name)))
            .filter(|(from, to)| from != to)
            .collect();
        for (from, to) in renames {
            batch.rename_column(&from, &to);
        }
        Ok(batch)
    })
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let chars: Vec<char> = name.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            if !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1);
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                // Acronym end: "HTTPServer" -> "http_server"
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse string columns into timestamps with the given `chrono` format.
/// Non-null values that fail to parse abort the stage.
pub fn cast_timestamps(columns: &[&str], format: &str) -> Stage {
    let columns: Vec<String> = columns.iter().map(|s| s.to_string()).collect();
    let format = format.to_string();
    Stage::new("cast_timestamps", move |mut batch: Batch| {
        for column in &columns {
            if !batch.has_column(column) {
                continue;
            }
            let mut failure = None;
            batch.map_column(column, |value| match value {
                Value::Str(s) => match NaiveDateTime::parse_from_str(s, &format) {
                    Ok(naive) => Value::Timestamp(naive.and_utc()),
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(format!("cannot parse '{s}' in {column}: {e}"));
                        }
                        Value::Null
                    }
                },
                other => other.clone(),
            });
            if let Some(message) = failure {
                return Err(message.into());
            }
        }
        Ok(batch)
    })
}

/// Replace nulls in the given columns with fixed values.
pub fn fill_nulls(fills: IndexMap<String, Value>) -> Stage {
    Stage::new("fill_nulls", move |mut batch: Batch| {
        for (column, replacement) in &fills {
            batch.map_column(column, |value| {
                if value.is_null() {
                    replacement.clone()
                } else {
                    value.clone()
                }
            });
        }
        Ok(batch)
    })
}

/// Drop rows where any of the given columns is null. Columns absent from
/// the batch are skipped.
pub fn filter_required(columns: &[&str]) -> Stage {
    let columns: Vec<String> = columns.iter().map(|s| s.to_string()).collect();
    Stage::new("filter_required", move |batch: Batch| {
        let present: Vec<&str> = columns
            .iter()
            .map(String::as_str)
            .filter(|c| batch.has_column(c))
            .collect();
        if present.is_empty() {
            return Ok(batch);
        }
        Ok(batch.filter(|row| {
            present
                .iter()
                .all(|c| batch.get(c, row).map_or(false, |v| !v.is_null()))
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("OrderID"), "order_id");
        assert_eq!(to_snake_case("firstName"), "first_name");
        assert_eq!(to_snake_case("HTTPServerLog"), "http_server_log");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
        assert_eq!(to_snake_case("First Name"), "first_name");
        assert_eq!(to_snake_case("kebab-case"), "kebab_case");
    }

    #[test]
    fn test_cast_timestamps_parses_and_rejects() {
        let batch = Batch::from_columns(vec![(
            "created",
            vec![Value::Str("2024-01-02 03:04:05".into()), Value::Null],
        )])
        .unwrap();
        let stage = cast_timestamps(&["created"], "%Y-%m-%d %H:%M:%S");
        let out = stage.apply(batch).unwrap();
        assert!(matches!(out.get("created", 0), Some(Value::Timestamp(_))));
        assert_eq!(out.get("created", 1), Some(&Value::Null));

        let bad = Batch::from_columns(vec![("created", vec![Value::Str("nope".into())])]).unwrap();
        let stage = cast_timestamps(&["created"], "%Y-%m-%d %H:%M:%S");
        assert!(stage.apply(bad).is_err());
    }

    #[test]
    fn test_fill_nulls() {
        let batch =
            Batch::from_columns(vec![("n", vec![Value::Null, Value::Int(3)])]).unwrap();
        let stage = fill_nulls(IndexMap::from([("n".to_string(), Value::Int(0))]));
        let out = stage.apply(batch).unwrap();
        assert_eq!(out.get("n", 0), Some(&Value::Int(0)));
        assert_eq!(out.get("n", 1), Some(&Value::Int(3)));
    }

    #[test]
    fn test_filter_required_skips_missing_columns() {
        let batch = Batch::from_columns(vec![(
            "a",
            vec![Value::Int(1), Value::Null],
        )])
        .unwrap();
        let stage = filter_required(&["a", "not_there"]);
        let out = stage.apply(batch).unwrap();
        assert_eq!(out.num_rows(), 1);
    }
}
