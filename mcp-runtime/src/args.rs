//! Tool argument parsing.
//!
//! LLM callers are loose with types: numbers arrive as strings, booleans as
//! `"true"`. Helpers accept the common spellings and reject anything else with
//! a `validation_failed` error naming the field.

use instantly_core::page::Cursor;
use instantly_core::profile::MAX_PAGE_SIZE;
use instantly_core::result::RetrievalMode;
use serde_json::{Map, Value};

use crate::error::ToolError;

pub fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, ToolError> {
    let value = args
        .get(key)
        .ok_or_else(|| ToolError::validation(key, format!("Missing required field '{key}'")))?;
    match value {
        Value::String(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Value::String(_) => Err(ToolError::validation(key, format!("'{key}' must not be empty"))),
        _ => Err(ToolError::validation(key, format!("'{key}' must be a string"))),
    }
}

pub fn arg_optional_string(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.trim().to_string())),
        Some(_) => Err(ToolError::validation(key, format!("'{key}' must be a string"))),
    }
}

pub fn arg_optional_bool(args: &Map<String, Value>, key: &str) -> Result<Option<bool>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(v)) => Ok(Some(*v)),
        Some(Value::String(v)) => match v.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(ToolError::validation(key, format!("'{key}' must be a boolean"))),
        },
        Some(_) => Err(ToolError::validation(key, format!("'{key}' must be a boolean"))),
    }
}

pub fn arg_optional_i64(args: &Map<String, Value>, key: &str) -> Result<Option<i64>, ToolError> {
    let invalid = || ToolError::validation(key, format!("'{key}' must be an integer"));
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(invalid),
        Some(Value::String(v)) => v.trim().parse::<i64>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

pub fn arg_optional_string_array(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, ToolError> {
    let Some(value) = args.get(key) else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        // a single comma-separated string is accepted too
        Value::String(text) => Ok(Some(
            text.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let text = item.as_str().ok_or_else(|| {
                    ToolError::validation(key, format!("'{key}' items must be strings"))
                })?;
                let normalized = text.trim();
                if !normalized.is_empty() {
                    out.push(normalized.to_string());
                }
            }
            Ok(Some(out))
        }
        _ => Err(ToolError::validation(
            key,
            format!("'{key}' must be an array of strings"),
        )),
    }
}

pub fn arg_starting_after(args: &Map<String, Value>) -> Result<Option<Cursor>, ToolError> {
    Ok(arg_optional_string(args, "starting_after")?.and_then(Cursor::new))
}

/// Interprets `limit` and `get_all`.
///
/// - `get_all: true`, `limit: "all"` or a `limit` above the page maximum
///   request a complete retrieval
/// - `limit` in 1..=100 requests one page of that size
/// - `get_all: false` forces a single page even for oversized limits
/// - no arguments: one full page
pub fn retrieval_mode_from_args(args: &Map<String, Value>) -> Result<RetrievalMode, ToolError> {
    let get_all = arg_optional_bool(args, "get_all")?;
    let limit = parse_limit(args)?;

    let mode = match (get_all, limit) {
        (Some(true), _) => RetrievalMode::CompleteRetrieval,
        (Some(false), Some(Limit::All)) | (Some(false), None) => RetrievalMode::SinglePage {
            limit: MAX_PAGE_SIZE,
        },
        (Some(false), Some(Limit::Count(n))) => RetrievalMode::SinglePage {
            limit: n.min(MAX_PAGE_SIZE as u64) as u32,
        },
        (None, Some(Limit::All)) => RetrievalMode::CompleteRetrieval,
        (None, Some(Limit::Count(n))) if n > MAX_PAGE_SIZE as u64 => {
            RetrievalMode::CompleteRetrieval
        }
        (None, Some(Limit::Count(n))) => RetrievalMode::SinglePage { limit: n as u32 },
        (None, None) => RetrievalMode::SinglePage {
            limit: MAX_PAGE_SIZE,
        },
    };
    Ok(mode)
}

enum Limit {
    All,
    Count(u64),
}

fn parse_limit(args: &Map<String, Value>) -> Result<Option<Limit>, ToolError> {
    let invalid = || {
        ToolError::validation(
            "limit",
            "'limit' must be a positive integer or \"all\"",
        )
        .with_docs_hint("Use limit 1-100 for one page, or get_all=true for a complete retrieval.")
    };
    let count = match args.get("limit") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(invalid)?,
        Some(Value::String(raw)) => {
            let raw = raw.trim();
            if raw.eq_ignore_ascii_case("all") {
                return Ok(Some(Limit::All));
            }
            raw.parse::<u64>().map_err(|_| invalid())?
        }
        Some(_) => return Err(invalid()),
    };
    if count == 0 {
        return Err(invalid());
    }
    Ok(Some(Limit::Count(count)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn default_mode_is_one_full_page() {
        assert_eq!(
            retrieval_mode_from_args(&Map::new()).unwrap(),
            RetrievalMode::SinglePage { limit: 100 }
        );
    }

    #[test]
    fn complete_retrieval_triggers() {
        for value in [
            json!({"get_all": true}),
            json!({"get_all": "true"}),
            json!({"limit": "all"}),
            json!({"limit": "ALL"}),
            json!({"limit": 5000}),
            json!({"limit": "250"}),
            json!({"get_all": true, "limit": 10}),
        ] {
            assert_eq!(
                retrieval_mode_from_args(&args(value.clone())).unwrap(),
                RetrievalMode::CompleteRetrieval,
                "{value}"
            );
        }
    }

    #[test]
    fn explicit_limits_select_single_page() {
        assert_eq!(
            retrieval_mode_from_args(&args(json!({"limit": 25}))).unwrap(),
            RetrievalMode::SinglePage { limit: 25 }
        );
        assert_eq!(
            retrieval_mode_from_args(&args(json!({"limit": "100"}))).unwrap(),
            RetrievalMode::SinglePage { limit: 100 }
        );
        assert_eq!(
            retrieval_mode_from_args(&args(json!({"limit": 5000, "get_all": false}))).unwrap(),
            RetrievalMode::SinglePage { limit: 100 }
        );
    }

    #[test]
    fn invalid_limits_are_rejected() {
        for value in [
            json!({"limit": 0}),
            json!({"limit": -3}),
            json!({"limit": "lots"}),
            json!({"limit": 2.5}),
            json!({"limit": true}),
        ] {
            let err = retrieval_mode_from_args(&args(value)).unwrap_err();
            assert_eq!(err.code, "validation_failed");
            assert_eq!(err.field.as_deref(), Some("limit"));
        }
        let err = retrieval_mode_from_args(&args(json!({"get_all": "maybe"}))).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("get_all"));
    }

    #[test]
    fn string_helpers_trim_and_validate() {
        let a = args(json!({"id": "  abc ", "blank": " ", "num": 3}));
        assert_eq!(required_string(&a, "id").unwrap(), "abc");
        assert!(required_string(&a, "blank").is_err());
        assert!(required_string(&a, "missing").is_err());
        assert_eq!(arg_optional_string(&a, "blank").unwrap(), None);
        assert!(arg_optional_string(&a, "num").is_err());
    }

    #[test]
    fn string_arrays_accept_lists_and_csv() {
        let a = args(json!({"list": ["a", " b ", ""], "csv": "x, y", "bad": [1]}));
        assert_eq!(
            arg_optional_string_array(&a, "list").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            arg_optional_string_array(&a, "csv").unwrap(),
            Some(vec!["x".to_string(), "y".to_string()])
        );
        assert!(arg_optional_string_array(&a, "bad").is_err());
    }

    #[test]
    fn integers_accept_numeric_strings() {
        let a = args(json!({"status": "1", "other": -1, "bad": "x"}));
        assert_eq!(arg_optional_i64(&a, "status").unwrap(), Some(1));
        assert_eq!(arg_optional_i64(&a, "other").unwrap(), Some(-1));
        assert!(arg_optional_i64(&a, "bad").is_err());
    }

    #[test]
    fn blank_cursor_is_absent() {
        assert_eq!(arg_starting_after(&args(json!({"starting_after": ""}))).unwrap(), None);
        assert_eq!(
            arg_starting_after(&args(json!({"starting_after": "c1"}))).unwrap(),
            Cursor::new("c1")
        );
    }
}
