use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One upstream record. Opaque to the pagination core: it is accumulated and
/// returned verbatim, never inspected.
pub type Record = Value;

/// Field names that may carry the next-page cursor, in lookup order.
/// The upstream API uses `next_starting_after`; the others show up in older
/// endpoints and proxies.
const CURSOR_FIELDS: [&str; 4] = [
    "next_starting_after",
    "next_cursor",
    "nextCursor",
    "nextStartingAfter",
];

/// Field names that may hold the page's item sequence, in lookup order.
const ITEM_FIELDS: [&str; 2] = ["items", "data"];

/// Max characters of the raw payload kept on a [`MalformedResponse`].
const MALFORMED_PREVIEW_MAX_CHARS: usize = 512;

/// Opaque upstream continuation token.
///
/// A cursor is only meaningful for the exact filter set it was issued under.
/// Resuming with different filters is undefined upstream behaviour and is not
/// checked here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Returns `None` for empty or whitespace-only tokens.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One normalized upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Record>,
    pub next_cursor: Option<Cursor>,
}

impl Page {
    /// True when the upstream signalled there is nothing after this page.
    /// Page size is ignored: short pages can occur mid-sequence.
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// The upstream payload matched none of the known list shapes.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("upstream list response has an unrecognized shape ({shape})")]
pub struct MalformedResponse {
    /// Short description of what was received (`null`, `string`, `object without items/data`, ...)
    pub shape: &'static str,
    /// The raw payload, kept for diagnostics
    pub payload: Value,
}

impl MalformedResponse {
    fn new(shape: &'static str, payload: &Value) -> Self {
        Self {
            shape,
            payload: payload.clone(),
        }
    }

    /// Payload rendered for error details, truncated to keep tool envelopes small.
    pub fn payload_preview(&self) -> String {
        let rendered = self.payload.to_string();
        if rendered.chars().count() <= MALFORMED_PREVIEW_MAX_CHARS {
            return rendered;
        }
        let mut preview: String = rendered.chars().take(MALFORMED_PREVIEW_MAX_CHARS).collect();
        preview.push('…');
        preview
    }
}

/// Turns any of the upstream list-response shapes into a [`Page`]:
///
/// - a bare array: all items, no cursor
/// - `{ "items": [...], "next_starting_after": "..." }`
/// - `{ "data": [...], "next_starting_after": "..." }`
pub fn normalize(raw: &Value) -> Result<Page, MalformedResponse> {
    match raw {
        Value::Array(items) => Ok(Page {
            items: items.clone(),
            next_cursor: None,
        }),
        Value::Object(map) => {
            let items = ITEM_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_array))
                .ok_or_else(|| MalformedResponse::new("object without items/data array", raw))?;
            let next_cursor = CURSOR_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(cursor_from_value));
            Ok(Page {
                items: items.clone(),
                next_cursor,
            })
        }
        Value::Null => Err(MalformedResponse::new("null", raw)),
        Value::String(_) => Err(MalformedResponse::new("string", raw)),
        Value::Number(_) => Err(MalformedResponse::new("number", raw)),
        Value::Bool(_) => Err(MalformedResponse::new("boolean", raw)),
    }
}

fn cursor_from_value(value: &Value) -> Option<Cursor> {
    match value {
        Value::String(raw) => Cursor::new(raw.as_str()),
        Value::Number(n) => Cursor::new(n.to_string()),
        _ => None,
    }
}
