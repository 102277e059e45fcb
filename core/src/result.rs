use serde::{Deserialize, Serialize};

use crate::page::{Cursor, Record};

/// Why a retrieval stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The upstream issued no further cursor.
    Exhausted,
    /// The profile's page ceiling was reached.
    MaxPages,
    /// The soft time budget ran out before the next fetch.
    Timeout,
    /// A page fetch failed unrecoverably.
    Error,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Exhausted => "exhausted",
            StopReason::MaxPages => "max_pages",
            StopReason::Timeout => "timeout",
            StopReason::Error => "error",
        }
    }

    /// Budget stops leave more data upstream; exhaustion does not.
    pub fn is_budget_stop(self) -> bool {
        matches!(self, StopReason::MaxPages | StopReason::Timeout)
    }
}

/// What the caller asked for, after the tool layer has interpreted its loose
/// arguments (`get_all`, `limit: "all"`, oversized `limit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    SinglePage { limit: u32 },
    CompleteRetrieval,
}

/// Pagination metadata attached to every list result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationInfo {
    pub returned_count: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub stopped_reason: StopReason,
    pub pages_fetched: u32,
    pub elapsed_ms: u64,
    pub client_profile: String,
}

/// The external-facing output of one list tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub data: Vec<Record>,
    pub pagination: PaginationInfo,
}
