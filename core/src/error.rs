use serde::{Deserialize, Serialize};

/// Structured error payload for agents.
/// Every error carries enough information for an agent to decide whether to
/// fix its arguments, retry later, or resume from a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code (see [`codes`])
    pub error: String,
    /// Human/agent-readable description of what went wrong
    pub message: String,
    /// Which argument caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
    /// Additional machine-readable context (status codes, attempts, partial counts)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error codes used across the tool surface
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const UNKNOWN_TOOL: &str = "unknown_tool";
    pub const AUTH_MISSING: &str = "auth_missing";
    pub const INVALID_URL: &str = "invalid_url";
    pub const MALFORMED_RESPONSE: &str = "malformed_response";
    pub const UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
    pub const UPSTREAM_REJECTED: &str = "upstream_rejected";
    pub const INTERNAL_ERROR: &str = "internal_error";
}
