use instantly_core::error::{ErrorPayload, codes};
use instantly_core::page::MalformedResponse;
use serde_json::{Value, json};
use thiserror::Error;

use crate::upstream::{UpstreamError, body_preview};

/// Unrecoverable failure of one page fetch, after retries.
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    MalformedResponse(#[from] MalformedResponse),
    #[error("Instantly API unavailable after {attempts} attempt(s): {message}")]
    UpstreamUnavailable {
        attempts: u32,
        status: Option<u16>,
        message: String,
    },
    #[error("{message}")]
    UpstreamRejected {
        status: Option<u16>,
        message: String,
        body: Option<Value>,
    },
}

impl RetrievalError {
    pub fn unavailable(attempts: u32, last: &UpstreamError) -> Self {
        let message = match last.body() {
            Some(body) if !body.is_null() => format!("{last}: {}", body_preview(body)),
            _ => last.to_string(),
        };
        RetrievalError::UpstreamUnavailable {
            attempts,
            status: last.status(),
            message,
        }
    }

    pub fn rejected(err: UpstreamError) -> Self {
        RetrievalError::UpstreamRejected {
            status: err.status(),
            message: err.to_string(),
            body: err.body().cloned(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::MalformedResponse(_) => codes::MALFORMED_RESPONSE,
            RetrievalError::UpstreamUnavailable { .. } => codes::UPSTREAM_UNAVAILABLE,
            RetrievalError::UpstreamRejected { .. } => codes::UPSTREAM_REJECTED,
        }
    }

    pub fn docs_hint(&self) -> &'static str {
        match self {
            RetrievalError::MalformedResponse(_) => {
                "The Instantly API returned an unexpected payload. Retrying will not help; report the payload in details."
            }
            RetrievalError::UpstreamUnavailable { .. } => {
                "The Instantly API is unavailable or rate limiting. Wait before calling the tool again."
            }
            RetrievalError::UpstreamRejected { status: Some(401 | 403), .. } => {
                "Check that INSTANTLY_API_KEY is valid and has the required scopes."
            }
            RetrievalError::UpstreamRejected { .. } => {
                "Fix the tool arguments (filters, ids, starting_after) and retry. Cursors are only valid with the filters they were issued under."
            }
        }
    }

    pub fn details(&self) -> Value {
        match self {
            RetrievalError::MalformedResponse(err) => json!({
                "shape": err.shape,
                "payload_preview": err.payload_preview(),
            }),
            RetrievalError::UpstreamUnavailable {
                attempts, status, ..
            } => json!({
                "attempts": attempts,
                "last_status": status,
            }),
            RetrievalError::UpstreamRejected { status, body, .. } => {
                let mut details = json!({ "status": status });
                if let Some(body) = body {
                    details["body_preview"] = Value::String(body_preview(body));
                }
                details
            }
        }
    }
}

/// Tool-level failure rendered into the tool result envelope.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
    pub docs_hint: Option<String>,
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::new(codes::VALIDATION_FAILED, message).with_field(field)
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            error: self.code.clone(),
            message: self.message.clone(),
            field: self.field.clone(),
            docs_hint: self.docs_hint.clone(),
            details: self.details.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.to_payload()).unwrap_or_else(|_| {
            json!({
                "error": self.code,
                "message": self.message
            })
        })
    }
}

impl From<RetrievalError> for ToolError {
    fn from(err: RetrievalError) -> Self {
        ToolError::new(err.code(), err.to_string())
            .with_docs_hint(err.docs_hint())
            .with_details(err.details())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instantly_core::page::normalize;

    #[test]
    fn unavailable_keeps_last_status_and_body() {
        let last = UpstreamError::Server {
            status: 503,
            body: json!({"error": "overloaded"}),
        };
        let err = RetrievalError::unavailable(4, &last);
        assert_eq!(err.code(), "upstream_unavailable");
        assert!(err.to_string().contains("4 attempt(s)"));
        assert!(err.to_string().contains("overloaded"));
        assert_eq!(err.details()["last_status"], 503);
    }

    #[test]
    fn auth_rejections_point_at_the_api_key() {
        let err = RetrievalError::rejected(UpstreamError::Rejected {
            status: 401,
            body: json!({"message": "Unauthorized"}),
        });
        assert!(err.docs_hint().contains("INSTANTLY_API_KEY"));
        assert_eq!(err.details()["status"], 401);
    }

    #[test]
    fn tool_error_carries_retrieval_classification() {
        let malformed = normalize(&Value::Null).unwrap_err();
        let tool_error = ToolError::from(RetrievalError::from(malformed));
        let value = tool_error.to_value();
        assert_eq!(value["error"], "malformed_response");
        assert_eq!(value["details"]["shape"], "null");
        assert!(value.get("field").is_none());
    }
}
