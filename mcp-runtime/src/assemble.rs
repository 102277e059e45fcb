//! Turns a finished [`RetrievalSession`] into the caller-facing result.
//!
//! Exhaustion is the only complete outcome. Budget stops and failures after
//! the first page return what was accumulated together with a resume cursor.
//! A failure before any item was accumulated is returned as an error.

use instantly_core::profile::ClientProfile;
use instantly_core::result::{AggregateResult, PaginationInfo, RetrievalMode, StopReason};

use crate::error::RetrievalError;
use crate::pagination::RetrievalSession;

/// Retrieval failed before producing anything worth returning.
#[derive(Debug, Clone)]
pub struct RetrievalFailure {
    pub error: RetrievalError,
    pub pages_fetched: u32,
}

/// `profile` is the budget the session ran under; `mode` is what the caller
/// asked for and only shapes the note.
pub fn assemble(
    session: RetrievalSession,
    profile: &ClientProfile,
    mode: RetrievalMode,
) -> Result<AggregateResult, RetrievalFailure> {
    let elapsed_ms = session.elapsed().as_millis() as u64;
    let reason = session.stopped_reason.unwrap_or(StopReason::Exhausted);

    if reason == StopReason::Error && session.items.is_empty() {
        return Err(RetrievalFailure {
            error: session.error.unwrap_or_else(|| RetrievalError::UpstreamUnavailable {
                attempts: 0,
                status: None,
                message: "retrieval stopped without a recorded error".to_string(),
            }),
            pages_fetched: session.pages_fetched,
        });
    }

    let returned_count = session.items.len();
    let (has_more, next_cursor, note) = match reason {
        StopReason::Exhausted => (false, None, None),
        StopReason::MaxPages if matches!(mode, RetrievalMode::SinglePage { .. }) => (
            true,
            session.last_cursor,
            Some(single_page_note(returned_count)),
        ),
        StopReason::MaxPages => (
            true,
            session.last_cursor,
            Some(format!(
                "Stopped after {} page(s) ({returned_count} records), the page limit for client profile '{}'. \
                 More records exist: call again with starting_after set to next_cursor and the same filters to continue.",
                session.pages_fetched, profile.name
            )),
        ),
        StopReason::Timeout => (
            true,
            session.last_cursor,
            Some(format!(
                "Stopped after {elapsed_ms} ms to stay within the {} ms budget for client profile '{}' \
                 ({returned_count} records over {} page(s)). More records exist: call again with \
                 starting_after set to next_cursor and the same filters to continue.",
                profile.soft_timeout_ms, profile.name, session.pages_fetched
            )),
        ),
        StopReason::Error => {
            let cause = session
                .error
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            (
                true,
                session.last_cursor,
                Some(format!(
                    "Partial result: fetching page {} failed ({cause}). Returned the {returned_count} records \
                     retrieved before the failure. Retry with starting_after set to next_cursor to resume.",
                    session.pages_fetched + 1
                )),
            )
        }
    };

    Ok(AggregateResult {
        data: session.items,
        pagination: PaginationInfo {
            returned_count,
            has_more,
            next_cursor,
            note,
            stopped_reason: reason,
            pages_fetched: session.pages_fetched,
            elapsed_ms,
            client_profile: profile.name.clone(),
        },
    })
}

fn single_page_note(returned_count: usize) -> String {
    format!(
        "Returned one page ({returned_count} records). More records exist: pass starting_after = next_cursor \
         for the next page, or get_all = true to retrieve as much as the client budget allows."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagination::retrieve_all;
    use crate::pagination::tests::{FakeCollection, fast_retry, profile};
    use crate::upstream::{PageRequest, UpstreamError};
    use instantly_core::page::Cursor;
    use serde_json::Value;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn exhausted_retrieval_is_complete() {
        let source = FakeCollection::new(250);
        let profile = profile(10, 100, 60_000);
        let session = retrieve_all(&source, &fast_retry(), &profile, PageRequest::default()).await;
        let result = assemble(session, &profile, RetrievalMode::CompleteRetrieval).unwrap();

        assert_eq!(result.data.len(), 250);
        assert_eq!(result.pagination.returned_count, 250);
        assert!(!result.pagination.has_more);
        assert!(result.pagination.next_cursor.is_none());
        assert!(result.pagination.note.is_none());
        assert_eq!(result.pagination.pages_fetched, 3);
        assert_eq!(result.pagination.client_profile, "test");
    }

    #[tokio::test(start_paused = true)]
    async fn page_ceiling_result_is_resumable() {
        let source = FakeCollection::new(1_000);
        let profile = profile(2, 100, 60_000);
        let session = retrieve_all(&source, &fast_retry(), &profile, PageRequest::default()).await;
        let result = assemble(session, &profile, RetrievalMode::CompleteRetrieval).unwrap();

        assert!(result.pagination.has_more);
        assert_eq!(result.pagination.stopped_reason, StopReason::MaxPages);
        assert_eq!(result.pagination.next_cursor, Cursor::new("r0199"));
        let note = result.pagination.note.unwrap();
        assert!(note.contains("starting_after"));
        assert!(note.contains("'test'"));
    }

    #[tokio::test(start_paused = true)]
    async fn single_page_note_mentions_get_all() {
        let source = FakeCollection::new(500);
        let profile = profile(10, 100, 60_000).single_page(20);
        let session = retrieve_all(&source, &fast_retry(), &profile, PageRequest::default()).await;
        let result = assemble(session, &profile, RetrievalMode::SinglePage { limit: 20 }).unwrap();

        assert_eq!(result.data.len(), 20);
        assert!(result.pagination.has_more);
        assert!(result.pagination.note.unwrap().contains("get_all"));
    }

    #[tokio::test(start_paused = true)]
    async fn one_page_budget_in_complete_mode_reports_page_limit() {
        let source = FakeCollection::new(500);
        let profile = profile(1, 100, 60_000);
        let session = retrieve_all(&source, &fast_retry(), &profile, PageRequest::default()).await;
        let result = assemble(session, &profile, RetrievalMode::CompleteRetrieval).unwrap();

        assert_eq!(result.pagination.stopped_reason, StopReason::MaxPages);
        let note = result.pagination.note.unwrap();
        assert!(note.contains("page limit"));
        assert!(!note.contains("get_all"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_result_reports_budget() {
        let source = FakeCollection::new(10_000).with_latency(Duration::from_millis(600));
        let profile = profile(1_000, 100, 1_000);
        let session = retrieve_all(&source, &fast_retry(), &profile, PageRequest::default()).await;
        let result = assemble(session, &profile, RetrievalMode::CompleteRetrieval).unwrap();

        assert_eq!(result.pagination.stopped_reason, StopReason::Timeout);
        assert!(result.pagination.has_more);
        assert!(result.pagination.next_cursor.is_some());
        assert!(result.pagination.note.unwrap().contains("1000 ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_first_page_is_partial() {
        let source = FakeCollection::new(1_000).failing_on_page(
            2,
            UpstreamError::RateLimited {
                retry_after: None,
                body: Value::Null,
            },
        );
        let profile = profile(10, 100, 60_000);
        let session = retrieve_all(&source, &fast_retry(), &profile, PageRequest::default()).await;
        let result = assemble(session, &profile, RetrievalMode::CompleteRetrieval).unwrap();

        assert_eq!(result.data.len(), 100);
        assert_eq!(result.pagination.stopped_reason, StopReason::Error);
        assert_eq!(result.pagination.next_cursor, Cursor::new("r0099"));
        assert!(result.pagination.note.unwrap().contains("page 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_on_first_page_is_an_error() {
        let source = FakeCollection::new(1_000).failing_on_page(
            1,
            UpstreamError::Rejected {
                status: 401,
                body: Value::Null,
            },
        );
        let profile = profile(10, 100, 60_000);
        let session = retrieve_all(&source, &fast_retry(), &profile, PageRequest::default()).await;
        let failure = assemble(session, &profile, RetrievalMode::CompleteRetrieval).unwrap_err();

        assert_eq!(failure.pages_fetched, 0);
        assert!(matches!(
            failure.error,
            RetrievalError::UpstreamRejected { status: Some(401), .. }
        ));
    }
}
