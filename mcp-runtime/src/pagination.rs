//! Complete-retrieval engine.
//!
//! Walks a cursor-paginated collection strictly sequentially (each request
//! depends on the previous page's cursor) until one of:
//!
//! - the upstream issues no next cursor (`Exhausted`)
//! - the profile's page ceiling is reached (`MaxPages`)
//! - the soft time budget is spent (`Timeout`), checked before each fetch
//!   after the first; an in-flight fetch is never interrupted
//! - a fetch fails after retries, or a page cannot be normalized (`Error`)
//!
//! The engine only records state. Deciding whether the outcome is complete,
//! partial, or a failure is left to [`crate::assemble`].

use std::time::Duration;

use instantly_core::page::{Cursor, Record, normalize};
use instantly_core::profile::ClientProfile;
use instantly_core::result::StopReason;
use tokio::time::Instant;

use crate::error::RetrievalError;
use crate::retry::RetryPolicy;
use crate::upstream::{PageRequest, PageSource};

/// State of one retrieval run. Owned by the call that created it.
#[derive(Debug)]
pub struct RetrievalSession {
    pub started_at: Instant,
    pub pages_fetched: u32,
    pub items: Vec<Record>,
    /// Cursor that resumes right after the last accumulated item. Starts as
    /// the caller's `starting_after`.
    pub last_cursor: Option<Cursor>,
    pub stopped_reason: Option<StopReason>,
    pub error: Option<RetrievalError>,
}

impl RetrievalSession {
    fn new(initial_cursor: Option<Cursor>) -> Self {
        Self {
            started_at: Instant::now(),
            pages_fetched: 0,
            items: Vec::new(),
            last_cursor: initial_cursor,
            stopped_reason: None,
            error: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Progress emitted by [`Retrieval::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalEvent {
    PageFetched {
        page_number: u32,
        page_items: usize,
        total_items: usize,
        has_next: bool,
    },
    Stopped {
        reason: StopReason,
        pages_fetched: u32,
        total_items: usize,
    },
}

/// Pull-based retrieval: each call to [`Retrieval::next_event`] performs at
/// most one page fetch and reports what happened. Returns `None` once
/// stopped.
pub struct Retrieval<'a, S> {
    source: &'a S,
    retry: &'a RetryPolicy,
    profile: &'a ClientProfile,
    next_request: PageRequest,
    session: RetrievalSession,
    upstream_exhausted: bool,
}

impl<'a, S: PageSource> Retrieval<'a, S> {
    /// The request's `limit` is replaced by the profile's page size so that
    /// timeout math stays predictable.
    pub fn new(
        source: &'a S,
        retry: &'a RetryPolicy,
        profile: &'a ClientProfile,
        first_request: PageRequest,
    ) -> Self {
        let next_request = PageRequest {
            limit: profile.page_size,
            ..first_request
        };
        let session = RetrievalSession::new(next_request.starting_after.clone());
        Self {
            source,
            retry,
            profile,
            next_request,
            session,
            upstream_exhausted: false,
        }
    }

    pub fn session(&self) -> &RetrievalSession {
        &self.session
    }

    pub fn is_stopped(&self) -> bool {
        self.session.stopped_reason.is_some()
    }

    pub fn into_session(self) -> RetrievalSession {
        self.session
    }

    pub async fn next_event(&mut self) -> Option<RetrievalEvent> {
        if self.is_stopped() {
            return None;
        }
        if self.upstream_exhausted {
            return Some(self.stop(StopReason::Exhausted));
        }
        if self.session.pages_fetched >= self.profile.max_pages {
            return Some(self.stop(StopReason::MaxPages));
        }
        if self.session.pages_fetched > 0 && self.session.elapsed() >= self.profile.soft_timeout()
        {
            return Some(self.stop(StopReason::Timeout));
        }

        let source = self.source;
        let request = &self.next_request;
        let deadline = self.session.started_at + self.profile.soft_timeout();
        let fetched = self
            .retry
            .fetch_page_with_retry(deadline, move || source.fetch_page(request))
            .await;
        let page = match fetched.and_then(|raw| normalize(&raw).map_err(RetrievalError::from)) {
            Ok(page) => page,
            Err(err) => {
                self.session.error = Some(err);
                return Some(self.stop(StopReason::Error));
            }
        };

        self.session.pages_fetched += 1;
        let has_next = !page.is_last();
        let page_items = page.items.len();
        self.session.items.extend(page.items);
        match page.next_cursor {
            Some(cursor) => {
                self.next_request = self.next_request.after(cursor.clone());
                self.session.last_cursor = Some(cursor);
            }
            None => self.upstream_exhausted = true,
        }

        Some(RetrievalEvent::PageFetched {
            page_number: self.session.pages_fetched,
            page_items,
            total_items: self.session.items.len(),
            has_next,
        })
    }

    fn stop(&mut self, reason: StopReason) -> RetrievalEvent {
        self.session.stopped_reason = Some(reason);
        RetrievalEvent::Stopped {
            reason,
            pages_fetched: self.session.pages_fetched,
            total_items: self.session.items.len(),
        }
    }
}

/// Drives a [`Retrieval`] to its terminal state, logging progress.
pub async fn retrieve_all<S: PageSource>(
    source: &S,
    retry: &RetryPolicy,
    profile: &ClientProfile,
    first_request: PageRequest,
) -> RetrievalSession {
    let mut retrieval = Retrieval::new(source, retry, profile, first_request);
    while let Some(event) = retrieval.next_event().await {
        match event {
            RetrievalEvent::PageFetched {
                page_number,
                page_items,
                total_items,
                has_next,
            } => tracing::debug!(
                event = "page_fetched",
                profile = %profile.name,
                page_number,
                page_items,
                total_items,
                has_next,
                elapsed_ms = retrieval.session().elapsed().as_millis() as u64,
                "Fetched page"
            ),
            RetrievalEvent::Stopped {
                reason,
                pages_fetched,
                total_items,
            } => {
                let session = retrieval.session();
                tracing::info!(
                    event = "retrieval_stopped",
                    profile = %profile.name,
                    reason = reason.as_str(),
                    pages_fetched,
                    total_items,
                    elapsed_ms = session.elapsed().as_millis() as u64,
                    error = ?session.error.as_ref().map(|e| e.to_string()),
                    "Retrieval finished"
                );
            }
        }
    }
    retrieval.into_session()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::upstream::UpstreamError;
    use serde_json::{Map, Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory collection: `dataset` served in pages keyed by the id of the
    /// last record, like the upstream `starting_after` cursor.
    pub(crate) struct FakeCollection {
        dataset: Vec<Value>,
        latency: Duration,
        failures: Mutex<VecDeque<(u32, UpstreamError)>>,
        pub(crate) requests: Mutex<Vec<PageRequest>>,
        short_pages: bool,
    }

    impl FakeCollection {
        pub(crate) fn new(len: usize) -> Self {
            Self {
                dataset: (0..len).map(|i| json!({ "id": format!("r{i:04}") })).collect(),
                latency: Duration::ZERO,
                failures: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                short_pages: false,
            }
        }

        pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Fails every request for page `page_number` (1-based) with `err`.
        pub(crate) fn failing_on_page(self, page_number: u32, err: UpstreamError) -> Self {
            self.failures
                .lock()
                .unwrap()
                .push_back((page_number, err));
            self
        }

        /// Serves half-sized pages while still issuing cursors.
        pub(crate) fn with_short_pages(mut self) -> Self {
            self.short_pages = true;
            self
        }

        fn page_number_for(&self, request: &PageRequest) -> u32 {
            let offset = self.offset_after(request.starting_after.as_ref());
            (offset / request.limit.max(1) as usize) as u32 + 1
        }

        fn offset_after(&self, cursor: Option<&Cursor>) -> usize {
            match cursor {
                None => 0,
                Some(cursor) => self
                    .dataset
                    .iter()
                    .position(|record| record["id"] == cursor.as_str())
                    .map(|index| index + 1)
                    .unwrap_or(self.dataset.len()),
            }
        }
    }

    impl PageSource for FakeCollection {
        fn fetch_page(
            &self,
            request: &PageRequest,
        ) -> impl std::future::Future<Output = Result<Value, UpstreamError>> + Send {
            self.requests.lock().unwrap().push(request.clone());
            let page_number = self.page_number_for(request);
            let failure = self
                .failures
                .lock()
                .unwrap()
                .iter()
                .find(|(page, _)| *page == page_number)
                .map(|(_, err)| err.clone());
            let start = self.offset_after(request.starting_after.as_ref());
            let size = if self.short_pages {
                (request.limit as usize / 2).max(1)
            } else {
                request.limit as usize
            };
            let end = (start + size).min(self.dataset.len());
            let items = self.dataset[start..end].to_vec();
            let next = if end < self.dataset.len() {
                items.last().map(|record| record["id"].clone())
            } else {
                None
            };
            let latency = self.latency;
            async move {
                tokio::time::sleep(latency).await;
                if let Some(err) = failure {
                    return Err(err);
                }
                let mut body = Map::new();
                body.insert("items".to_string(), Value::Array(items));
                if let Some(next) = next {
                    body.insert("next_starting_after".to_string(), next);
                }
                Ok(Value::Object(body))
            }
        }
    }

    pub(crate) fn profile(max_pages: u32, page_size: u32, soft_timeout_ms: u64) -> ClientProfile {
        ClientProfile::new("test", soft_timeout_ms * 2, soft_timeout_ms, max_pages, page_size)
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3)
            .with_delays(Duration::from_millis(5), Duration::from_millis(20))
            .without_jitter()
    }

    fn ids(items: &[Value]) -> Vec<String> {
        items
            .iter()
            .map(|item| item["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn retrieves_everything_once_in_order() {
        let source = FakeCollection::new(437);
        let session = retrieve_all(
            &source,
            &fast_retry(),
            &profile(50, 100, 60_000),
            PageRequest::default(),
        )
        .await;

        assert_eq!(session.stopped_reason, Some(StopReason::Exhausted));
        assert_eq!(session.pages_fetched, 5);
        let expected: Vec<String> = (0..437).map(|i| format!("r{i:04}")).collect();
        assert_eq!(ids(&session.items), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn final_short_page_without_cursor_exhausts() {
        let source = FakeCollection::new(250);
        let session = retrieve_all(
            &source,
            &fast_retry(),
            &profile(10, 100, 60_000),
            PageRequest::default(),
        )
        .await;
        assert_eq!(session.pages_fetched, 3);
        assert_eq!(session.items.len(), 250);
        assert_eq!(session.stopped_reason, Some(StopReason::Exhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn short_pages_mid_sequence_do_not_terminate() {
        let source = FakeCollection::new(200).with_short_pages();
        let session = retrieve_all(
            &source,
            &fast_retry(),
            &profile(10, 100, 60_000),
            PageRequest::default(),
        )
        .await;
        assert_eq!(session.items.len(), 200);
        assert_eq!(session.pages_fetched, 4);
        assert_eq!(session.stopped_reason, Some(StopReason::Exhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn page_ceiling_stops_with_cursor() {
        let source = FakeCollection::new(1_000);
        let session = retrieve_all(
            &source,
            &fast_retry(),
            &profile(3, 100, 60_000),
            PageRequest::default(),
        )
        .await;
        assert_eq!(session.stopped_reason, Some(StopReason::MaxPages));
        assert_eq!(session.items.len(), 300);
        assert_eq!(session.last_cursor, Cursor::new("r0299"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wins_over_page_ceiling() {
        let source = FakeCollection::new(300);
        let session = retrieve_all(
            &source,
            &fast_retry(),
            &profile(3, 100, 60_000),
            PageRequest::default(),
        )
        .await;
        assert_eq!(session.stopped_reason, Some(StopReason::Exhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn soft_timeout_stops_before_next_fetch() {
        let latency = Duration::from_millis(700);
        let source = FakeCollection::new(10_000).with_latency(latency);
        let soft = 2_000;
        let session = retrieve_all(
            &source,
            &fast_retry(),
            &profile(1_000, 100, soft),
            PageRequest::default(),
        )
        .await;

        assert_eq!(session.stopped_reason, Some(StopReason::Timeout));
        assert!(session.elapsed() <= Duration::from_millis(soft) + latency);
        // 0.7s, 1.4s, 2.1s: the third fetch starts before the budget is spent
        assert_eq!(session.pages_fetched, 3);
        assert!(session.last_cursor.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_first_page_is_always_completed() {
        let source = FakeCollection::new(10_000).with_latency(Duration::from_secs(5));
        let session = retrieve_all(
            &source,
            &fast_retry(),
            &profile(1_000, 100, 1_000),
            PageRequest::default(),
        )
        .await;
        assert_eq!(session.pages_fetched, 1);
        assert_eq!(session.items.len(), 100);
        assert_eq!(session.stopped_reason, Some(StopReason::Timeout));
        assert_eq!(session.last_cursor, Cursor::new("r0099"));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_accumulated_items() {
        let source = FakeCollection::new(1_000).failing_on_page(
            2,
            UpstreamError::Server {
                status: 502,
                body: Value::Null,
            },
        );
        let session = retrieve_all(
            &source,
            &fast_retry(),
            &profile(10, 100, 60_000),
            PageRequest::default(),
        )
        .await;
        assert_eq!(session.stopped_reason, Some(StopReason::Error));
        assert_eq!(session.items.len(), 100);
        assert_eq!(session.last_cursor, Cursor::new("r0099"));
        assert!(matches!(
            session.error,
            Some(RetrievalError::UpstreamUnavailable { attempts: 3, .. })
        ));
        // one request for page 1, three attempts for page 2
        assert_eq!(source.requests.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_page_gives_up_within_the_budget() {
        let source = FakeCollection::new(1_000).failing_on_page(
            2,
            UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(10)),
                body: Value::Null,
            },
        );
        let profile = profile(10, 100, 1_000);
        let session = retrieve_all(
            &source,
            &RetryPolicy::default().without_jitter(),
            &profile,
            PageRequest::default(),
        )
        .await;

        assert!(session.elapsed() <= profile.hard_timeout());
        assert_eq!(session.stopped_reason, Some(StopReason::Error));
        assert_eq!(session.pages_fetched, 1);
        assert_eq!(session.items.len(), 100);
        assert_eq!(session.last_cursor, Cursor::new("r0099"));
        assert!(matches!(
            session.error,
            Some(RetrievalError::UpstreamUnavailable {
                status: Some(429),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_use_profile_page_size_and_chain_cursors() {
        let source = FakeCollection::new(120);
        let mut filters = Map::new();
        filters.insert("campaign_id".to_string(), json!("cmp-1"));
        let request = PageRequest::new(7, None, filters.clone());
        retrieve_all(&source, &fast_retry(), &profile(10, 50, 60_000), request).await;

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.limit == 50 && r.filters == filters));
        assert_eq!(requests[0].starting_after, None);
        assert_eq!(requests[1].starting_after, Cursor::new("r0049"));
        assert_eq!(requests[2].starting_after, Cursor::new("r0099"));
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_retrieval_concatenates_to_full_dataset() {
        let source = FakeCollection::new(730);
        let retry = fast_retry();

        let full = retrieve_all(&source, &retry, &profile(100, 100, 60_000), PageRequest::default()).await;

        let mut collected = Vec::new();
        let mut cursor = None;
        loop {
            let part = retrieve_all(
                &source,
                &retry,
                &profile(2, 100, 60_000),
                PageRequest::new(100, cursor.clone(), Map::new()),
            )
            .await;
            collected.extend(part.items);
            if part.stopped_reason == Some(StopReason::Exhausted) {
                break;
            }
            cursor = part.last_cursor;
        }
        assert_eq!(ids(&collected), ids(&full.items));
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_yielded_lazily() {
        let source = FakeCollection::new(150);
        let retry = fast_retry();
        let profile = profile(10, 100, 60_000);
        let mut retrieval = Retrieval::new(&source, &retry, &profile, PageRequest::default());

        assert_eq!(
            retrieval.next_event().await,
            Some(RetrievalEvent::PageFetched {
                page_number: 1,
                page_items: 100,
                total_items: 100,
                has_next: true,
            })
        );
        assert_eq!(source.requests.lock().unwrap().len(), 1);
        assert_eq!(
            retrieval.next_event().await,
            Some(RetrievalEvent::PageFetched {
                page_number: 2,
                page_items: 50,
                total_items: 150,
                has_next: false,
            })
        );
        assert_eq!(
            retrieval.next_event().await,
            Some(RetrievalEvent::Stopped {
                reason: StopReason::Exhausted,
                pages_fetched: 2,
                total_items: 150,
            })
        );
        assert_eq!(retrieval.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_page_is_an_error_stop() {
        struct Broken;
        impl PageSource for Broken {
            fn fetch_page(
                &self,
                _request: &PageRequest,
            ) -> impl std::future::Future<Output = Result<Value, UpstreamError>> + Send {
                async { Ok(json!({"campaigns": []})) }
            }
        }
        let session = retrieve_all(
            &Broken,
            &fast_retry(),
            &profile(10, 100, 60_000),
            PageRequest::default(),
        )
        .await;
        assert_eq!(session.stopped_reason, Some(StopReason::Error));
        assert!(matches!(
            session.error,
            Some(RetrievalError::MalformedResponse(_))
        ));
    }
}
