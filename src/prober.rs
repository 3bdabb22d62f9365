use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::data_models::{PageBody, ProbeResult};
use crate::error::{ProbeError, UpstreamError};
use crate::query::Query;

/// A paginated listing. Pages past the end of the corpus come back empty.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, tags: &str, page: u32, limit: u32) -> Result<String, UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    /// Walk pages from zero until one comes back short.
    Linear,
    /// Binary search for the last non-empty page, then re-fetch it.
    BinarySearch,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown count strategy {0:?}, expected \"linear\" or \"binary\"")]
pub struct UnknownStrategy(String);

impl FromStr for ProbeStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(ProbeStrategy::Linear),
            "binary" | "binary-search" | "binary_search" => Ok(ProbeStrategy::BinarySearch),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for ProbeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStrategy::Linear => write!(f, "linear"),
            ProbeStrategy::BinarySearch => write!(f, "binary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Must equal the page size the gallery paginates with, or the total
    /// will disagree with what incremental loading eventually shows.
    pub page_size: u32,
    /// Highest page index the probe will look at. Must be below `u32::MAX`.
    pub max_pages: u32,
    pub strategy: ProbeStrategy,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            page_size: 42,
            max_pages: 1000,
            strategy: ProbeStrategy::BinarySearch,
        }
    }
}

/// Counts the posts matching a query using only the paginated listing.
///
/// The corpus and the sort order are assumed to stay put for the length of
/// one probe. The binary search additionally relies on monotonicity: once a
/// page is short or empty, every later page is empty. If either assumption
/// breaks, treat the result as best-effort.
///
/// Requests are issued one at a time. There are no retries; the first failed
/// fetch aborts the probe.
pub struct PostCountProber<S> {
    source: S,
    settings: ProbeSettings,
}

impl<S: PageSource> PostCountProber<S> {
    pub fn new(source: S, settings: ProbeSettings) -> Self {
        Self { source, settings }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    pub async fn probe(&self, query: &Query) -> Result<ProbeResult, ProbeError> {
        self.probe_until_cancelled(query, &CancellationToken::new())
            .await
    }

    /// Like [`probe`](Self::probe), but gives up with
    /// [`ProbeError::Cancelled`] as soon as `cancel` fires.
    pub async fn probe_until_cancelled(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<ProbeResult, ProbeError> {
        if self.settings.page_size == 0 {
            return Err(ProbeError::InvalidPageSize);
        }
        // `page + 1` and `mid + 1` must fit in a u32.
        if self.settings.max_pages == u32::MAX {
            return Err(ProbeError::InvalidMaxPages);
        }
        let tags = query.upstream_tags();
        let result = match self.settings.strategy {
            ProbeStrategy::Linear => self.linear_scan(&tags, cancel).await?,
            ProbeStrategy::BinarySearch => self.binary_search(&tags, cancel).await?,
        };
        log::info!(
            "counted {} posts for {tags:?} ({} strategy, {} pages checked{})",
            result.total_count,
            self.settings.strategy,
            result.pages_checked,
            if result.is_estimate { ", estimate" } else { "" }
        );
        Ok(result)
    }

    async fn linear_scan(
        &self,
        tags: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeResult, ProbeError> {
        let page_size = u64::from(self.settings.page_size);
        let mut page = 0u32;
        loop {
            let count = self.page_len(tags, page, cancel).await? as u64;
            if count < page_size {
                return Ok(ProbeResult {
                    total_count: u64::from(page) * page_size + count,
                    is_estimate: false,
                    pages_checked: page + 1,
                });
            }
            if page >= self.settings.max_pages {
                log::warn!(
                    "page {page} is still full for {tags:?}; reporting a lower bound"
                );
                return Ok(ProbeResult {
                    total_count: (u64::from(page) + 1) * page_size,
                    is_estimate: true,
                    pages_checked: page + 1,
                });
            }
            page += 1;
        }
    }

    async fn binary_search(
        &self,
        tags: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeResult, ProbeError> {
        let page_size = u64::from(self.settings.page_size);
        let mut low = 0u32;
        let mut high = self.settings.max_pages;
        let mut last_page_with_posts: Option<u32> = None;

        while low <= high {
            let mid = low + (high - low) / 2;
            if self.page_len(tags, mid, cancel).await? > 0 {
                last_page_with_posts = Some(mid);
                low = mid + 1;
            } else if mid == 0 {
                break;
            } else {
                high = mid - 1;
            }
        }

        let Some(last) = last_page_with_posts else {
            return Ok(ProbeResult {
                total_count: 0,
                is_estimate: false,
                pages_checked: 1,
            });
        };

        let remainder = self.page_len(tags, last, cancel).await? as u64;
        let is_estimate = last >= self.settings.max_pages;
        if is_estimate {
            log::warn!(
                "page {last} (the search bound) still has posts for {tags:?}; total may be higher"
            );
        }
        Ok(ProbeResult {
            total_count: u64::from(last) * page_size + remainder,
            is_estimate,
            pages_checked: last + 1,
        })
    }

    /// Record count of one page. Bodies that are not a JSON array count as
    /// an empty page so a single bad page cannot abort the count.
    async fn page_len(
        &self,
        tags: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<usize, ProbeError> {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            body = self.source.fetch_page(tags, page, self.settings.page_size) => body?,
        };
        let parsed = PageBody::parse(&body);
        match &parsed {
            PageBody::Malformed(e) => {
                log::warn!("page {page} for {tags:?} is not valid JSON, counting it as empty: {e}")
            }
            PageBody::NotAnArray => {
                log::warn!("page {page} for {tags:?} is not a JSON array, counting it as empty")
            }
            _ => {}
        }
        let count = parsed.record_count();
        log::debug!("page {page} for {tags:?}: {count} records");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves a static corpus of `total` posts, with optional per-page
    /// overrides, and records every page index requested.
    struct ScriptedSource {
        total: u64,
        overrides: HashMap<u32, Result<String, UpstreamError>>,
        requests: Mutex<Vec<u32>>,
    }

    impl ScriptedSource {
        fn with_total(total: u64) -> Self {
            Self {
                total,
                overrides: HashMap::new(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn with_override(mut self, page: u32, body: Result<String, UpstreamError>) -> Self {
            self.overrides.insert(page, body);
            self
        }

        fn requests(&self) -> Vec<u32> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&self, _tags: &str, page: u32, limit: u32) -> Result<String, UpstreamError> {
            self.requests.lock().unwrap().push(page);
            if let Some(body) = self.overrides.get(&page) {
                return body.clone();
            }
            let start = u64::from(page) * u64::from(limit);
            let n = self.total.saturating_sub(start).min(u64::from(limit));
            let records = (0..n).map(|i| format!("{{\"id\":{}}}", start + i));
            Ok(format!("[{}]", records.collect::<Vec<_>>().join(",")))
        }
    }

    fn settings(strategy: ProbeStrategy) -> ProbeSettings {
        ProbeSettings {
            page_size: 42,
            max_pages: 1000,
            strategy,
        }
    }

    fn query() -> Query {
        Query::parse("cat -dog", "id:desc", false).unwrap()
    }

    async fn run(source: ScriptedSource, settings: ProbeSettings) -> (Result<ProbeResult, ProbeError>, Vec<u32>) {
        let prober = PostCountProber::new(source, settings);
        let result = prober.probe(&query()).await;
        let requests = prober.source.requests();
        (result, requests)
    }

    #[tokio::test]
    async fn test_linear_exact_multiple_of_page_size() {
        let (result, requests) = run(ScriptedSource::with_total(84), settings(ProbeStrategy::Linear)).await;
        assert_eq!(
            result.unwrap(),
            ProbeResult { total_count: 84, is_estimate: false, pages_checked: 3 }
        );
        assert_eq!(requests, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_linear_partial_last_page() {
        let (result, requests) = run(ScriptedSource::with_total(85), settings(ProbeStrategy::Linear)).await;
        assert_eq!(
            result.unwrap(),
            ProbeResult { total_count: 85, is_estimate: false, pages_checked: 3 }
        );
        assert_eq!(requests, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_zero_posts_for_both_strategies() {
        for strategy in [ProbeStrategy::Linear, ProbeStrategy::BinarySearch] {
            let (result, _) = run(ScriptedSource::with_total(0), settings(strategy)).await;
            assert_eq!(
                result.unwrap(),
                ProbeResult { total_count: 0, is_estimate: false, pages_checked: 1 },
                "strategy {strategy}"
            );
        }
    }

    #[tokio::test]
    async fn test_binary_search_converges_on_last_page() {
        // Last page with posts is 5: 5 * 42 + 17.
        let (result, requests) =
            run(ScriptedSource::with_total(5 * 42 + 17), settings(ProbeStrategy::BinarySearch)).await;
        assert_eq!(
            result.unwrap(),
            ProbeResult { total_count: 227, is_estimate: false, pages_checked: 6 }
        );
        // log2(1001) rounded up, plus the final re-fetch.
        assert!(requests.len() <= 11, "too many requests: {requests:?}");
        assert_eq!(requests.last(), Some(&5));
    }

    #[tokio::test]
    async fn test_strategies_agree_with_linear_enumeration() {
        for total in [1u64, 41, 42, 43, 83, 84, 85, 420, 1000, 4242] {
            let (linear, _) = run(ScriptedSource::with_total(total), settings(ProbeStrategy::Linear)).await;
            let (binary, _) =
                run(ScriptedSource::with_total(total), settings(ProbeStrategy::BinarySearch)).await;
            let linear = linear.unwrap();
            let binary = binary.unwrap();
            assert_eq!(linear.total_count, total);
            assert_eq!(binary.total_count, total, "binary search disagrees at {total}");
            assert!(!binary.is_estimate);
        }
    }

    #[tokio::test]
    async fn test_binary_search_flags_bound_exceeded() {
        let bounded = ProbeSettings {
            page_size: 10,
            max_pages: 7,
            strategy: ProbeStrategy::BinarySearch,
        };
        let (result, _) = run(ScriptedSource::with_total(500), bounded).await;
        assert_eq!(
            result.unwrap(),
            ProbeResult { total_count: 80, is_estimate: true, pages_checked: 8 }
        );
    }

    #[tokio::test]
    async fn test_linear_flags_bound_exceeded() {
        let bounded = ProbeSettings {
            page_size: 10,
            max_pages: 3,
            strategy: ProbeStrategy::Linear,
        };
        let (result, requests) = run(ScriptedSource::with_total(500), bounded).await;
        assert_eq!(
            result.unwrap(),
            ProbeResult { total_count: 40, is_estimate: true, pages_checked: 4 }
        );
        assert_eq!(requests, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_malformed_page_is_counted_as_empty() {
        let source = ScriptedSource::with_total(200).with_override(2, Ok("[{\"id\":1},".to_string()));
        let (result, _) = run(source, settings(ProbeStrategy::Linear)).await;
        assert_eq!(
            result.unwrap(),
            ProbeResult { total_count: 84, is_estimate: false, pages_checked: 3 }
        );

        let source = ScriptedSource::with_total(0).with_override(0, Ok("<html>oops</html>".to_string()));
        let (result, _) = run(source, settings(ProbeStrategy::BinarySearch)).await;
        assert_eq!(result.unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_aborts_probe() {
        let source = ScriptedSource::with_total(200).with_override(1, Err(UpstreamError::Status(503)));
        let (result, requests) = run(source, settings(ProbeStrategy::Linear)).await;
        let err = result.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(requests, vec![0, 1]);

        let source = ScriptedSource::with_total(200).with_override(0, Err(UpstreamError::Timeout));
        let (result, _) = run(source, settings(ProbeStrategy::Linear)).await;
        assert_eq!(result.unwrap_err(), ProbeError::Upstream(UpstreamError::Timeout));
    }

    #[tokio::test]
    async fn test_zero_page_size_is_rejected_without_requests() {
        let bad = ProbeSettings {
            page_size: 0,
            ..ProbeSettings::default()
        };
        let (result, requests) = run(ScriptedSource::with_total(10), bad).await;
        assert_eq!(result.unwrap_err(), ProbeError::InvalidPageSize);
        assert!(requests.is_empty());
    }

    /// Every page is full, however far the probe looks.
    struct EndlessSource;

    #[async_trait]
    impl PageSource for EndlessSource {
        async fn fetch_page(&self, _tags: &str, page: u32, limit: u32) -> Result<String, UpstreamError> {
            let start = u64::from(page) * u64::from(limit);
            let records = (0..u64::from(limit)).map(|i| format!("{{\"id\":{}}}", start + i));
            Ok(format!("[{}]", records.collect::<Vec<_>>().join(",")))
        }
    }

    #[tokio::test]
    async fn test_unbounded_max_pages_is_rejected() {
        for strategy in [ProbeStrategy::Linear, ProbeStrategy::BinarySearch] {
            let prober = PostCountProber::new(
                EndlessSource,
                ProbeSettings {
                    page_size: 42,
                    max_pages: u32::MAX,
                    strategy,
                },
            );
            assert_eq!(prober.probe(&query()).await.unwrap_err(), ProbeError::InvalidMaxPages);
        }
    }

    #[tokio::test]
    async fn test_binary_search_terminates_at_largest_bound() {
        let max_pages = u32::MAX - 1;
        let prober = PostCountProber::new(
            EndlessSource,
            ProbeSettings {
                page_size: 42,
                max_pages,
                strategy: ProbeStrategy::BinarySearch,
            },
        );
        let result = prober.probe(&query()).await.unwrap();
        assert_eq!(
            result,
            ProbeResult {
                total_count: (u64::from(max_pages) + 1) * 42,
                is_estimate: true,
                pages_checked: u32::MAX,
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_probe_returns_no_result() {
        let prober = PostCountProber::new(ScriptedSource::with_total(100), ProbeSettings::default());
        let token = CancellationToken::new();
        token.cancel();
        let result = prober.probe_until_cancelled(&query(), &token).await;
        assert_eq!(result.unwrap_err(), ProbeError::Cancelled);
        assert!(prober.source.requests().is_empty());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("linear".parse::<ProbeStrategy>().unwrap(), ProbeStrategy::Linear);
        assert_eq!("Binary".parse::<ProbeStrategy>().unwrap(), ProbeStrategy::BinarySearch);
        assert!("bogo".parse::<ProbeStrategy>().is_err());
    }
}
