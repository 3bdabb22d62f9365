use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use boorugate::data_models::ProbeResult;
use boorugate::error::{ProbeError, UpstreamError};
use boorugate::prober::{PostCountProber, ProbeSettings, ProbeStrategy};
use boorugate::query::Query;
use boorugate::upstream::BooruClient;

mod test_helpers {
    use super::*;

    /// Serves a static corpus of `total` posts, paginated by `pid`/`limit`.
    /// Pages past the end come back with an empty body, like the real API.
    pub struct CorpusResponder {
        pub total: u64,
    }

    fn param(request: &Request, key: &str) -> Option<u64> {
        request
            .url
            .query_pairs()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.parse().ok())
    }

    impl Respond for CorpusResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let pid = param(request, "pid").unwrap_or(0);
            let limit = param(request, "limit").unwrap_or(42);
            let start = pid * limit;
            let n = self.total.saturating_sub(start).min(limit);
            if n == 0 {
                return ResponseTemplate::new(200).set_body_string("");
            }
            let posts = (start..start + n)
                .map(|id| {
                    serde_json::json!({
                        "id": id,
                        "file_url": format!("https://img.example/{id}.png"),
                        "preview_url": format!("https://img.example/thumb_{id}.png"),
                        "width": 100,
                        "height": 100,
                        "tags": "cat solo",
                    })
                })
                .collect::<Vec<_>>();
            ResponseTemplate::new(200).set_body_json(posts)
        }
    }

    pub async fn corpus_server(total: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .respond_with(CorpusResponder { total })
            .with_priority(10)
            .mount(&server)
            .await;
        server
    }

    pub fn client(server: &MockServer, timeout: Duration) -> BooruClient {
        BooruClient::new(
            &format!("{}/index.php", server.uri()),
            "boorugate-test/0.1",
            timeout,
        )
        .unwrap()
    }

    pub fn prober(server: &MockServer, strategy: ProbeStrategy) -> PostCountProber<BooruClient> {
        PostCountProber::new(
            client(server, Duration::from_secs(5)),
            ProbeSettings {
                page_size: 42,
                max_pages: 1000,
                strategy,
            },
        )
    }

    pub async fn requested_pages(server: &MockServer) -> Vec<u64> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|r| param(r, "pid"))
            .collect()
    }

    pub fn query() -> Query {
        Query::parse("cat -dog", "id:desc", false).unwrap()
    }
}

use test_helpers::*;

#[cfg(test)]
mod scenario_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_linear_84_posts_checks_three_pages() {
        let server = corpus_server(84).await;
        let result = prober(&server, ProbeStrategy::Linear).probe(&query()).await.unwrap();
        assert_eq!(
            result,
            ProbeResult { total_count: 84, is_estimate: false, pages_checked: 3 }
        );
        assert_eq!(requested_pages(&server).await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_linear_85_posts_stops_on_short_page() {
        let server = corpus_server(85).await;
        let result = prober(&server, ProbeStrategy::Linear).probe(&query()).await.unwrap();
        assert_eq!(
            result,
            ProbeResult { total_count: 85, is_estimate: false, pages_checked: 3 }
        );
    }

    #[tokio::test]
    async fn test_binary_search_last_page_five() {
        let server = corpus_server(5 * 42 + 9).await;
        let result = prober(&server, ProbeStrategy::BinarySearch)
            .probe(&query())
            .await
            .unwrap();
        assert_eq!(
            result,
            ProbeResult { total_count: 219, is_estimate: false, pages_checked: 6 }
        );
        let pages = requested_pages(&server).await;
        assert!(pages.len() <= 11, "too many requests: {pages:?}");
        assert_eq!(pages.last(), Some(&5));
    }

    #[tokio::test]
    async fn test_no_matches_is_zero() {
        for strategy in [ProbeStrategy::Linear, ProbeStrategy::BinarySearch] {
            let server = corpus_server(0).await;
            let result = prober(&server, strategy).probe(&query()).await.unwrap();
            assert_eq!(
                result,
                ProbeResult { total_count: 0, is_estimate: false, pages_checked: 1 }
            );
        }
    }

    #[tokio::test]
    async fn test_exact_page_boundary_for_both_strategies() {
        for strategy in [ProbeStrategy::Linear, ProbeStrategy::BinarySearch] {
            let server = corpus_server(3 * 42).await;
            let result = prober(&server, strategy).probe(&query()).await.unwrap();
            assert_eq!(result.total_count, 126, "strategy {strategy}");
            assert!(!result.is_estimate);
        }
    }
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_sends_tags_with_sort_and_page_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("page", "dapi"))
            .and(query_param("s", "post"))
            .and(query_param("q", "index"))
            .and(query_param("json", "1"))
            .and(query_param("tags", "cat -dog -ai* sort:score:desc"))
            .and(query_param("pid", "0"))
            .and(query_param("limit", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let query = Query::parse("cat -dog", "score:desc", true).unwrap();
        let result = prober(&server, ProbeStrategy::Linear).probe(&query).await.unwrap();
        assert_eq!(result.total_count, 0);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_upstream_status_aborts_probe() {
        let server = corpus_server(500).await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("pid", "1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = prober(&server, ProbeStrategy::Linear)
            .probe(&query())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure_not_an_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(250))
                    .set_body_string("[]"),
            )
            .mount(&server)
            .await;

        let prober = PostCountProber::new(
            client(&server, Duration::from_millis(50)),
            ProbeSettings::default(),
        );
        let err = prober.probe(&query()).await.unwrap_err();
        assert_eq!(err, ProbeError::Upstream(UpstreamError::Timeout));
    }

    #[tokio::test]
    async fn test_malformed_page_degrades_instead_of_failing() {
        let server = corpus_server(500).await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .and(query_param("pid", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[{\"id\": 1}, {\"id\""))
            .mount(&server)
            .await;

        let result = prober(&server, ProbeStrategy::Linear)
            .probe(&query())
            .await
            .unwrap();
        assert_eq!(
            result,
            ProbeResult { total_count: 42, is_estimate: false, pages_checked: 2 }
        );
    }

    #[tokio::test]
    async fn test_cancellation_abandons_slow_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_string("[]"),
            )
            .mount(&server)
            .await;

        let prober = prober(&server, ProbeStrategy::BinarySearch);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = prober
            .probe_until_cancelled(&query(), &token)
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
