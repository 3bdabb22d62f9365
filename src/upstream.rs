use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::config::Config;
use crate::data_models::{DecodedPage, PageBody, Post, decode_posts};
use crate::error::UpstreamError;
use crate::prober::PageSource;

/// HTTP client for the booru `list posts` endpoint.
#[derive(Debug, Clone)]
pub struct BooruClient {
    client: reqwest::Client,
    api_url: Url,
}

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("upstream returned a body that is not a JSON array")]
    InvalidBody,
}

impl BooruClient {
    pub fn new(api_url: &str, user_agent: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let api_url =
            Url::parse(api_url).map_err(|e| UpstreamError::InvalidUrl(format!("{api_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        Ok(Self { client, api_url })
    }

    pub fn from_config(config: &Config) -> Result<Self, UpstreamError> {
        Self::new(
            &config.booru_api_url,
            &config.user_agent,
            config.request_timeout,
        )
    }

    /// Fetches one page as raw text. Non-2xx statuses are errors; the body
    /// itself is not interpreted.
    pub async fn fetch_page_text(
        &self,
        tags: &str,
        page: u32,
        limit: u32,
    ) -> Result<String, UpstreamError> {
        let response = self
            .client
            .get(self.api_url.clone())
            .query(&[
                ("page", "dapi"),
                ("s", "post"),
                ("q", "index"),
                ("json", "1"),
                ("tags", tags),
            ])
            .query(&[("pid", page), ("limit", limit)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("upstream returned {status} for tags={tags:?} pid={page}");
            return Err(UpstreamError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }

    /// Fetches and decodes one page of posts. An empty body is an empty page.
    pub async fn list_posts(
        &self,
        tags: &str,
        page: u32,
        limit: u32,
    ) -> Result<DecodedPage, ListError> {
        let body = self.fetch_page_text(tags, page, limit).await?;
        match PageBody::parse(&body) {
            PageBody::Empty => Ok(DecodedPage::default()),
            PageBody::Records(records) => {
                let decoded = decode_posts(records);
                if decoded.rejected > 0 {
                    log::warn!(
                        "page {page} for {tags:?}: kept {} posts, rejected {}",
                        decoded.posts.len(),
                        decoded.rejected
                    );
                }
                Ok(decoded)
            }
            PageBody::NotAnArray => Err(ListError::InvalidBody),
            PageBody::Malformed(e) => {
                log::error!("failed to parse JSON from upstream for {tags:?} pid={page}: {e}");
                Err(ListError::InvalidBody)
            }
        }
    }

    pub async fn find_post(&self, id: u64) -> Result<Option<Post>, ListError> {
        let page = self.list_posts(&format!("id:{id}"), 0, 1).await?;
        Ok(page.posts.into_iter().find(|post| post.id == id))
    }
}

#[async_trait]
impl PageSource for BooruClient {
    async fn fetch_page(&self, tags: &str, page: u32, limit: u32) -> Result<String, UpstreamError> {
        self.fetch_page_text(tags, page, limit).await
    }
}
