use std::time::Duration;

use reqwest::Url;
use reqwest::header::{ACCEPT, ACCEPT_ENCODING, RANGE, REFERER};
use serde::Serialize;

use crate::data_models::Post;
use crate::error::UpstreamError;

const VIDEO_EXTENSIONS: &[&str] = &["webm", "mp4", "mov", "avi", "mkv", "m4v"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Gif,
    Video,
}

/// Lowercased extension of the url's path, ignoring any query string.
fn path_extension(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    };
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

pub fn is_video_file(url: &str) -> bool {
    path_extension(url).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_gif_file(url: &str) -> bool {
    path_extension(url).is_some_and(|ext| ext == "gif")
}

pub fn media_kind(url: &str) -> MediaKind {
    if is_video_file(url) {
        MediaKind::Video
    } else if is_gif_file(url) {
        MediaKind::Gif
    } else {
        MediaKind::Image
    }
}

/// Falls back to `mp4` when the url has no extension.
pub fn file_extension(url: &str) -> String {
    path_extension(url).unwrap_or_else(|| "mp4".to_string())
}

pub fn download_filename(post: &Post) -> String {
    format!("post_{}.{}", post.id, file_extension(&post.file_url))
}

pub fn post_page_url(site_url: &str, post_id: u64) -> String {
    format!(
        "{}/index.php?page=post&s=view&id={post_id}",
        site_url.trim_end_matches('/')
    )
}

/// Keeps a filename safe to drop into a `Content-Disposition` header.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' | '/' | '\r' | '\n' | ';' => '_',
            c if c.is_control() || !c.is_ascii() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

/// Hosts the proxy and download endpoints are willing to fetch from.
#[derive(Debug, Clone)]
pub struct MediaPolicy {
    allowed_hosts: Vec<String>,
}

impl MediaPolicy {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// An allowed host or any of its subdomains, over http(s) only.
    pub fn allows(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.allowed_hosts
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
    }
}

#[derive(Debug)]
pub enum MediaRequestError {
    InvalidUrl(String),
    Forbidden,
    Upstream(UpstreamError),
}

/// Fetches media on behalf of browsers that cannot do it cross-origin.
#[derive(Debug, Clone)]
pub struct MediaClient {
    client: reqwest::Client,
    policy: MediaPolicy,
    referer: String,
}

impl MediaClient {
    pub fn new(
        policy: MediaPolicy,
        site_url: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        Ok(Self {
            client,
            policy,
            referer: format!("{}/", site_url.trim_end_matches('/')),
        })
    }

    fn checked_url(&self, raw: &str) -> Result<Url, MediaRequestError> {
        let url = Url::parse(raw.trim()).map_err(|e| MediaRequestError::InvalidUrl(e.to_string()))?;
        if !self.policy.allows(&url) {
            log::warn!("refusing to fetch media from {url}");
            return Err(MediaRequestError::Forbidden);
        }
        Ok(url)
    }

    /// Starts a streaming fetch, forwarding the caller's `Range` header.
    /// The response is returned whatever its status.
    pub async fn proxy(
        &self,
        raw_url: &str,
        range: Option<&str>,
    ) -> Result<reqwest::Response, MediaRequestError> {
        let url = self.checked_url(raw_url)?;
        let mut request = self
            .client
            .get(url)
            .header(REFERER, &self.referer)
            .header(ACCEPT, "*/*")
            .header(ACCEPT_ENCODING, "identity");
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        request
            .send()
            .await
            .map_err(|e| MediaRequestError::Upstream(e.into()))
    }

    pub async fn download(&self, raw_url: &str) -> Result<reqwest::Response, MediaRequestError> {
        let url = self.checked_url(raw_url)?;
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| MediaRequestError::Upstream(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: u64, file_url: &str) -> Post {
        serde_json::from_value(serde_json::json!({
            "id": id, "file_url": file_url, "preview_url": "p", "width": 1, "height": 1
        }))
        .unwrap()
    }

    #[test]
    fn test_media_kind_detection() {
        assert_eq!(media_kind("https://x.rule34.xxx/images/1/abc.webm"), MediaKind::Video);
        assert_eq!(media_kind("https://x.rule34.xxx/images/1/abc.MP4?123"), MediaKind::Video);
        assert_eq!(media_kind("https://x.rule34.xxx/images/1/abc.gif"), MediaKind::Gif);
        assert_eq!(media_kind("https://x.rule34.xxx/images/1/abc.jpeg"), MediaKind::Image);
        assert_eq!(media_kind("not a url.mkv"), MediaKind::Video);
    }

    #[test]
    fn test_download_filename() {
        assert_eq!(
            download_filename(&post(77, "https://x.rule34.xxx/images/1/abc.png?77")),
            "post_77.png"
        );
        assert_eq!(download_filename(&post(5, "https://x.rule34.xxx/noext")), "post_5.mp4");
    }

    #[test]
    fn test_post_page_url() {
        assert_eq!(
            post_page_url("https://rule34.xxx/", 12),
            "https://rule34.xxx/index.php?page=post&s=view&id=12"
        );
    }

    #[test]
    fn test_policy_matches_host_and_subdomains_only() {
        let policy = MediaPolicy::new(vec!["rule34.xxx".to_string()]);
        let allowed = |s: &str| policy.allows(&Url::parse(s).unwrap());
        assert!(allowed("https://rule34.xxx/a.png"));
        assert!(allowed("https://api-cdn.rule34.xxx/a.png"));
        assert!(allowed("https://US.rule34.xxx/a.png"));
        assert!(!allowed("https://evilrule34.xxx/a.png"));
        assert!(!allowed("https://rule34.xxx.evil.com/a.png"));
        assert!(!allowed("ftp://rule34.xxx/a.png"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("post_1.png"), "post_1.png");
        assert_eq!(sanitize_filename("a\"b\r\nc.png"), "a_b__c.png");
        assert_eq!(sanitize_filename("../../etc"), "_.._etc");
        assert_eq!(sanitize_filename("café.png"), "caf_.png");
        assert_eq!(sanitize_filename("   "), "download");
    }
}
