use serde::{Deserialize, Serialize};

use crate::data_models::{Post, ProbeResult};
use crate::media::MediaKind;

#[derive(Debug, Deserialize)]
pub struct PostsParams {
    pub tags: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub filter_ai: bool,
}

#[derive(Debug, Deserialize)]
pub struct CountParams {
    pub tags: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub filter_ai: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    pub total_posts: u64,
    pub is_estimate: bool,
    pub pages_checked: u32,
}

impl From<ProbeResult> for CountResponse {
    fn from(result: ProbeResult) -> Self {
        CountResponse {
            total_posts: result.total_count,
            is_estimate: result.is_estimate,
            pages_checked: result.pages_checked,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDetail {
    pub post: Post,
    pub media_kind: MediaKind,
    pub post_url: String,
    pub download_filename: String,
    pub download_url: String,
    pub proxy_url: String,
}

#[derive(Debug, Deserialize)]
pub struct TagsParams {
    pub names: Option<String>,
    #[serde(default)]
    pub grouped: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProxyParams {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub url: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
