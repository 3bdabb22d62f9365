use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One post record as returned by the upstream listing endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Post {
    pub id: u64,
    #[serde(default)]
    pub tags: String,
    pub file_url: String,
    pub preview_url: String,
    pub width: u32,
    pub height: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Post {
    pub fn tag_list(&self) -> impl Iterator<Item = &str> {
        self.tags.split_whitespace()
    }
}

/// Outcome of one count probe. Built once, never mutated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub total_count: u64,
    pub is_estimate: bool,
    pub pages_checked: u32,
}

#[derive(Debug, Default)]
pub struct DecodedPage {
    pub posts: Vec<Post>,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageBody {
    /// Empty body, which the upstream sends once a query runs out of posts.
    Empty,
    Records(Vec<Value>),
    /// Valid JSON that is not an array.
    NotAnArray,
    Malformed(String),
}

impl PageBody {
    pub fn parse(body: &str) -> PageBody {
        if body.trim().is_empty() {
            return PageBody::Empty;
        }
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(records)) => PageBody::Records(records),
            Ok(_) => PageBody::NotAnArray,
            Err(e) => PageBody::Malformed(e.to_string()),
        }
    }

    /// Number of records on the page. Anything that is not an array counts
    /// as zero.
    pub fn record_count(&self) -> usize {
        match self {
            PageBody::Records(records) => records.len(),
            _ => 0,
        }
    }
}

/// Decodes each record on its own; a record that does not fit [`Post`] is
/// logged and skipped instead of failing the page.
pub fn decode_posts(records: Vec<Value>) -> DecodedPage {
    let mut page = DecodedPage::default();
    for (idx, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<Post>(record) {
            Ok(post) => page.posts.push(post),
            Err(e) => {
                log::warn!("rejecting malformed post record at index {idx}: {e}");
                page.rejected += 1;
            }
        }
    }
    page
}
