use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagCategory {
    Artist,
    Character,
    Copyright,
    General,
    Meta,
}

impl TagCategory {
    /// Maps a remote type name onto a category; anything unrecognised is
    /// general.
    pub fn from_type_name(name: &str) -> TagCategory {
        match name.trim().to_ascii_lowercase().as_str() {
            "artist" => TagCategory::Artist,
            "character" => TagCategory::Character,
            "copyright" => TagCategory::Copyright,
            "meta" | "metadata" => TagCategory::Meta,
            _ => TagCategory::General,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagInfo {
    pub name: String,
    pub types: Vec<TagCategory>,
    pub posts: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupedTags {
    pub artist: Vec<String>,
    pub character: Vec<String>,
    pub copyright: Vec<String>,
    pub general: Vec<String>,
    pub meta: Vec<String>,
}

/// Buckets a space separated tag string by the first known type of each tag.
pub fn group_by_category(tags: &str, info: &BTreeMap<String, TagInfo>) -> GroupedTags {
    let mut grouped = GroupedTags::default();
    for tag in tags.split_whitespace() {
        let category = info
            .get(tag)
            .and_then(|i| i.types.first().copied())
            .unwrap_or(TagCategory::General);
        let bucket = match category {
            TagCategory::Artist => &mut grouped.artist,
            TagCategory::Character => &mut grouped.character,
            TagCategory::Copyright => &mut grouped.copyright,
            TagCategory::General => &mut grouped.general,
            TagCategory::Meta => &mut grouped.meta,
        };
        bucket.push(tag.to_string());
    }
    grouped
}

/// Decides what kind of tag a string is. Swappable so a real lookup can
/// replace the heuristics without touching callers.
pub trait TagClassifier: Send + Sync {
    fn classify(&self, tag: &str) -> TagCategory;
}

static PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(character:|artist:|copyright:|char:|copy:|art:|meta:)").unwrap()
});
static ARTIST_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_(artist|style)$").unwrap());

const META_TAGS: &[&str] = &[
    "highres",
    "absurdres",
    "translated",
    "commentary",
    "english_commentary",
    "source_request",
    "md5_mismatch",
    "duplicate",
    "animated",
    "video",
    "sound",
    "webm",
    "mp4",
    "3d",
    "2d",
    "has_audio",
    "loop",
    "pixel_art",
];

const COPYRIGHT_PATTERNS: &[&str] = &[
    "pokemon",
    "nintendo",
    "disney",
    "marvel",
    "dc_comics",
    "anime",
    "game",
    "series",
    "movie",
    "cartoon",
];

/// Pattern based guesser. The checks run in a fixed order and the first hit
/// wins; it only has to look plausible.
#[derive(Debug, Default)]
pub struct HeuristicClassifier;

impl TagClassifier for HeuristicClassifier {
    fn classify(&self, tag: &str) -> TagCategory {
        let clean = PREFIX_RE.replace(tag, "");

        // "name_(series)"
        if tag.contains("_(") && tag.contains(')') {
            return TagCategory::Character;
        }
        if META_TAGS.contains(&&*clean) {
            return TagCategory::Meta;
        }
        if ARTIST_SUFFIX_RE.is_match(tag) {
            return TagCategory::Artist;
        }
        if COPYRIGHT_PATTERNS.iter().any(|p| clean.contains(p)) {
            return TagCategory::Copyright;
        }
        TagCategory::General
    }
}

#[derive(Debug, Deserialize)]
struct RemoteTag {
    name: String,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    posts: Option<serde_json::Value>,
}

/// Tag metadata: asks the remote tag API first and classifies whatever it
/// did not answer for.
pub struct TagService {
    client: reqwest::Client,
    lookup_url: Option<String>,
    classifier: Arc<dyn TagClassifier>,
}

impl TagService {
    pub fn new(
        lookup_url: Option<String>,
        user_agent: &str,
        timeout: Duration,
        classifier: Arc<dyn TagClassifier>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            lookup_url: lookup_url.map(|u| u.trim_end_matches('/').to_string()),
            classifier,
        })
    }

    pub async fn describe(&self, names: &[String]) -> BTreeMap<String, TagInfo> {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut found = BTreeMap::new();

        if let Some(url) = &self.lookup_url {
            match self.lookup_remote(url, names).await {
                Ok(remote) => {
                    for tag in remote {
                        if !wanted.contains(tag.name.as_str()) {
                            continue;
                        }
                        let types = if tag.types.is_empty() {
                            vec![TagCategory::General]
                        } else {
                            tag.types.iter().map(|t| TagCategory::from_type_name(t)).collect()
                        };
                        let posts = match tag.posts {
                            Some(serde_json::Value::String(s)) => s,
                            Some(serde_json::Value::Number(n)) => n.to_string(),
                            _ => "0".to_string(),
                        };
                        found.insert(
                            tag.name.clone(),
                            TagInfo {
                                name: tag.name,
                                types,
                                posts,
                            },
                        );
                    }
                }
                Err(e) => log::info!("remote tag lookup failed, using heuristics: {e:#}"),
            }
        }

        for name in names {
            if !found.contains_key(name) {
                found.insert(
                    name.clone(),
                    TagInfo {
                        name: name.clone(),
                        types: vec![self.classifier.classify(name)],
                        posts: "0".to_string(),
                    },
                );
            }
        }
        found
    }

    async fn lookup_remote(&self, url: &str, names: &[String]) -> anyhow::Result<Vec<RemoteTag>> {
        let response = self
            .client
            .get(format!("{url}/tags"))
            .query(&[("name", names.join(" "))])
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        match body {
            serde_json::Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect()),
            _ => anyhow::bail!("tag API did not return an array"),
        }
    }
}
