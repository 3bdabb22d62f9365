use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Tag excluded when the AI-content filter is on.
pub const AI_FILTER_TAG: &str = "ai*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMode {
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSearchTag")]
pub struct SearchTag {
    tag: String,
    mode: TagMode,
}

#[derive(Deserialize)]
struct RawSearchTag {
    tag: String,
    mode: TagMode,
}

impl TryFrom<RawSearchTag> for SearchTag {
    type Error = QueryError;

    fn try_from(raw: RawSearchTag) -> Result<Self, Self::Error> {
        SearchTag::new(&raw.tag, raw.mode)
    }
}

impl SearchTag {
    /// Upstream tags never contain spaces, so they are folded to underscores.
    pub fn new(tag: &str, mode: TagMode) -> Result<SearchTag, QueryError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(QueryError::EmptyTag);
        }
        Ok(SearchTag {
            tag: tag.replace(' ', "_"),
            mode,
        })
    }

    pub fn include(tag: &str) -> Result<SearchTag, QueryError> {
        Self::new(tag, TagMode::Include)
    }

    pub fn exclude(tag: &str) -> Result<SearchTag, QueryError> {
        Self::new(tag, TagMode::Exclude)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn mode(&self) -> TagMode {
        self.mode
    }
}

impl fmt::Display for SearchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            TagMode::Include => write!(f, "{}", self.tag),
            TagMode::Exclude => write!(f, "-{}", self.tag),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SortOrder {
    Field {
        field: String,
        direction: SortDirection,
    },
    Random,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Field {
            field: "id".to_string(),
            direction: SortDirection::Desc,
        }
    }
}

impl FromStr for SortOrder {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("random") {
            return Ok(SortOrder::Random);
        }
        let invalid = || QueryError::InvalidSort(s.to_string());
        let (field, direction) = s.split_once(':').ok_or_else(invalid)?;
        if field.is_empty()
            || !field
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid());
        }
        let direction = match direction.to_ascii_lowercase().as_str() {
            "asc" => SortDirection::Asc,
            "desc" => SortDirection::Desc,
            _ => return Err(invalid()),
        };
        Ok(SortOrder::Field {
            field: field.to_ascii_lowercase(),
            direction,
        })
    }
}

impl TryFrom<String> for SortOrder {
    type Error = QueryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SortOrder> for String {
    fn from(sort: SortOrder) -> String {
        sort.to_string()
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Random => write!(f, "random"),
            SortOrder::Field { field, direction } => {
                let direction = match direction {
                    SortDirection::Asc => "asc",
                    SortDirection::Desc => "desc",
                };
                write!(f, "{field}:{direction}")
            }
        }
    }
}

/// A tag search as the user built it. Conflicting duplicates are passed
/// through to the upstream untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    tags: Vec<SearchTag>,
    sort: SortOrder,
    filter_ai: bool,
}

impl Query {
    pub fn new(
        tags: Vec<SearchTag>,
        sort: SortOrder,
        filter_ai: bool,
    ) -> Result<Query, QueryError> {
        if tags.is_empty() && !filter_ai {
            return Err(QueryError::EmptyQuery);
        }
        Ok(Query {
            tags,
            sort,
            filter_ai,
        })
    }

    /// Parses the upstream tag syntax: whitespace separated, `-` prefix for
    /// exclusions.
    pub fn parse(tags: &str, sort: &str, filter_ai: bool) -> Result<Query, QueryError> {
        let tags = tags
            .split_whitespace()
            .map(|token| match token.strip_prefix('-') {
                Some(rest) => SearchTag::exclude(rest),
                None => SearchTag::include(token),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sort = if sort.trim().is_empty() {
            SortOrder::default()
        } else {
            sort.parse()?
        };
        Self::new(tags, sort, filter_ai)
    }

    pub fn tags(&self) -> &[SearchTag] {
        &self.tags
    }

    pub fn sort(&self) -> &SortOrder {
        &self.sort
    }

    pub fn filter_ai(&self) -> bool {
        self.filter_ai
    }

    /// Effective tags, with the hidden AI exclusion appended when needed.
    pub fn effective_tags(&self) -> Vec<SearchTag> {
        let mut tags = self.tags.clone();
        let has_ai_filter = tags
            .iter()
            .any(|t| t.mode == TagMode::Exclude && t.tag == AI_FILTER_TAG);
        if self.filter_ai && !has_ai_filter {
            tags.push(SearchTag {
                tag: AI_FILTER_TAG.to_string(),
                mode: TagMode::Exclude,
            });
        }
        tags
    }

    /// The tag string without the sort clause.
    pub fn tag_string(&self) -> String {
        self.effective_tags()
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The full `tags` parameter sent upstream, sort clause included.
    pub fn upstream_tags(&self) -> String {
        format!("{} sort:{}", self.tag_string(), self.sort)
    }
}
