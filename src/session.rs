use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::query::{Query, SearchTag, SortOrder};

/// What one browser session is currently searching for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchState {
    pub tags: Vec<SearchTag>,
    pub sort_order: SortOrder,
    #[serde(rename = "filterAI")]
    pub filter_ai: bool,
    pub total_count: Option<u64>,
    pub scroll_position: u32,
}

impl Default for SearchState {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            sort_order: SortOrder::default(),
            filter_ai: false,
            total_count: None,
            scroll_position: 0,
        }
    }
}

impl SearchState {
    pub fn to_query(&self) -> Result<Query, QueryError> {
        Query::new(self.tags.clone(), self.sort_order.clone(), self.filter_ai)
    }
}

/// Partial update. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStatePatch {
    pub tags: Option<Vec<SearchTag>>,
    pub sort_order: Option<SortOrder>,
    #[serde(rename = "filterAI")]
    pub filter_ai: Option<bool>,
    pub scroll_position: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SearchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub counting: bool,
}

struct SessionEntry {
    state: SearchState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// Bumped whenever the query changes or a new probe starts.
    generation: u64,
    in_flight: Option<CancellationToken>,
}

impl SessionEntry {
    fn snapshot(&self, id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            state: self.state.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            counting: self.in_flight.is_some(),
        }
    }

    fn cancel_in_flight(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
    }
}

/// Binds one probe run to one generation of a session's query.
#[derive(Debug, Clone)]
pub struct ProbeTicket {
    session_id: String,
    generation: u64,
    token: CancellationToken,
}

impl ProbeTicket {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Holds a running probe open. Dropping it before [`ProbeGuard::finish`]
/// (say, the client went away mid-count) cancels the probe and clears the
/// session's `counting` flag.
pub struct ProbeGuard<'a> {
    store: &'a SessionStore,
    ticket: ProbeTicket,
}

impl ProbeGuard<'_> {
    pub fn ticket(&self) -> &ProbeTicket {
        &self.ticket
    }

    pub fn finish(&self, total_count: Option<u64>) -> bool {
        self.store.finish_probe(&self.ticket, total_count)
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.store.abandon_probe(&self.ticket);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Per-session search state. Owned by the application state and handed to
/// the handlers; sessions live from the first search until torn down.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn create(&self) -> SessionSnapshot {
        let id = nanoid!();
        let now = Utc::now();
        let entry = SessionEntry {
            state: SearchState::default(),
            created_at: now,
            updated_at: now,
            generation: 0,
            in_flight: None,
        };
        let snapshot = entry.snapshot(&id);
        self.sessions.insert(id.clone(), entry);
        log::info!("created session {id}");
        snapshot
    }

    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|entry| entry.snapshot(id))
    }

    /// Applies a patch. Changing the tags, the sort or the AI filter drops
    /// the known count and cancels any probe still running for the old query.
    pub fn update(&self, id: &str, patch: SearchStatePatch) -> Result<SessionSnapshot, SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let mut next = entry.state.clone();
        if let Some(tags) = patch.tags {
            next.tags = tags;
        }
        if let Some(sort) = patch.sort_order {
            next.sort_order = sort;
        }
        if let Some(filter_ai) = patch.filter_ai {
            next.filter_ai = filter_ai;
        }
        if let Some(pos) = patch.scroll_position {
            next.scroll_position = pos;
        }

        let query_changed = next.tags != entry.state.tags
            || next.sort_order != entry.state.sort_order
            || next.filter_ai != entry.state.filter_ai;
        if query_changed {
            next.total_count = None;
            next.scroll_position = patch.scroll_position.unwrap_or(0);
            entry.generation += 1;
            entry.cancel_in_flight();
        }
        entry.state = next;
        entry.updated_at = Utc::now();
        Ok(entry.snapshot(id))
    }

    /// Tears a session down, abandoning its probe if one is running.
    pub fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, mut entry)) => {
                entry.cancel_in_flight();
                log::info!("removed session {id}");
                true
            }
            None => false,
        }
    }

    /// Starts a probe for the session's current query. A probe already
    /// running for this session is cancelled.
    pub fn begin_probe(&self, id: &str) -> Result<(ProbeTicket, Query), SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let query = entry.state.to_query()?;

        entry.cancel_in_flight();
        entry.generation += 1;
        entry.state.total_count = None;
        let token = CancellationToken::new();
        entry.in_flight = Some(token.clone());

        let ticket = ProbeTicket {
            session_id: id.to_string(),
            generation: entry.generation,
            token,
        };
        Ok((ticket, query))
    }

    /// Like [`begin_probe`](Self::begin_probe), but the probe is abandoned
    /// when the returned guard is dropped.
    pub fn guard_probe(&self, id: &str) -> Result<(ProbeGuard<'_>, Query), SessionError> {
        let (ticket, query) = self.begin_probe(id)?;
        Ok((ProbeGuard { store: self, ticket }, query))
    }

    /// Cancels the ticket's probe. Clears `counting` if the ticket still
    /// owns the session's in-flight slot; a finished or superseded ticket
    /// leaves the session untouched.
    pub fn abandon_probe(&self, ticket: &ProbeTicket) {
        ticket.token.cancel();
        let Some(mut entry) = self.sessions.get_mut(&ticket.session_id) else {
            return;
        };
        if entry.generation == ticket.generation && entry.in_flight.is_some() {
            log::debug!("abandoning count for session {}", ticket.session_id);
            entry.in_flight = None;
        }
    }

    /// Records a finished probe. Returns `false`, leaving the session alone,
    /// when the ticket belongs to an older query or probe.
    pub fn finish_probe(&self, ticket: &ProbeTicket, total_count: Option<u64>) -> bool {
        let Some(mut entry) = self.sessions.get_mut(&ticket.session_id) else {
            return false;
        };
        if entry.generation != ticket.generation || ticket.token.is_cancelled() {
            log::debug!(
                "discarding stale count for session {} (generation {} != {})",
                ticket.session_id,
                ticket.generation,
                entry.generation
            );
            return false;
        }
        entry.in_flight = None;
        entry.state.total_count = total_count;
        entry.updated_at = Utc::now();
        true
    }
}
