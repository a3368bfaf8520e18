//! In-memory session state keyed by session ID
//!
//! One entry per active session, mutated under the entry's shard lock so
//! concurrent sessions never contend with each other.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::session::Turn;

/// State tracked for a single session
#[derive(Debug, Clone)]
struct SessionState {
    history: Vec<Turn>,
    last_summary_time: DateTime<Utc>,
    persona_id: Option<String>,
}

/// Point-in-time view of a session, taken for the idle sweep
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub last_summary_time: DateTime<Utc>,
    pub persona_id: Option<String>,
}

/// Concurrent map of per-session conversation state
pub struct SessionStore {
    sessions: DashMap<String, SessionState>,
    /// Maximum retained turns per session; 0 means unbounded
    max_history: usize,
}

impl SessionStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_history,
        }
    }

    /// Ensure a session exists, seeding its history from the caller-supplied
    /// turns on first sight. Returns true if the session was created.
    pub fn get_or_init(&self, session_id: &str, seed: &[Turn]) -> bool {
        if self.sessions.contains_key(session_id) {
            return false;
        }

        let mut history = seed.to_vec();
        Self::trim(&mut history, self.max_history);

        self.sessions.insert(
            session_id.to_string(),
            SessionState {
                history,
                last_summary_time: Utc::now(),
                persona_id: None,
            },
        );
        tracing::debug!(session_id, "Initialized session state");
        true
    }

    /// Append a turn to a session's history, trimming the oldest turns once
    /// the configured bound is exceeded. Missing sessions are created.
    pub fn append(&self, session_id: &str, turn: Turn) {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState {
                history: Vec::new(),
                last_summary_time: Utc::now(),
                persona_id: None,
            });
        entry.history.push(turn);
        let max = self.max_history;
        Self::trim(&mut entry.history, max);
    }

    fn trim(history: &mut Vec<Turn>, max: usize) {
        if max > 0 && history.len() > max {
            let excess = history.len() - max;
            history.drain(..excess);
        }
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn history_len(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|s| s.history.len())
            .unwrap_or(0)
    }

    /// The most recent `limit` turns, oldest first. `limit` of 0 returns
    /// nothing.
    pub fn recent_turns(&self, session_id: &str, limit: usize) -> Vec<Turn> {
        let Some(state) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        if limit == 0 {
            return Vec::new();
        }
        let skip = state.history.len().saturating_sub(limit);
        state.history[skip..].to_vec()
    }

    pub fn last_summary_time(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.get(session_id).map(|s| s.last_summary_time)
    }

    pub fn set_last_summary_time(&self, session_id: &str, time: DateTime<Utc>) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.last_summary_time = time;
        }
    }

    /// Record the persona last seen on this session, for triggers that fire
    /// without a live conversation event.
    pub fn set_persona(&self, session_id: &str, persona_id: Option<String>) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.persona_id = persona_id;
        }
    }

    pub fn persona(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.persona_id.clone())
    }

    /// Snapshot every session's sweep-relevant fields without holding locks
    /// across await points.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| SessionSnapshot {
                session_id: entry.key().clone(),
                last_summary_time: entry.value().last_summary_time,
                persona_id: entry.value().persona_id.clone(),
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
