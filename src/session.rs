//! Per-session analysis context.
//!
//! Each interactive session keeps only its last analysis. The store is owned
//! by the request-handling layer and passed explicitly; there is no
//! process-wide mutable state. Sessions expire after a sliding TTL.

use anyhow::{anyhow, Result};
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::pipeline::AnalysisResult;

pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60 * 24;
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

/// Opaque random session identifier (32 bytes, hex encoded).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accept only well-formed identifiers.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        match hex::decode(value) {
            Ok(bytes) if bytes.len() == 32 => Some(Self(value.to_ascii_lowercase())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct SessionEntry {
    last_analysis: Option<AnalysisResult>,
    last_seen: Instant,
}

pub struct SessionStore {
    sessions: HashMap<SessionId, SessionEntry>,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_SESSIONS)
    }

    pub fn with_capacity(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Start a new session. Evicts the least recently seen session when full.
    pub fn create(&mut self) -> SessionId {
        self.prune_expired();
        if self.sessions.len() >= self.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                log::debug!("session store full, evicting least recent session");
                self.sessions.remove(&id);
            }
        }
        let id = SessionId::generate();
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                last_analysis: None,
                last_seen: Instant::now(),
            },
        );
        id
    }

    /// Refresh a live session. Returns false for unknown or expired sessions.
    pub fn touch(&mut self, id: &SessionId) -> bool {
        self.live_entry(id).is_some()
    }

    /// Replace the session's last analysis.
    pub fn store_analysis(&mut self, id: &SessionId, result: AnalysisResult) -> Result<()> {
        let entry = self
            .live_entry(id)
            .ok_or_else(|| anyhow!("session not found or expired"))?;
        entry.last_analysis = Some(result);
        Ok(())
    }

    pub fn last_analysis(&mut self, id: &SessionId) -> Option<&AnalysisResult> {
        self.live_entry(id)
            .and_then(|entry| entry.last_analysis.as_ref())
    }

    /// End a session and drop its analysis.
    pub fn clear(&mut self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Drop expired sessions; returns how many were removed.
    pub fn prune_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| entry.last_seen.elapsed() <= ttl);
        before - self.sessions.len()
    }

    fn live_entry(&mut self, id: &SessionId) -> Option<&mut SessionEntry> {
        let expired = self
            .sessions
            .get(id)
            .map(|entry| entry.last_seen.elapsed() > self.ttl)?;
        if expired {
            self.sessions.remove(id);
            return None;
        }
        let entry = self.sessions.get_mut(id)?;
        entry.last_seen = Instant::now();
        Some(entry)
    }
}
