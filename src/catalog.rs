//! Session catalog
//!
//! Per-user sliding-window catalog of chat sessions. Each user holds at
//! most `cap` sessions; inserting past the cap evicts the session with the
//! numerically smallest id. Locally-minted ids continue from the highest
//! id upstream had assigned at login, and upstream titles always win over
//! local ones during index reconciliation.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::now_ms;

/// Where a session entry's title last came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Local,
    Upstream,
    LocalUpdatedFromUpstream,
}

/// One catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: String,
    pub title: String,
    pub owner_user_id: String,
    pub current_chat_id: String,
    pub total_chats: u64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub source: SessionSource,
}

impl SessionEntry {
    fn local(user_id: &str, id: &str) -> Self {
        let now = now_ms();
        Self {
            id: id.to_string(),
            title: format!("Chat Session {id}"),
            owner_user_id: user_id.to_string(),
            current_chat_id: "1".to_string(),
            total_chats: 0,
            created_at_ms: now,
            updated_at_ms: now,
            source: SessionSource::Local,
        }
    }
}

/// Result of inserting or updating a session.
#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    pub created: bool,
    /// The session displaced by the sliding window, if any.
    pub evicted: Option<SessionEntry>,
    /// Set when the catalog is now full: the next insert will evict.
    pub eviction_warning: bool,
}

/// A session id/title pair from the upstream index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedSession {
    pub id: String,
    pub title: String,
    pub created_at_ms: Option<i64>,
}

fn numeric(id: &str) -> u64 {
    id.trim().parse::<u64>().unwrap_or(0)
}

/// Per-user session catalog with sliding-window eviction.
pub struct SessionCatalog {
    cap: usize,
    sessions: RwLock<HashMap<String, Vec<SessionEntry>>>,
    /// Local id counter per user, re-seeded at login.
    counters: Mutex<HashMap<String, u64>>,
    /// Highest upstream-assigned session id per user at login.
    cursors: Mutex<HashMap<String, u64>>,
}

impl SessionCatalog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            sessions: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Record the upstream id cursor at login and re-seed the local counter.
    pub fn seed_cursor(&self, user_id: &str, last_upstream_session_id: u64) {
        self.cursors
            .lock()
            .insert(user_id.to_string(), last_upstream_session_id);
        self.counters
            .lock()
            .insert(user_id.to_string(), last_upstream_session_id);
    }

    /// Mint the next local session id for a user.
    ///
    /// Ids are strictly increasing and strictly greater than the upstream
    /// cursor recorded at login.
    pub fn mint_session_id(&self, user_id: &str) -> String {
        let cursor = self.cursors.lock().get(user_id).copied().unwrap_or(0);
        let mut counters = self.counters.lock();
        let counter = counters.entry(user_id.to_string()).or_insert(0);
        let next = (*counter).max(cursor) + 1;
        *counter = next;
        next.to_string()
    }

    /// Mint a new session and insert it, applying the sliding window.
    pub fn mint_session(&self, user_id: &str) -> (SessionEntry, UpsertOutcome) {
        let id = self.mint_session_id(user_id);
        let entry = SessionEntry::local(user_id, &id);
        let outcome = self.insert_front(user_id, entry.clone());
        (entry, outcome)
    }

    /// Create or update the session a chat is landing in.
    pub fn upsert_for_chat(&self, user_id: &str, session_id: &str, chat_id: &str) -> UpsertOutcome {
        {
            let mut sessions = self.sessions.write();
            if let Some(entries) = sessions.get_mut(user_id) {
                if let Some(entry) = entries.iter_mut().find(|e| e.id == session_id) {
                    entry.updated_at_ms = now_ms();
                    entry.current_chat_id = chat_id.to_string();
                    entry.total_chats += 1;
                    return UpsertOutcome {
                        created: false,
                        evicted: None,
                        eviction_warning: entries.len() >= self.cap,
                    };
                }
            }
        }
        let mut entry = SessionEntry::local(user_id, session_id);
        entry.current_chat_id = chat_id.to_string();
        entry.total_chats = 1;
        // Keep the counter ahead of externally supplied ids so minting never
        // collides with a session the client named itself.
        {
            let mut counters = self.counters.lock();
            let counter = counters.entry(user_id.to_string()).or_insert(0);
            *counter = (*counter).max(numeric(session_id));
        }
        let mut outcome = self.insert_front(user_id, entry);
        outcome.created = true;
        outcome
    }

    /// Insert at the front, evicting the numerically smallest id while over
    /// the cap.
    fn insert_front(&self, user_id: &str, entry: SessionEntry) -> UpsertOutcome {
        let mut sessions = self.sessions.write();
        let entries = sessions.entry(user_id.to_string()).or_default();

        let mut evicted = None;
        while entries.len() >= self.cap {
            let Some(min_pos) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| numeric(&e.id))
                .map(|(i, _)| i)
            else {
                break;
            };
            evicted = Some(entries.remove(min_pos));
        }

        entries.insert(0, entry);
        UpsertOutcome {
            created: true,
            evicted,
            eviction_warning: entries.len() >= self.cap,
        }
    }

    /// Merged view of the catalog and an upstream index payload, sorted by
    /// id descending. Pure read; used to answer the client before the
    /// catalog itself is updated.
    pub fn merge_with_index(&self, user_id: &str, index: &[IndexedSession]) -> Vec<SessionEntry> {
        let sessions = self.sessions.read();
        let mut merged: Vec<SessionEntry> = sessions.get(user_id).cloned().unwrap_or_default();
        for indexed in index {
            if let Some(entry) = merged.iter_mut().find(|e| e.id == indexed.id) {
                entry.title = indexed.title.clone();
                entry.source = match entry.source {
                    SessionSource::Local => SessionSource::LocalUpdatedFromUpstream,
                    _ => SessionSource::Upstream,
                };
            } else {
                let mut entry = SessionEntry::local(user_id, &indexed.id);
                entry.title = indexed.title.clone();
                entry.source = SessionSource::Upstream;
                if let Some(created) = indexed.created_at_ms {
                    entry.created_at_ms = created;
                }
                merged.push(entry);
            }
        }
        merged.sort_by(|a, b| numeric(&b.id).cmp(&numeric(&a.id)));
        merged.truncate(self.cap);
        merged
    }

    /// Reconcile the catalog against the upstream index. Upstream titles
    /// always overwrite local ones. Returns the sessions evicted to stay
    /// within the cap so callers can drop their transcripts.
    pub fn apply_upstream_index(
        &self,
        user_id: &str,
        index: &[IndexedSession],
    ) -> Vec<SessionEntry> {
        let mut sessions = self.sessions.write();
        let entries = sessions.entry(user_id.to_string()).or_default();

        for indexed in index {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == indexed.id) {
                entry.title = indexed.title.clone();
                entry.source = match entry.source {
                    SessionSource::Local => SessionSource::LocalUpdatedFromUpstream,
                    _ => SessionSource::Upstream,
                };
            } else {
                let mut entry = SessionEntry::local(user_id, &indexed.id);
                entry.title = indexed.title.clone();
                entry.source = SessionSource::Upstream;
                if let Some(created) = indexed.created_at_ms {
                    entry.created_at_ms = created;
                }
                entries.push(entry);
            }
        }

        entries.sort_by(|a, b| numeric(&b.id).cmp(&numeric(&a.id)));
        let mut evicted = Vec::new();
        while entries.len() > self.cap {
            if let Some(entry) = entries.pop() {
                evicted.push(entry);
            }
        }
        evicted
    }

    /// Overwrite one session's title with the upstream-generated name.
    pub fn set_title_from_upstream(&self, user_id: &str, session_id: &str, title: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(entries) = sessions.get_mut(user_id) else {
            return false;
        };
        let Some(entry) = entries.iter_mut().find(|e| e.id == session_id) else {
            return false;
        };
        entry.title = title.to_string();
        entry.source = match entry.source {
            SessionSource::Local => SessionSource::LocalUpdatedFromUpstream,
            other => other,
        };
        entry.updated_at_ms = now_ms();
        true
    }

    /// Catalog snapshot sorted by id descending.
    pub fn list(&self, user_id: &str) -> Vec<SessionEntry> {
        let mut entries = self
            .sessions
            .read()
            .get(user_id)
            .cloned()
            .unwrap_or_default();
        entries.sort_by(|a, b| numeric(&b.id).cmp(&numeric(&a.id)));
        entries
    }

    pub fn get(&self, user_id: &str, session_id: &str) -> Option<SessionEntry> {
        self.sessions
            .read()
            .get(user_id)
            .and_then(|entries| entries.iter().find(|e| e.id == session_id).cloned())
    }

    pub fn count(&self, user_id: &str) -> usize {
        self.sessions
            .read()
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Whether any entry came from upstream. A local-only catalog means the
    /// user has never opened history since login, so a fresh fetch is due.
    pub fn has_upstream_entries(&self, user_id: &str) -> bool {
        self.sessions
            .read()
            .get(user_id)
            .is_some_and(|entries| {
                entries
                    .iter()
                    .any(|e| !matches!(e.source, SessionSource::Local))
            })
    }

    pub fn remove(&self, user_id: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(entries) = sessions.get_mut(user_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != session_id);
        entries.len() != before
    }

    /// Next chat id within a session (counting from 1).
    pub fn next_chat_id(&self, user_id: &str, session_id: &str) -> u64 {
        self.get(user_id, session_id)
            .map(|e| e.total_chats + 1)
            .unwrap_or(1)
    }

    pub fn flush_all(&self) {
        self.sessions.write().clear();
        self.counters.lock().clear();
        self.cursors.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(id: &str, title: &str) -> IndexedSession {
        IndexedSession {
            id: id.to_string(),
            title: title.to_string(),
            created_at_ms: None,
        }
    }

    #[test]
    fn test_mint_ids_monotonic_above_cursor() {
        let catalog = SessionCatalog::new(10);
        catalog.seed_cursor("u1", 18);
        assert_eq!(catalog.mint_session_id("u1"), "19");
        assert_eq!(catalog.mint_session_id("u1"), "20");
        assert_eq!(catalog.mint_session_id("u1"), "21");
    }

    #[test]
    fn test_cursor_reseed_on_login() {
        let catalog = SessionCatalog::new(10);
        catalog.seed_cursor("u1", 3);
        assert_eq!(catalog.mint_session_id("u1"), "4");
        catalog.seed_cursor("u1", 40);
        assert_eq!(catalog.mint_session_id("u1"), "41");
    }

    #[test]
    fn test_sliding_window_evicts_smallest_id() {
        let catalog = SessionCatalog::new(10);
        for id in 5..=14 {
            catalog.upsert_for_chat("u1", &id.to_string(), "1");
        }
        assert_eq!(catalog.count("u1"), 10);

        let (entry, outcome) = catalog.mint_session("u1");
        assert_eq!(entry.id, "15");
        let evicted = outcome.evicted.expect("one session evicted");
        assert_eq!(evicted.id, "5");
        assert_eq!(catalog.count("u1"), 10);
        assert!(catalog.get("u1", "5").is_none());
    }

    #[test]
    fn test_warning_when_catalog_fills() {
        let catalog = SessionCatalog::new(10);
        for id in 1..=9 {
            let outcome = catalog.upsert_for_chat("u1", &id.to_string(), "1");
            assert!(!outcome.eviction_warning, "no warning below cap");
        }
        let outcome = catalog.upsert_for_chat("u1", "10", "1");
        assert!(outcome.eviction_warning, "tenth insert warns");
        assert!(outcome.evicted.is_none());
    }

    #[test]
    fn test_upsert_existing_bumps_chat_counters() {
        let catalog = SessionCatalog::new(10);
        catalog.upsert_for_chat("u1", "7", "1");
        let outcome = catalog.upsert_for_chat("u1", "7", "2");
        assert!(!outcome.created);

        let entry = catalog.get("u1", "7").unwrap();
        assert_eq!(entry.current_chat_id, "2");
        assert_eq!(entry.total_chats, 2);
    }

    #[test]
    fn test_upstream_title_always_wins() {
        let catalog = SessionCatalog::new(10);
        catalog.upsert_for_chat("u1", "15", "1");
        catalog.upsert_for_chat("u1", "14", "1");
        catalog.set_title_from_upstream("u1", "14", "Bug triage");

        let evicted = catalog.apply_upstream_index(
            "u1",
            &[
                indexed("15", "Debugging crash"),
                indexed("14", "Bug triage"),
                indexed("13", "Planning"),
            ],
        );
        assert!(evicted.is_empty());

        let list = catalog.list("u1");
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].id, "15");
        assert_eq!(list[0].title, "Debugging crash");
        assert_eq!(list[0].source, SessionSource::LocalUpdatedFromUpstream);
        assert_eq!(list[1].id, "14");
        assert_eq!(list[2].id, "13");
        assert_eq!(list[2].source, SessionSource::Upstream);
    }

    #[test]
    fn test_apply_index_enforces_cap() {
        let catalog = SessionCatalog::new(3);
        catalog.upsert_for_chat("u1", "1", "1");
        catalog.upsert_for_chat("u1", "2", "1");

        let evicted = catalog.apply_upstream_index(
            "u1",
            &[
                indexed("5", "a"),
                indexed("4", "b"),
                indexed("3", "c"),
            ],
        );
        let evicted_ids: Vec<&str> = evicted.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(evicted_ids, vec!["2", "1"]);
        assert_eq!(catalog.count("u1"), 3);
        assert_eq!(catalog.list("u1")[0].id, "5");
    }

    #[test]
    fn test_merge_with_index_does_not_mutate() {
        let catalog = SessionCatalog::new(10);
        catalog.upsert_for_chat("u1", "15", "1");

        let merged = catalog.merge_with_index("u1", &[indexed("15", "Renamed")]);
        assert_eq!(merged[0].title, "Renamed");
        // The catalog itself is untouched until apply runs.
        assert_eq!(catalog.get("u1", "15").unwrap().title, "Chat Session 15");
    }

    #[test]
    fn test_has_upstream_entries_cache_policy() {
        let catalog = SessionCatalog::new(10);
        catalog.upsert_for_chat("u1", "1", "1");
        assert!(!catalog.has_upstream_entries("u1"));

        catalog.apply_upstream_index("u1", &[indexed("2", "from upstream")]);
        assert!(catalog.has_upstream_entries("u1"));
    }

    #[test]
    fn test_list_sorted_descending() {
        let catalog = SessionCatalog::new(10);
        catalog.upsert_for_chat("u1", "3", "1");
        catalog.upsert_for_chat("u1", "10", "1");
        catalog.upsert_for_chat("u1", "7", "1");
        let ids: Vec<String> = catalog.list("u1").iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["10", "7", "3"]);
    }

    #[test]
    fn test_flush_all() {
        let catalog = SessionCatalog::new(10);
        catalog.seed_cursor("u1", 5);
        catalog.upsert_for_chat("u1", "6", "1");
        catalog.flush_all();
        assert_eq!(catalog.count("u1"), 0);
        // Counter state is gone too; minting restarts from zero.
        assert_eq!(catalog.mint_session_id("u1"), "1");
    }

    #[test]
    fn test_users_are_isolated() {
        let catalog = SessionCatalog::new(10);
        catalog.upsert_for_chat("u1", "1", "1");
        catalog.upsert_for_chat("u2", "9", "1");
        assert_eq!(catalog.count("u1"), 1);
        assert_eq!(catalog.count("u2"), 1);
        assert!(catalog.get("u1", "9").is_none());
    }
}
