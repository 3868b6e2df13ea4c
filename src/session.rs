//! Session pinning store (C4).
//!
//! Once a request picks a concrete model for a conversation, later requests
//! carrying the same session id are pinned to it — so a retry or a follow-up
//! turn doesn't get scored to a different tier mid-conversation. Entries
//! expire on TTL and the store evicts least-recently-used entries once it
//! hits capacity.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Ordered list of header names checked, in priority order, to extract a
/// session id from an inbound request. The first present header wins.
pub const SESSION_HEADER_NAMES: &[&str] = &["x-session-id", "x-conversation-id", "x-thread-id"];

struct Entry {
    model_id: String,
    last_used_at: Instant,
}

/// Thread-safe pin store. Cheap to clone the `Arc` wrapper at the call site;
/// the store itself holds a single mutex around a plain `HashMap`.
pub struct SessionStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    capacity: usize,
}

impl SessionStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, capacity }
    }

    /// Look up the pinned model for a session id, if present and not expired.
    /// Refreshes `last_used_at` on hit.
    pub fn get_pinned(&self, session_id: &str) -> Option<String> {
        let mut guard = self.entries.lock().expect("session store mutex poisoned");
        match guard.get_mut(session_id) {
            Some(entry) if entry.last_used_at.elapsed() < self.ttl => {
                entry.last_used_at = Instant::now();
                Some(entry.model_id.clone())
            }
            Some(_) => {
                guard.remove(session_id);
                None
            }
            None => None,
        }
    }

    /// Pin a session to a model id, evicting the least-recently-used entry
    /// first if the store is at capacity.
    pub fn pin(&self, session_id: impl Into<String>, model_id: impl Into<String>) {
        let mut guard = self.entries.lock().expect("session store mutex poisoned");
        let session_id = session_id.into();

        if !guard.contains_key(&session_id) && guard.len() >= self.capacity {
            if let Some(lru_key) = guard
                .iter()
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(k, _)| k.clone())
            {
                guard.remove(&lru_key);
            }
        }

        guard.insert(session_id, Entry { model_id: model_id.into(), last_used_at: Instant::now() });
    }

    /// Explicitly close a session (e.g. on client-requested reset).
    pub fn close(&self, session_id: &str) {
        self.entries.lock().expect("session store mutex poisoned").remove(session_id);
    }

    /// Sweep expired entries. Intended to be driven by a periodic background
    /// task rather than called inline on the request path.
    pub fn sweep_expired(&self) -> usize {
        let mut guard = self.entries.lock().expect("session store mutex poisoned");
        let before = guard.len();
        guard.retain(|_, e| e.last_used_at.elapsed() < self.ttl);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("session store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extract a session id from a list of `(name, value)` header pairs using
/// [`SESSION_HEADER_NAMES`] priority order. Case-insensitive on header name.
pub fn extract_session_id<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Option<String> {
    let headers: Vec<(String, &str)> = headers.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect();
    for name in SESSION_HEADER_NAMES {
        if let Some((_, value)) = headers.iter().find(|(k, _)| k == name) {
            if !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_then_get_round_trips() {
        let store = SessionStore::new(Duration::from_secs(60), 10);
        store.pin("sess-1", "openai/gpt-4o");
        assert_eq!(store.get_pinned("sess-1"), Some("openai/gpt-4o".to_string()));
    }

    #[test]
    fn unknown_session_returns_none() {
        let store = SessionStore::new(Duration::from_secs(60), 10);
        assert_eq!(store.get_pinned("missing"), None);
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let store = SessionStore::new(Duration::from_millis(1), 10);
        store.pin("sess-1", "openai/gpt-4o");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get_pinned("sess-1"), None);
    }

    #[test]
    fn close_removes_entry() {
        let store = SessionStore::new(Duration::from_secs(60), 10);
        store.pin("sess-1", "openai/gpt-4o");
        store.close("sess-1");
        assert_eq!(store.get_pinned("sess-1"), None);
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let store = SessionStore::new(Duration::from_secs(60), 2);
        store.pin("a", "m1");
        store.pin("b", "m2");
        // touch `a` so `b` becomes the LRU entry
        store.get_pinned("a");
        store.pin("c", "m3");
        assert_eq!(store.get_pinned("b"), None);
        assert!(store.get_pinned("a").is_some());
        assert!(store.get_pinned("c").is_some());
    }

    #[test]
    fn sweep_expired_removes_only_stale_entries() {
        let store = SessionStore::new(Duration::from_millis(1), 10);
        store.pin("sess-1", "openai/gpt-4o");
        std::thread::sleep(Duration::from_millis(5));
        store.pin("sess-2", "openai/gpt-4o");
        let removed = store.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn extract_session_id_prefers_header_priority_order() {
        let headers = vec![("x-thread-id", "t1"), ("x-session-id", "s1")];
        assert_eq!(extract_session_id(headers), Some("s1".to_string()));
    }

    #[test]
    fn extract_session_id_is_case_insensitive() {
        let headers = vec![("X-Session-Id", "s1")];
        assert_eq!(extract_session_id(headers), Some("s1".to_string()));
    }

    #[test]
    fn extract_session_id_returns_none_when_absent() {
        let headers = vec![("content-type", "application/json")];
        assert_eq!(extract_session_id(headers), None);
    }
}
