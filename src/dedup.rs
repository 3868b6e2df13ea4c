//! Request deduplication (C5).
//!
//! Keys in-flight and completed requests by the SHA-256 digest of the raw
//! request body bytes (no JSON canonicalization — two byte-identical bodies
//! dedupe, a reordered-but-equivalent JSON object does not). Concurrent
//! requests with the same key coalesce onto the first request's result;
//! completed results are replayed byte-for-byte until their TTL expires.
//!
//! Grounded on the same in-flight/completed state machine used by HTTP
//! idempotency-key middleware: a `DashMap<String, Entry>` plus a
//! `tokio::sync::Notify` per in-flight entry so waiters wake without polling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

/// Hop-by-hop headers stripped before a cached response is replayed.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-encoding",
];

#[derive(Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Strip headers that must never be replayed verbatim.
    pub fn sanitized_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .cloned()
            .collect()
    }
}

enum Entry {
    InFlight { notify: Arc<Notify>, started: Instant },
    Completed { response: Arc<CachedResponse>, expires_at: Instant },
}

/// What a caller should do after checking the dedup table.
pub enum DedupOutcome {
    /// No prior request with this key; caller should process it and call
    /// [`Deduplicator::complete`] when done.
    Proceed,
    /// Another request with this key finished already; replay it verbatim.
    Replay(Arc<CachedResponse>),
    /// Another request with this key is in flight; the caller awaited it and
    /// it has now completed — replay its result.
    Coalesced(Arc<CachedResponse>),
}

/// Content-hash-keyed dedup table. Cheap to clone (wraps an `Arc<DashMap>`).
#[derive(Clone)]
pub struct Deduplicator {
    entries: Arc<DashMap<String, Entry>>,
    ttl: Duration,
}

impl Deduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Arc::new(DashMap::new()), ttl }
    }

    /// SHA-256 hex digest of the raw request body. Deliberately not a
    /// canonicalized JSON hash — byte-identical bodies only.
    pub fn key_for(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        hex::encode(hasher.finalize())
    }

    /// Check the table for `key`. If another request is in flight, waits
    /// (without polling) for it to complete, then returns its result.
    pub async fn check(&self, key: &str) -> DedupOutcome {
        loop {
            let existing = self.entries.get(key).map(|e| match &*e {
                Entry::InFlight { notify, .. } => Entry::InFlight { notify: notify.clone(), started: Instant::now() },
                Entry::Completed { response, expires_at } => {
                    Entry::Completed { response: response.clone(), expires_at: *expires_at }
                }
            });

            match existing {
                None => {
                    let notify = Arc::new(Notify::new());
                    self.entries.insert(key.to_string(), Entry::InFlight { notify, started: Instant::now() });
                    return DedupOutcome::Proceed;
                }
                Some(Entry::Completed { response, expires_at }) => {
                    if Instant::now() < expires_at {
                        return DedupOutcome::Replay(response);
                    }
                    self.entries.remove(key);
                    continue;
                }
                Some(Entry::InFlight { notify, .. }) => {
                    notify.notified().await;
                    if let Some(entry) = self.entries.get(key) {
                        if let Entry::Completed { response, .. } = &*entry {
                            return DedupOutcome::Coalesced(response.clone());
                        }
                    }
                    // The in-flight request's client disconnected without
                    // completing; fall through and take ownership ourselves.
                    continue;
                }
            }
        }
    }

    /// Record a completed response and wake any waiters.
    pub fn complete(&self, key: &str, response: CachedResponse) {
        let notify = match self.entries.get(key) {
            Some(e) => match &*e {
                Entry::InFlight { notify, .. } => Some(notify.clone()),
                Entry::Completed { .. } => None,
            },
            None => None,
        };

        self.entries.insert(
            key.to_string(),
            Entry::Completed { response: Arc::new(response), expires_at: Instant::now() + self.ttl },
        );

        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// Release an in-flight entry without recording a result — used when the
    /// owning client disconnects before the upstream call finishes, so
    /// waiters don't hang until TTL and a later request can retry cleanly.
    pub fn release(&self, key: &str) {
        if let Some(entry) = self.entries.get(key) {
            if let Entry::InFlight { notify, .. } = &*entry {
                notify.notify_waiters();
            }
        }
        self.entries.remove(key);
    }

    /// Periodic sweep of expired completed entries and stuck in-flight
    /// entries (older than `ttl`, implying an abandoned request).
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry {
            Entry::Completed { expires_at, .. } => now < *expires_at,
            Entry::InFlight { started, .. } => now.duration_since(*started) < self.ttl,
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
