//! In-memory traffic log backing `/stats` and `/metrics`.
//!
//! [`TrafficLog`] is a fixed-capacity ring buffer: once full, the oldest
//! entry is evicted to make room for the newest. Bounded, O(1) memory
//! footprint regardless of request volume.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push]
/// uses a non-blocking `try_lock` so it never delays the request path; under
/// contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Record a completed request. Best-effort, non-blocking: if the mutex
    /// is contended the entry is dropped rather than delaying the caller.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let fallback_count = entries.iter().filter(|e| e.fallback_attempts > 1).count();
        let dedup_hit_count = entries.iter().filter(|e| e.dedup_hit).count();

        let mut tier_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries.iter() {
            *tier_counts.entry(entry.tier.clone()).or_default() += 1;
        }

        let total_cost: f64 = entries.iter().map(|e| e.cost_estimate).sum();
        let total_baseline_cost: f64 = entries.iter().map(|e| e.baseline_cost).sum();

        TrafficStats {
            total_requests: total,
            error_count,
            fallback_count,
            dedup_hit_count,
            avg_latency_ms,
            tier_counts,
            total_cost,
            total_baseline_cost,
        }
    }
}

/// A single completed request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Original model string from the request body (`"auto"`, an alias, or a concrete id).
    pub requested_model: Option<String>,
    /// How the served model was chosen: `"session"`, `"rules"`, `"override"`, or `"fallback"`.
    pub method: String,
    /// Tier that ultimately handled this request.
    pub tier: String,
    /// Concrete model id that served the request.
    pub model: String,
    /// Provider id that served the request.
    pub provider: String,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    /// Number of upstream attempts made, including the first.
    pub fallback_attempts: u32,
    /// Whether this request was served from the dedup cache rather than upstream.
    pub dedup_hit: bool,
    pub cost_estimate: f64,
    pub baseline_cost: f64,
}

impl TrafficEntry {
    pub fn new(tier: String, model: String, provider: String, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            requested_model: None,
            method: "none".to_string(),
            tier,
            model,
            provider,
            latency_ms,
            success,
            error: None,
            fallback_attempts: 1,
            dedup_hit: false,
            cost_estimate: 0.0,
            baseline_cost: 0.0,
        }
    }

    pub fn with_requested_model(mut self, model: &str) -> Self {
        self.requested_model = Some(model.to_string());
        self
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }

    pub fn with_fallback_attempts(mut self, attempts: u32) -> Self {
        self.fallback_attempts = attempts;
        self
    }

    pub fn mark_dedup_hit(mut self) -> Self {
        self.dedup_hit = true;
        self
    }

    pub fn with_costs(mut self, cost_estimate: f64, baseline_cost: f64) -> Self {
        self.cost_estimate = cost_estimate;
        self.baseline_cost = baseline_cost;
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub fallback_count: usize,
    pub dedup_hit_count: usize,
    pub avg_latency_ms: f64,
    pub tier_counts: std::collections::HashMap<String, usize>,
    pub total_cost: f64,
    pub total_baseline_cost: f64,
}
