//! Usage emitter (C10).
//!
//! Single operation: `emit(UsageEvent)`, fire-and-forget. Appends to a daily
//! file under a configured directory; any I/O failure is logged and
//! swallowed — this component must never block or error out the request
//! path it observes.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::catalog::Tier;

#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub tier: Tier,
    pub cost_estimate: f64,
    pub baseline_cost: f64,
    pub savings: f64,
    pub latency_ms: u64,
    pub fallback_attempts: u32,
}

/// Fire-and-forget sink. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct UsageEmitter {
    dir: Arc<PathBuf>,
    writer: Arc<Mutex<()>>,
}

impl UsageEmitter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Arc::new(dir.into()), writer: Arc::new(Mutex::new(())) }
    }

    /// Record one event. Never awaited by the request path for its result —
    /// callers should `tokio::spawn` this or await it with the understanding
    /// that failures are swallowed, never surfaced.
    pub async fn emit(&self, event: UsageEvent) {
        if let Err(e) = self.try_emit(&event).await {
            warn!(error = %e, model = %event.model, "usage emit failed — dropping event");
        }
    }

    async fn try_emit(&self, event: &UsageEvent) -> anyhow::Result<()> {
        let _guard = self.writer.lock().await;

        tokio::fs::create_dir_all(&*self.dir).await?;

        let filename = format!("{}.jsonl", event.timestamp.format("%Y-%m-%d"));
        let path = self.dir.join(filename);

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn event() -> UsageEvent {
        UsageEvent {
            timestamp: Utc::now(),
            model: "openai/gpt-4o-mini".to_string(),
            tier: Tier::Simple,
            cost_estimate: 0.0012,
            baseline_cost: 0.01,
            savings: 0.88,
            latency_ms: 420,
            fallback_attempts: 1,
        }
    }

    #[tokio::test]
    async fn emit_writes_a_jsonl_line_to_todays_file() {
        let dir = std::env::temp_dir().join(format!("usage-emitter-test-{}", std::process::id()));
        let emitter = UsageEmitter::new(&dir);
        emitter.emit(event()).await;

        let today = Utc::now().format("%Y-%m-%d");
        let path = dir.join(format!("{today}.jsonl"));
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("openai/gpt-4o-mini"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn emit_never_panics_on_an_unwritable_directory() {
        // A path under a file (not a directory) cannot have children created under it.
        let blocking_file = std::env::temp_dir().join(format!("usage-emitter-blocker-{}", std::process::id()));
        tokio::fs::write(&blocking_file, b"not a directory").await.unwrap();
        let bogus_dir = blocking_file.join("nested");

        let emitter = UsageEmitter::new(&bogus_dir);
        // Should log and return, not panic or propagate an error.
        tokio::time::timeout(StdDuration::from_secs(2), emitter.emit(event())).await.unwrap();

        let _ = tokio::fs::remove_file(&blocking_file).await;
    }

    #[tokio::test]
    async fn concurrent_emits_do_not_interleave_lines() {
        let dir = std::env::temp_dir().join(format!("usage-emitter-concurrent-{}", std::process::id()));
        let emitter = UsageEmitter::new(&dir);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let e = emitter.clone();
            handles.push(tokio::spawn(async move { e.emit(event()).await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let today = Utc::now().format("%Y-%m-%d");
        let path = dir.join(format!("{today}.jsonl"));
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 20);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
