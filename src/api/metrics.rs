//! Prometheus-compatible `/metrics` endpoint.
//!
//! All metrics are derived from the in-memory ring-buffer window. Because the
//! buffer has a fixed capacity, values represent a **sliding window** of recent
//! requests rather than lifetime counters. Use `TYPE gauge` throughout for
//! semantic accuracy — values may decrease as old entries rotate out.
//!
//! Metric families:
//! - `gateway_window_size`        — entries currently in the ring buffer
//! - `gateway_requests`           — per-tier/model/outcome request counts
//! - `gateway_latency_ms_sum`     — sum of latencies per tier/model (for avg)
//! - `gateway_latency_ms_count`   — denominator matching the sum above
//! - `gateway_fallback_total`     — requests that needed more than one attempt
//! - `gateway_errors_total`       — requests that returned an error

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::gateway::GatewayState;

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let entries = state.traffic.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut fallbacks: u64 = 0;
    let mut errors: u64 = 0;

    // (tier, model, success) → count
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    // (tier, model) → (latency_sum_ms, count)
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        if e.fallback_attempts > 1 {
            fallbacks += 1;
        }
        if !e.success {
            errors += 1;
        }

        *request_counts.entry((e.tier.clone(), e.model.clone(), e.success)).or_default() += 1;

        let lat = latency.entry((e.tier.clone(), e.model.clone())).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP gateway_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE gateway_window_size gauge\n");
    out.push_str(&format!("gateway_window_size {window_size}\n\n"));

    out.push_str("# HELP gateway_requests Request count in the current window, labelled by tier, model, and outcome.\n");
    out.push_str("# TYPE gateway_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, model, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!("gateway_requests{{tier=\"{tier}\",model=\"{model}\",success=\"{success_str}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP gateway_latency_ms_sum Sum of request latency (ms) in the current window, grouped by tier and model.\n");
    out.push_str("# TYPE gateway_latency_ms_sum gauge\n");
    out.push_str("# HELP gateway_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE gateway_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, model), (sum, count)) in lat_rows {
        out.push_str(&format!("gateway_latency_ms_sum{{tier=\"{tier}\",model=\"{model}\"}} {sum}\n"));
        out.push_str(&format!("gateway_latency_ms_count{{tier=\"{tier}\",model=\"{model}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP gateway_fallback_total Requests in the current window that needed more than one upstream attempt.\n");
    out.push_str("# TYPE gateway_fallback_total gauge\n");
    out.push_str(&format!("gateway_fallback_total {fallbacks}\n\n"));

    out.push_str("# HELP gateway_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE gateway_errors_total gauge\n");
    out.push_str(&format!("gateway_errors_total {errors}\n"));

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::traffic::{TrafficEntry, TrafficLog};

    fn mock_log() -> Arc<TrafficLog> {
        let log = Arc::new(TrafficLog::new(100));
        log.push(TrafficEntry::new("MEDIUM".into(), "openai/gpt-4o-mini".into(), "openai".into(), 120, true));
        log.push(TrafficEntry::new("MEDIUM".into(), "openai/gpt-4o-mini".into(), "openai".into(), 95, true));
        log.push(TrafficEntry::new("SIMPLE".into(), "ollama/qwen2.5:1.5b".into(), "ollama".into(), 430, true));
        log.push(
            TrafficEntry::new("MEDIUM".into(), "none".into(), "none".into(), 80, false).with_error("upstream 500"),
        );
        log
    }

    #[tokio::test]
    async fn window_size_equals_entry_count() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        assert_eq!(entries.len(), 4);
    }

    #[tokio::test]
    async fn error_count_is_accurate() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let errors = entries.iter().filter(|e| !e.success).count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn latency_sum_is_accurate() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let sum: u64 = entries
            .iter()
            .filter(|e| e.tier == "MEDIUM" && e.model == "openai/gpt-4o-mini")
            .map(|e| e.latency_ms)
            .sum();
        assert_eq!(sum, 215);
    }
}
