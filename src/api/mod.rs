//! Ambient HTTP surfaces layered onto [`crate::gateway::router`]: request-id
//! propagation and the Prometheus `/metrics` endpoint. The client-facing
//! endpoints themselves (`/health`, `/stats`, `/v1/models`,
//! `/v1/chat/completions`) live in [`crate::gateway`].

pub mod metrics;
pub mod request_id;
