//! Auth strategies (C7).
//!
//! A closed set of two kinds: a plain bearer/header API key, and an
//! "external payment" style strategy that can react to an auth failure by
//! retrying once with refreshed headers (e.g. a token-exchange credential
//! that expires mid-session). The gateway interacts with a strategy through
//! exactly two verbs regardless of kind.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// What to do after an upstream call fails with a 401 or 402.
pub struct AuthFailureOutcome {
    pub retryable: bool,
    pub new_headers: Option<HeaderMap>,
}

impl AuthFailureOutcome {
    fn terminal() -> Self {
        Self { retryable: false, new_headers: None }
    }
}

/// The closed set of auth strategies a provider may use.
pub enum AuthStrategy {
    /// Attach `Authorization: <prefix><key>` plus any configured extra headers.
    /// Headers are derived fresh before each request; the strategy holds no
    /// mutable state.
    ApiKey { prefix: &'static str, key: String, extra_headers: Vec<(String, String)> },
    /// Bearer-style credential with a single refresh hook invoked once on a
    /// 401/402 response. `refresh` is the new key to use on the retry, or
    /// `None` if no refresh is possible (the failure is then terminal).
    ExternalPayment { key: String, refresh: Option<String> },
    /// No credentials required (e.g. a local Ollama instance).
    None,
}

impl AuthStrategy {
    /// Build the headers to attach to an outgoing request. Never mutates
    /// strategy state.
    pub fn prepare_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self {
            Self::ApiKey { prefix, key, extra_headers } => {
                let value = format!("{prefix}{key}");
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    HeaderValue::from_str(&value).expect("API key contains invalid header characters"),
                );
                for (name, value) in extra_headers {
                    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                        headers.insert(name, value);
                    }
                }
            }
            Self::ExternalPayment { key, .. } => {
                let value = format!("Bearer {key}");
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    HeaderValue::from_str(&value).expect("credential contains invalid header characters"),
                );
            }
            Self::None => {}
        }
        headers
    }

    /// React to a 401/402 from the upstream. `API_KEY` and `None` strategies
    /// have nothing to refresh and always report a terminal failure;
    /// `ExternalPayment` retries once if a refreshed credential is configured.
    pub fn handle_auth_failure(&self, status: u16) -> AuthFailureOutcome {
        if status != 401 && status != 402 {
            return AuthFailureOutcome::terminal();
        }
        match self {
            Self::ExternalPayment { refresh: Some(new_key), .. } => {
                let mut headers = HeaderMap::new();
                let value = format!("Bearer {new_key}");
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    HeaderValue::from_str(&value).expect("refreshed credential contains invalid header characters"),
                );
                AuthFailureOutcome { retryable: true, new_headers: Some(headers) }
            }
            _ => AuthFailureOutcome::terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_strategy_attaches_bearer_header() {
        let strategy = AuthStrategy::ApiKey { prefix: "Bearer ", key: "sk-test".into(), extra_headers: vec![] };
        let headers = strategy.prepare_headers();
        assert_eq!(headers.get(reqwest::header::AUTHORIZATION).unwrap(), "Bearer sk-test");
    }

    #[test]
    fn api_key_strategy_attaches_extra_headers() {
        let strategy = AuthStrategy::ApiKey {
            prefix: "Bearer ",
            key: "sk-test".into(),
            extra_headers: vec![("HTTP-Referer".to_string(), "https://example.test".to_string())],
        };
        let headers = strategy.prepare_headers();
        assert_eq!(headers.get("HTTP-Referer").unwrap(), "https://example.test");
    }

    #[test]
    fn api_key_strategy_never_retries_auth_failure() {
        let strategy = AuthStrategy::ApiKey { prefix: "Bearer ", key: "sk-test".into(), extra_headers: vec![] };
        let outcome = strategy.handle_auth_failure(401);
        assert!(!outcome.retryable);
    }

    #[test]
    fn external_payment_strategy_retries_once_with_refreshed_key() {
        let strategy = AuthStrategy::ExternalPayment { key: "old".into(), refresh: Some("new".into()) };
        let outcome = strategy.handle_auth_failure(402);
        assert!(outcome.retryable);
        let headers = outcome.new_headers.unwrap();
        assert_eq!(headers.get(reqwest::header::AUTHORIZATION).unwrap(), "Bearer new");
    }

    #[test]
    fn external_payment_strategy_is_terminal_without_a_refresh_key() {
        let strategy = AuthStrategy::ExternalPayment { key: "old".into(), refresh: None };
        let outcome = strategy.handle_auth_failure(401);
        assert!(!outcome.retryable);
    }

    #[test]
    fn non_auth_failure_status_is_always_terminal() {
        let strategy = AuthStrategy::ExternalPayment { key: "old".into(), refresh: Some("new".into()) };
        let outcome = strategy.handle_auth_failure(500);
        assert!(!outcome.retryable);
    }

    #[test]
    fn none_strategy_attaches_no_headers() {
        let strategy = AuthStrategy::None;
        assert!(strategy.prepare_headers().is_empty());
    }
}
