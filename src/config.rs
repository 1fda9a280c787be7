use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8080";
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EnvConfig {
    pub api_url: String,
    /// Applied to every request; expiry counts as a network failure.
    pub request_timeout: Duration,
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves the config through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        // `SCRATCH_API_URL` wins; plain `API_URL` is still honoured.
        let api_url = lookup("SCRATCH_API_URL")
            .or_else(|| lookup("API_URL"))
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let timeout_secs = lookup("SCRATCH_REQUEST_TIMEOUT_SECS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self {
            api_url,
            request_timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new()
    }
}
