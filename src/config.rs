use std::time::Duration;

use tracing::info;

use crate::retry::RetryConfig;

/// Endpoint of the audioscrobbler 2.0 API.
pub const DEFAULT_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";

/// The protocol accepts at most 50 scrobbles per submission.
const DEFAULT_BATCH_SIZE: u32 = 50;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;

/// Scrobbling pipeline configuration.
#[derive(Debug, Clone)]
pub struct ScrobblerConfig {
    /// API key issued by the scrobble service.
    pub api_key: String,
    /// Shared secret used to sign every request.
    pub api_secret: String,
    pub base_url: String,
    /// Upper bound on scrobbles submitted per flush cycle.
    pub batch_size: u32,
    /// Cadence of the background queue drain.
    pub flush_interval: Duration,
    pub retry: RetryConfig,
}

impl ScrobblerConfig {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        ScrobblerConfig {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            retry: RetryConfig::default(),
        }
    }

    /// Defaults with `PLAYLOG_*` environment overrides applied (dev mode
    /// and test rigs pointing at a local service stand-in).
    pub fn from_env(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        let mut config = Self::new(api_key, api_secret);

        if let Ok(url) = std::env::var("PLAYLOG_BASE_URL") {
            info!("Config: scrobble endpoint override: {}", url);
            config.base_url = url;
        }
        if let Some(size) = parse_env("PLAYLOG_BATCH_SIZE") {
            config.batch_size = size;
        }
        if let Some(secs) = parse_env("PLAYLOG_FLUSH_INTERVAL_SECS") {
            config.flush_interval = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_env("PLAYLOG_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = attempts;
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}
