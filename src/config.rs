use std::env;
use std::time::Duration;

/// Recognized configuration, all overridable via environment variables with
/// the defaults from the spec. Mirrors the teacher's `RateLimitConfig::from_env`
/// idiom: plain `env::var(...).ok().and_then(|v| v.parse().ok())` chains.
#[derive(Debug, Clone)]
pub struct Config {
    pub history_retention_ttl: Duration,
    pub history_retention_per_room_cap: usize,
    pub initial_history_limit: usize,
    pub rate_limit_capacity: f64,
    pub rate_limit_refill_per_second: f64,
    pub typing_idle_timeout: Duration,
    pub message_max_chars: usize,
    pub display_name_max_chars: usize,
    pub origin_allow_list: Vec<String>,
    pub database_path: String,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_retention_ttl: Duration::from_secs(24 * 3600),
            history_retention_per_room_cap: 500,
            initial_history_limit: 100,
            rate_limit_capacity: 10.0,
            rate_limit_refill_per_second: 3.0,
            typing_idle_timeout: Duration::from_secs(3),
            message_max_chars: 2000,
            display_name_max_chars: 50,
            origin_allow_list: Vec::new(),
            database_path: "data/chat.db".to_string(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Build a `Config` from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("HISTORY_RETENTION_TTL_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.history_retention_ttl = Duration::from_secs(n);
        }
        if let Ok(val) = env::var("HISTORY_RETENTION_PER_ROOM_CAP")
            && let Ok(n) = val.parse::<usize>()
        {
            config.history_retention_per_room_cap = n;
        }
        if let Ok(val) = env::var("INITIAL_HISTORY_LIMIT")
            && let Ok(n) = val.parse::<usize>()
        {
            config.initial_history_limit = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_CAPACITY")
            && let Ok(n) = val.parse::<f64>()
        {
            config.rate_limit_capacity = n;
        }
        if let Ok(val) = env::var("RATE_LIMIT_REFILL_PER_SECOND")
            && let Ok(n) = val.parse::<f64>()
        {
            config.rate_limit_refill_per_second = n;
        }
        if let Ok(val) = env::var("TYPING_IDLE_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.typing_idle_timeout = Duration::from_secs(n);
        }
        if let Ok(val) = env::var("MESSAGE_MAX_CHARS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.message_max_chars = n;
        }
        if let Ok(val) = env::var("DISPLAY_NAME_MAX_CHARS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.display_name_max_chars = n;
        }
        if let Ok(val) = env::var("ORIGIN_ALLOW_LIST") {
            config.origin_allow_list = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = env::var("DATABASE_PATH") {
            config.database_path = val;
        }
        if let Ok(val) = env::var("SWEEP_INTERVAL_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.sweep_interval = Duration::from_secs(n);
        }

        config
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.origin_allow_list.iter().any(|o| o == origin)
    }
}
