/// Relay configuration, loaded from environment variables.
///
/// The idle threshold and the disconnect grace window are distinct concepts
/// (idle-tab soft-offline vs. real socket loss) that happen to share a
/// default; they stay independently configurable.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the persistence backend (e.g. `http://localhost:4000`).
    pub backend_url: String,
    /// Port the relay binds to.
    pub port: u16,
    /// Grace window after a socket drop before the disconnect is finalized.
    pub disconnect_grace_ms: u64,
    /// Activity age past which a user is swept offline (tab backgrounded).
    pub idle_threshold_ms: u64,
    /// Interval of the inactivity sweep.
    pub sweep_interval_ms: u64,
    /// Debounce window for join/leave system notices.
    pub aggregation_window_ms: u64,
    /// Consecutive qualifying write failures that open the breaker.
    pub breaker_threshold: u32,
    /// How long an open breaker short-circuits writes.
    pub breaker_cooldown_ms: u64,
    /// Per-attempt timeout for backend reads.
    pub read_timeout_ms: u64,
    /// Per-attempt timeout for backend writes.
    pub write_timeout_ms: u64,
    /// History page size fetched on join and used as the reply/target
    /// recency window.
    pub history_count: usize,
    /// Widened window used for one retry when a target is not in the
    /// recency window.
    pub widened_history_count: usize,
    /// Minimum gap between "started typing" relays per (scope, user).
    pub typing_min_interval_ms: u64,
    /// Upper bound on the caller-suggested typing TTL.
    pub typing_ttl_cap_ms: u64,
    /// Heartbeat interval advertised to clients in READY.
    pub heartbeat_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:4000".to_string(),
            port: 4010,
            disconnect_grace_ms: 5_000,
            idle_threshold_ms: 5_000,
            sweep_interval_ms: 1_000,
            aggregation_window_ms: 5_000,
            breaker_threshold: 3,
            breaker_cooldown_ms: 15_000,
            read_timeout_ms: 6_000,
            write_timeout_ms: 12_000,
            history_count: 50,
            widened_history_count: 200,
            typing_min_interval_ms: 300,
            typing_ttl_cap_ms: 15_000,
            heartbeat_interval_ms: 2_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend_url: required_var("BACKEND_URL"),
            port: var_or("PORT", defaults.port),
            disconnect_grace_ms: var_or("RELAY_DISCONNECT_GRACE_MS", defaults.disconnect_grace_ms),
            idle_threshold_ms: var_or("RELAY_IDLE_THRESHOLD_MS", defaults.idle_threshold_ms),
            sweep_interval_ms: var_or("RELAY_SWEEP_INTERVAL_MS", defaults.sweep_interval_ms),
            aggregation_window_ms: var_or(
                "RELAY_AGGREGATION_WINDOW_MS",
                defaults.aggregation_window_ms,
            ),
            breaker_threshold: var_or("RELAY_BREAKER_THRESHOLD", defaults.breaker_threshold),
            breaker_cooldown_ms: var_or("RELAY_BREAKER_COOLDOWN_MS", defaults.breaker_cooldown_ms),
            read_timeout_ms: var_or("RELAY_READ_TIMEOUT_MS", defaults.read_timeout_ms),
            write_timeout_ms: var_or("RELAY_WRITE_TIMEOUT_MS", defaults.write_timeout_ms),
            history_count: var_or("RELAY_HISTORY_COUNT", defaults.history_count),
            widened_history_count: var_or(
                "RELAY_WIDENED_HISTORY_COUNT",
                defaults.widened_history_count,
            ),
            typing_min_interval_ms: var_or(
                "RELAY_TYPING_MIN_INTERVAL_MS",
                defaults.typing_min_interval_ms,
            ),
            typing_ttl_cap_ms: var_or("RELAY_TYPING_TTL_CAP_MS", defaults.typing_ttl_cap_ms),
            heartbeat_interval_ms: var_or(
                "RELAY_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
