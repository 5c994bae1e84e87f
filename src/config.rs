use std::env;
use std::time::Duration;

const DEFAULT_RENDER_RETRY_BUDGET: u32 = 3;
const DEFAULT_RECOVER_ATTEMPTS: u32 = 5;
const DEFAULT_RECOVER_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime tunables for one node client.
///
/// Single renders and peeks bound their outer retry loop at
/// `render_retry_budget`; batch renders recover per disconnect without an
/// outer bound unless `batch_retry_budget` is set. The asymmetry matches the
/// shipped behavior (long batches are expected to survive several flaps) and
/// both knobs are plain fields so callers can unify them.
#[derive(Debug, Clone)]
pub struct Config {
    /// Outer send-with-recovery attempts for a single render or peek.
    pub render_retry_budget: u32,
    /// Outer attempts for a batch render; `None` means unbounded.
    pub batch_retry_budget: Option<u32>,
    /// Reconnect attempts inside one recovery pass.
    pub recover_attempts: u32,
    /// Pause between failed recovery iterations.
    pub recover_interval: Duration,
    /// Transport connect timeout.
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            render_retry_budget: DEFAULT_RENDER_RETRY_BUDGET,
            batch_retry_budget: None,
            recover_attempts: DEFAULT_RECOVER_ATTEMPTS,
            recover_interval: DEFAULT_RECOVER_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Config {
    /// Load configuration, applying `FARMHAND_*` environment overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            render_retry_budget: parse_u32_env(
                "FARMHAND_RENDER_RETRY_BUDGET",
                defaults.render_retry_budget,
            ),
            batch_retry_budget: env::var("FARMHAND_BATCH_RETRY_BUDGET")
                .ok()
                .and_then(|value| value.trim().parse::<u32>().ok()),
            recover_attempts: parse_u32_env("FARMHAND_RECOVER_ATTEMPTS", defaults.recover_attempts),
            recover_interval: parse_duration_env(
                "FARMHAND_RECOVER_INTERVAL_MS",
                defaults.recover_interval,
            ),
            connect_timeout: parse_duration_env(
                "FARMHAND_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            ),
        }
    }
}

fn parse_u32_env(var: &str, default: u32) -> u32 {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<u32>() {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(
                    target = "farmhand::config",
                    var,
                    error = %err,
                    default,
                    "invalid value in env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_duration_env(var: &str, default: Duration) -> Duration {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(err) => {
                tracing::warn!(
                    target = "farmhand::config",
                    var,
                    error = %err,
                    default_ms = default.as_millis(),
                    "invalid duration in env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
