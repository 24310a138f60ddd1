use std::env;
use std::time::Duration;

const DEFAULT_RESEND_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_RESEND_ATTEMPTS: u32 = 30;

/// Record separator; JSON text never contains it, so it is safe as a stream
/// frame delimiter.
pub const DEFAULT_DELIMITER: &str = "\u{1e}";

/// Beacon application configuration, layered under the CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Delimiter for stream-socket framing.
    pub delimiter: String,
    /// Whether signaling payloads are compressed (must match the peer).
    pub compression: bool,
    /// Interval of the candidate/offer resend pass.
    pub resend_interval: Duration,
    /// Resend passes before a negotiation episode is declared failed.
    pub max_resend_attempts: u32,
    /// Interval of the frame-capture hook while connected, if any.
    pub capture_interval: Option<Duration>,
}

impl Config {
    /// Load configuration from `BEACON_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            delimiter: env::var("BEACON_DELIMITER").unwrap_or(defaults.delimiter),
            compression: env_truthy("BEACON_COMPRESSION").unwrap_or(defaults.compression),
            resend_interval: env_millis("BEACON_RESEND_INTERVAL_MS")
                .unwrap_or(defaults.resend_interval),
            max_resend_attempts: env_parse("BEACON_MAX_RESEND_ATTEMPTS")
                .unwrap_or(defaults.max_resend_attempts),
            capture_interval: env_millis("BEACON_CAPTURE_INTERVAL_MS"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_string(),
            compression: false,
            resend_interval: Duration::from_millis(DEFAULT_RESEND_INTERVAL_MS),
            max_resend_attempts: DEFAULT_MAX_RESEND_ATTEMPTS,
            capture_interval: None,
        }
    }
}

fn env_truthy(var: &str) -> Option<bool> {
    env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(var: &str) -> Option<Duration> {
    env_parse::<u64>(var).map(Duration::from_millis)
}
