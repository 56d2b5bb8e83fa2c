use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Shortest period a poll or heartbeat loop will tick at.
const MIN_TICK: Duration = Duration::from_millis(10);

/// When the poller runs its ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Every tick, as a redundancy layer next to the push feed.
    Always,
    /// Only while the corresponding feed is not subscribed.
    Fallback,
}

impl FromStr for PollMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(PollMode::Always),
            "fallback" => Ok(PollMode::Fallback),
            other => Err(format!("unknown poll mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub message_poll_interval: Duration,
    pub user_poll_interval: Duration,
    /// Newest messages fetched per poll tick.
    pub poll_limit: u32,
    /// Messages loaded on start and on room switch.
    pub history_limit: u32,
    pub heartbeat_interval: Duration,
    /// Idle time after the last keystroke before typing is cleared.
    pub typing_idle: Duration,
    pub reconnect_delay: Duration,
    pub poll_mode: PollMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_poll_interval: Duration::from_millis(3000),
            user_poll_interval: Duration::from_millis(5000),
            poll_limit: 10,
            history_limit: 100,
            heartbeat_interval: Duration::from_secs(30),
            typing_idle: Duration::from_millis(2000),
            reconnect_delay: Duration::from_millis(2000),
            poll_mode: PollMode::Always,
        }
    }
}

impl SyncConfig {
    /// Read `NIAM_*` overrides from the environment, keeping defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            message_poll_interval: env_millis("NIAM_MESSAGE_POLL_MS", d.message_poll_interval),
            user_poll_interval: env_millis("NIAM_USER_POLL_MS", d.user_poll_interval),
            poll_limit: env_parse("NIAM_POLL_LIMIT", d.poll_limit),
            history_limit: env_parse("NIAM_HISTORY_LIMIT", d.history_limit),
            heartbeat_interval: env_period(
                "NIAM_HEARTBEAT_SECS",
                d.heartbeat_interval,
                Duration::from_secs,
            ),
            typing_idle: env_millis("NIAM_TYPING_IDLE_MS", d.typing_idle),
            reconnect_delay: env_millis("NIAM_RECONNECT_MS", d.reconnect_delay),
            poll_mode: env_parse("NIAM_POLL_MODE", d.poll_mode),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {}={}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env_period(key, default, Duration::from_millis)
}

fn env_period(key: &str, default: Duration, unit: fn(u64) -> Duration) -> Duration {
    parse_period(key, std::env::var(key).ok(), default, unit)
}

/// Zero is rejected like any other unusable value.
fn parse_period(
    key: &str,
    raw: Option<String>,
    default: Duration,
    unit: fn(u64) -> Duration,
) -> Duration {
    let Some(raw) = raw else { return default };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => unit(n),
        _ => {
            warn!("Ignoring unusable {}={}", key, raw);
            default
        }
    }
}

/// Clamp a configured period to something `tokio::time::interval` accepts.
pub(crate) fn tick_period(period: Duration) -> Duration {
    period.max(MIN_TICK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_mode_parses_case_insensitively() {
        assert_eq!("Fallback".parse::<PollMode>().unwrap(), PollMode::Fallback);
        assert_eq!("always".parse::<PollMode>().unwrap(), PollMode::Always);
        assert!("sometimes".parse::<PollMode>().is_err());
    }

    #[test]
    fn zero_and_garbage_periods_keep_the_default() {
        let default = Duration::from_secs(3);
        let parse = |raw: Option<&str>| {
            parse_period("NIAM_TEST_MS", raw.map(String::from), default, Duration::from_millis)
        };
        assert_eq!(parse(None), default);
        assert_eq!(parse(Some("0")), default);
        assert_eq!(parse(Some("fast")), default);
        assert_eq!(parse(Some("-5")), default);
        assert_eq!(parse(Some(" 250 ")), Duration::from_millis(250));
        assert_eq!(
            parse_period("NIAM_TEST_SECS", Some("2".into()), default, Duration::from_secs),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn tick_period_is_never_zero() {
        assert_eq!(tick_period(Duration::ZERO), MIN_TICK);
        assert_eq!(tick_period(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn defaults_match_recommended_intervals() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.message_poll_interval, Duration::from_secs(3));
        assert_eq!(cfg.user_poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
    }
}
