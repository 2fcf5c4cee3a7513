use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SIGNAL_COOKIE: &str = "session_presence";
pub const DEFAULT_AUTH_COOKIE_PREFIX: &str = "sb-";
pub const DEFAULT_LOGIN_PATH: &str = "/login";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("heartbeat interval {heartbeat_ms}ms must be shorter than signal max-age {max_age_ms}ms")]
    HeartbeatTooSlow { heartbeat_ms: u64, max_age_ms: u64 },
    #[error("signal max-age {max_age_ms}ms exceeds freshness window {window_ms}ms")]
    SignalOutlivesWindow { max_age_ms: u64, window_ms: u64 },
    #[error(
        "heartbeat interval {heartbeat_ms}ms must be shorter than navigate threshold {threshold_ms}ms"
    )]
    HeartbeatOutrunsBoot { heartbeat_ms: u64, threshold_ms: u64 },
    #[error("{field} is too large")]
    OutOfRange { field: &'static str },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("login path must be covered by an ungated prefix: {0}")]
    LoginPathGated(String),
}

/// Thresholds and names shared by the edge gate and the presence monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardPolicy {
    pub signal_cookie: String,
    pub auth_cookie_prefix: String,
    /// Max age of the embedded timestamp the gate still accepts.
    pub freshness_window_ms: u64,
    /// `Max-Age` on heartbeat writes of the signal cookie.
    pub signal_max_age_secs: u64,
    /// `Max-Age` on the signal written right after sign-in.
    pub login_signal_max_age_secs: u64,
    pub heartbeat_interval_ms: u64,
    /// Boot staleness allowance after a same-document reload.
    pub reload_threshold_ms: u64,
    /// Boot staleness allowance for every other navigation type.
    pub navigate_threshold_ms: u64,
    pub idle_timeout_ms: u64,
    pub login_path: String,
    pub ungated_prefixes: Vec<String>,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            signal_cookie: DEFAULT_SIGNAL_COOKIE.to_string(),
            auth_cookie_prefix: DEFAULT_AUTH_COOKIE_PREFIX.to_string(),
            freshness_window_ms: 15_000,
            signal_max_age_secs: 10,
            login_signal_max_age_secs: 25,
            heartbeat_interval_ms: 2_000,
            reload_threshold_ms: 15_000,
            navigate_threshold_ms: 3_000,
            idle_timeout_ms: 10 * 60 * 1000,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            ungated_prefixes: vec!["/login".to_string(), "/auth".to_string()],
        }
    }
}

impl GuardPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (field, value) in [
            ("freshness_window_ms", self.freshness_window_ms),
            ("signal_max_age_secs", self.signal_max_age_secs),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
        ] {
            if value == 0 {
                return Err(PolicyError::Zero { field });
            }
        }
        let max_age_ms = self
            .signal_max_age_secs
            .checked_mul(1000)
            .ok_or(PolicyError::OutOfRange {
                field: "signal_max_age_secs",
            })?;
        if self.heartbeat_interval_ms >= max_age_ms {
            return Err(PolicyError::HeartbeatTooSlow {
                heartbeat_ms: self.heartbeat_interval_ms,
                max_age_ms,
            });
        }
        if max_age_ms > self.freshness_window_ms {
            return Err(PolicyError::SignalOutlivesWindow {
                max_age_ms,
                window_ms: self.freshness_window_ms,
            });
        }
        // A live tab remounts on every full-page navigation; its last beat must
        // still be inside the strict boot threshold when that happens.
        if self.heartbeat_interval_ms >= self.navigate_threshold_ms {
            return Err(PolicyError::HeartbeatOutrunsBoot {
                heartbeat_ms: self.heartbeat_interval_ms,
                threshold_ms: self.navigate_threshold_ms,
            });
        }
        if !self.is_ungated(&self.login_path) {
            return Err(PolicyError::LoginPathGated(self.login_path.clone()));
        }
        Ok(())
    }

    /// Login and auth-callback surfaces are never gated, to avoid a redirect
    /// loop.
    pub fn is_ungated(&self, path: &str) -> bool {
        self.ungated_prefixes
            .iter()
            .any(|prefix| path_has_prefix(path, prefix))
    }

    pub fn is_auth_cookie(&self, name: &str) -> bool {
        name.starts_with(&self.auth_cookie_prefix)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Segment-aware prefix match: `/login` covers `/login` and `/login/x` but
/// not `/loginx`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}
