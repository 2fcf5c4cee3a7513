//! Liveness signal codec.
//!
//! The signal cookie carries the emission time as decimal milliseconds since
//! the epoch. Anything else in the value is treated exactly like a missing
//! cookie.

use crate::cookie::{CookieInstruction, CookieOptions, SameSite};
use crate::policy::GuardPolicy;

pub fn encode_signal(timestamp_ms: i64) -> String {
    timestamp_ms.to_string()
}

pub fn decode_signal(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<i64>().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Absent,
    Malformed,
    Expired { age_ms: i64 },
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaleReason::Absent => "absent",
            StaleReason::Malformed => "malformed",
            StaleReason::Expired { .. } => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalFreshness {
    Fresh { age_ms: i64 },
    Stale(StaleReason),
}

impl SignalFreshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, SignalFreshness::Fresh { .. })
    }
}

/// Judge a raw signal cookie value against `now_ms`.
///
/// The timestamp comes from the browser clock, so a value from the future is
/// tolerated by the same window as one from the past.
pub fn classify_signal(value: Option<&str>, now_ms: i64, window_ms: u64) -> SignalFreshness {
    let Some(raw) = value else {
        return SignalFreshness::Stale(StaleReason::Absent);
    };
    let Some(emitted_ms) = decode_signal(raw) else {
        return SignalFreshness::Stale(StaleReason::Malformed);
    };
    let age_ms = now_ms.saturating_sub(emitted_ms);
    if age_ms.unsigned_abs() > window_ms {
        return SignalFreshness::Stale(StaleReason::Expired { age_ms });
    }
    SignalFreshness::Fresh { age_ms }
}

fn signal_options(max_age_secs: u64) -> CookieOptions {
    CookieOptions::root()
        .with_max_age(max_age_secs as i64)
        .with_same_site(SameSite::Lax)
}

/// Heartbeat write of the signal cookie.
pub fn heartbeat_signal(policy: &GuardPolicy, now_ms: i64) -> CookieInstruction {
    CookieInstruction::new(
        policy.signal_cookie.clone(),
        encode_signal(now_ms),
        signal_options(policy.signal_max_age_secs),
    )
}

/// Signal written by the server right after a successful sign-in, long
/// enough to cover the redirect into the app before the first heartbeat.
pub fn login_signal(policy: &GuardPolicy, now_ms: i64) -> CookieInstruction {
    CookieInstruction::new(
        policy.signal_cookie.clone(),
        encode_signal(now_ms),
        signal_options(policy.login_signal_max_age_secs),
    )
}

pub fn clear_signal(policy: &GuardPolicy) -> CookieInstruction {
    let mut instruction = CookieInstruction::delete(policy.signal_cookie.clone());
    instruction.options.same_site = Some(SameSite::Lax);
    instruction
}
