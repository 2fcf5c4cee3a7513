//! Boot validation: decide, before anything protected renders, whether this
//! page load belongs to a live tab or to a restored one.
//!
//! The decision reads only persisted state (tab storage and the script-visible
//! signal cookie), so running it twice in a row converges: the first run
//! leaves the activity flag set and the second one passes.

use tally_core::presence::{self, decode_signal};
use tally_core::GuardPolicy;
use tracing::{info, warn};

use crate::host::{BrowserContext, NavigationType, Notice};

pub const ACTIVE_FLAG_KEY: &str = "presence:active";
pub const LAST_BEAT_KEY: &str = "presence:last-beat";
const ACTIVE_FLAG_VALUE: &str = "checked";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSnapshot {
    pub flag_present: bool,
    /// Newest of the stored heartbeat and the signal cookie timestamp.
    pub last_seen_ms: Option<i64>,
    pub navigation: Option<NavigationType>,
    pub now_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSuspicion {
    Clear,
    /// No activity flag: first load in this browsing context.
    FreshContext,
    Stale { elapsed_ms: i64, threshold_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Passed,
    Purged,
}

/// Reload gets the lenient threshold; every other navigation type (and an
/// unknown one) gets the strict one. Heuristic only.
pub fn staleness_threshold_ms(policy: &GuardPolicy, navigation: Option<NavigationType>) -> u64 {
    match navigation {
        Some(NavigationType::Reload) => policy.reload_threshold_ms,
        _ => policy.navigate_threshold_ms,
    }
}

pub fn assess(snapshot: &BootSnapshot, policy: &GuardPolicy) -> BootSuspicion {
    if !snapshot.flag_present {
        return BootSuspicion::FreshContext;
    }
    let Some(last_seen_ms) = snapshot.last_seen_ms else {
        return BootSuspicion::Clear;
    };
    let threshold_ms = staleness_threshold_ms(policy, snapshot.navigation);
    let elapsed_ms = snapshot.now_ms.saturating_sub(last_seen_ms);
    if elapsed_ms > threshold_ms as i64 {
        BootSuspicion::Stale {
            elapsed_ms,
            threshold_ms,
        }
    } else {
        BootSuspicion::Clear
    }
}

pub fn take_snapshot(ctx: &BrowserContext, policy: &GuardPolicy) -> BootSnapshot {
    let stored = ctx
        .storage
        .get(LAST_BEAT_KEY)
        .as_deref()
        .and_then(decode_signal);
    let cookie = ctx
        .cookies
        .get(&policy.signal_cookie)
        .as_deref()
        .and_then(decode_signal);
    BootSnapshot {
        flag_present: ctx.storage.get(ACTIVE_FLAG_KEY).is_some(),
        last_seen_ms: stored.max(cookie),
        navigation: ctx.navigation.navigation_type(),
        now_ms: ctx.clock.now_ms(),
    }
}

pub async fn validate_boot(ctx: &BrowserContext, policy: &GuardPolicy) -> BootOutcome {
    let snapshot = take_snapshot(ctx, policy);
    let suspicion = assess(&snapshot, policy);
    if suspicion == BootSuspicion::Clear {
        mark_active(ctx);
        return BootOutcome::Passed;
    }

    let user = match ctx.auth.current_user().await {
        Ok(user) => user,
        Err(err) => {
            warn!(event = "boot_user_lookup_failed", error = %err);
            None
        }
    };
    let Some(user) = user else {
        mark_active(ctx);
        return BootOutcome::Passed;
    };

    info!(
        event = "boot_purge",
        user_id = %user.id,
        suspicion = ?suspicion,
        navigation = ?snapshot.navigation
    );
    purge(ctx, policy).await;
    ctx.notifier.notify(Notice::SessionRestored);
    ctx.navigation.hard_redirect(&policy.login_path);
    BootOutcome::Purged
}

/// Revoke and wipe local session state. A failed revocation does not stop
/// the local wipe.
pub(crate) async fn purge(ctx: &BrowserContext, policy: &GuardPolicy) {
    if let Err(err) = ctx.auth.sign_out().await {
        warn!(event = "sign_out_failed", error = %err);
    }
    ctx.cookies.write(&presence::clear_signal(policy));
    ctx.storage.clear();
    mark_active(ctx);
}

fn mark_active(ctx: &BrowserContext) {
    ctx.storage.set(ACTIVE_FLAG_KEY, ACTIVE_FLAG_VALUE);
}
