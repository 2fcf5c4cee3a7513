use std::sync::Arc;
use tally_core::presence::{encode_signal, heartbeat_signal};
use tally_core::GuardPolicy;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::boot::LAST_BEAT_KEY;
use crate::host::BrowserContext;

/// Write one proof-of-life: tab storage first, then the signal cookie.
pub fn beat(ctx: &BrowserContext, policy: &GuardPolicy) -> i64 {
    let now_ms = ctx.clock.now_ms();
    ctx.storage.set(LAST_BEAT_KEY, &encode_signal(now_ms));
    ctx.cookies.write(&heartbeat_signal(policy, now_ms));
    now_ms
}

/// Beat immediately, then on every interval tick. Any message on `wake`
/// (the document became visible again) forces an extra beat, since hidden
/// tabs get their timers throttled.
pub(crate) fn spawn_heartbeat(
    ctx: BrowserContext,
    policy: Arc<GuardPolicy>,
    mut wake: mpsc::UnboundedReceiver<crate::host::ActivityKind>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut wake_open = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                woke = wake.recv(), if wake_open => {
                    if woke.is_none() {
                        wake_open = false;
                        continue;
                    }
                }
            }
            let at = beat(&ctx, &policy);
            debug!(event = "heartbeat", at_ms = at);
        }
    })
}
