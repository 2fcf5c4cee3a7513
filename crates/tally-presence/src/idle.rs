use std::time::Duration;
use tally_core::GuardPolicy;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::host::{ActivityKind, BrowserContext, Notice};

/// One pending deadline, pushed back by every activity event. After it fires
/// it stays disarmed until the next event, so a single quiet stretch signs
/// out at most once.
pub(crate) fn spawn_idle_watch(
    ctx: BrowserContext,
    policy: std::sync::Arc<GuardPolicy>,
    mut activity: mpsc::UnboundedReceiver<ActivityKind>,
) -> JoinHandle<()> {
    let timeout = policy.idle_timeout();
    tokio::spawn(async move {
        let mut deadline = Some(Instant::now() + timeout);
        loop {
            match deadline {
                Some(at) => {
                    tokio::select! {
                        event = activity.recv() => match event {
                            Some(_) => deadline = Some(Instant::now() + timeout),
                            None => return,
                        },
                        _ = tokio::time::sleep_until(at) => {
                            expire(&ctx, &policy, timeout).await;
                            deadline = None;
                        }
                    }
                }
                None => match activity.recv().await {
                    Some(_) => deadline = Some(Instant::now() + timeout),
                    None => return,
                },
            }
        }
    })
}

async fn expire(ctx: &BrowserContext, policy: &GuardPolicy, timeout: Duration) {
    let user = match ctx.auth.current_user().await {
        Ok(user) => user,
        Err(err) => {
            warn!(event = "idle_user_lookup_failed", error = %err);
            None
        }
    };
    let Some(user) = user else {
        return;
    };
    if let Err(err) = ctx.auth.sign_out().await {
        warn!(event = "sign_out_failed", error = %err);
    }
    info!(
        event = "idle_logout",
        user_id = %user.id,
        idle_secs = timeout.as_secs()
    );
    ctx.notifier.notify(Notice::Inactivity);
    ctx.navigation.push(&policy.login_path);
}
