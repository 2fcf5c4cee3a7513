use std::sync::Arc;
use tally_core::presence;
use tally_core::GuardPolicy;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::boot::{validate_boot, BootOutcome};
use crate::heartbeat::spawn_heartbeat;
use crate::host::{ActivityKind, BrowserContext, ListenerId, Notice, IDLE_RESET_EVENTS};
use crate::idle::spawn_idle_watch;

/// What the protected subtree may show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderGate {
    /// Blocking "security check in progress" state.
    Checking,
    Ready,
    Purged,
}

/// Presence monitor for one mounted protected view.
///
/// Timers and listeners belong to the instance and are released by
/// [`PresenceMonitor::unmount`] or on drop; nothing is process-global.
pub struct PresenceMonitor {
    ctx: BrowserContext,
    policy: Arc<GuardPolicy>,
    gate: watch::Sender<RenderGate>,
    tasks: Vec<JoinHandle<()>>,
    listeners: Vec<ListenerId>,
}

impl PresenceMonitor {
    pub fn new(ctx: BrowserContext, policy: GuardPolicy) -> Self {
        let (gate, _) = watch::channel(RenderGate::Checking);
        Self {
            ctx,
            policy: Arc::new(policy),
            gate,
            tasks: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn render_gate(&self) -> watch::Receiver<RenderGate> {
        self.gate.subscribe()
    }

    pub fn current_gate(&self) -> RenderGate {
        *self.gate.borrow()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Run boot validation and, only if it passes, start the heartbeat and the
    /// idle watch. Mounting an already mounted monitor tears it down first.
    pub async fn mount(&mut self) -> BootOutcome {
        self.unmount();
        self.gate.send_replace(RenderGate::Checking);

        let outcome = validate_boot(&self.ctx, &self.policy).await;
        if outcome == BootOutcome::Purged {
            self.gate.send_replace(RenderGate::Purged);
            return outcome;
        }

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        self.listeners.push(
            self.ctx
                .activity
                .add_listener(ActivityKind::VisibilityChange, wake_tx),
        );
        self.tasks.push(spawn_heartbeat(
            self.ctx.clone(),
            self.policy.clone(),
            wake_rx,
        ));

        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        for kind in IDLE_RESET_EVENTS {
            self.listeners
                .push(self.ctx.activity.add_listener(kind, activity_tx.clone()));
        }
        drop(activity_tx);
        self.tasks.push(spawn_idle_watch(
            self.ctx.clone(),
            self.policy.clone(),
            activity_rx,
        ));

        self.gate.send_replace(RenderGate::Ready);
        info!(
            event = "monitor_mounted",
            listeners = self.listeners.len(),
            heartbeat_ms = self.policy.heartbeat_interval_ms,
            idle_ms = self.policy.idle_timeout_ms
        );
        outcome
    }

    /// User-initiated sign-out: wipe local state, revoke, go to login.
    pub async fn sign_out_now(&mut self) {
        self.unmount();
        self.ctx.storage.clear();
        self.ctx
            .cookies
            .write(&presence::clear_signal(&self.policy));
        if let Err(err) = self.ctx.auth.sign_out().await {
            warn!(event = "sign_out_failed", error = %err);
        }
        self.ctx.notifier.notify(Notice::SignedOut);
        self.gate.send_replace(RenderGate::Purged);
        self.ctx.navigation.hard_redirect(&self.policy.login_path);
    }

    /// Stop every timer and detach every listener. Safe to call repeatedly.
    pub fn unmount(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for id in self.listeners.drain(..) {
            self.ctx.activity.remove_listener(id);
        }
    }
}

impl Drop for PresenceMonitor {
    fn drop(&mut self) {
        self.unmount();
    }
}
