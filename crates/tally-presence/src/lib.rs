//! Client presence monitor.
//!
//! Mounted by every view, the login page included, so a tab has its activity
//! flag before anyone signs in. It refuses to let the view render until boot
//! validation has ruled out a restored tab, then keeps the liveness signal
//! fresh and signs the user out after a long idle stretch.

pub mod boot;
pub mod heartbeat;
pub mod host;
mod idle;
pub mod monitor;

pub use boot::{BootOutcome, BootSuspicion};
pub use host::{
    ActivityKind, ActivitySource, AuthClient, BrowserContext, ListenerId, Navigation,
    NavigationType, Notice, Notifier, ScriptCookies, TabStorage,
};
pub use monitor::{PresenceMonitor, RenderGate};
