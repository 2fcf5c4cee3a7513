//! Capabilities the monitor needs from the page it is mounted in.
//!
//! A browser binding implements these over `sessionStorage`,
//! `document.cookie`, the navigation timing entry, the router and the toast
//! layer. Tests implement them in memory.

use async_trait::async_trait;
use std::sync::Arc;
use tally_core::{Clock, CookieInstruction, IdentityError, User};
use tokio::sync::mpsc;

/// Navigation timing classification of the current document load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationType {
    Navigate,
    Reload,
    BackForward,
    Prerender,
}

/// User-interaction events the monitor listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    MouseDown,
    MouseMove,
    KeyDown,
    Scroll,
    TouchStart,
    /// Document became visible again.
    VisibilityChange,
}

impl ActivityKind {
    pub fn dom_name(&self) -> &'static str {
        match self {
            ActivityKind::MouseDown => "mousedown",
            ActivityKind::MouseMove => "mousemove",
            ActivityKind::KeyDown => "keydown",
            ActivityKind::Scroll => "scroll",
            ActivityKind::TouchStart => "touchstart",
            ActivityKind::VisibilityChange => "visibilitychange",
        }
    }
}

/// Events that re-arm the idle deadline.
pub const IDLE_RESET_EVENTS: [ActivityKind; 5] = [
    ActivityKind::MouseDown,
    ActivityKind::MouseMove,
    ActivityKind::KeyDown,
    ActivityKind::Scroll,
    ActivityKind::TouchStart,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// User-facing message shown before a forced navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Inactivity,
    SessionRestored,
    SignedOut,
}

impl Notice {
    pub fn message(&self) -> &'static str {
        match self {
            Notice::Inactivity => "You were signed out after a long period of inactivity.",
            Notice::SessionRestored => "For your security, restored sessions are signed out.",
            Notice::SignedOut => "You have been signed out.",
        }
    }
}

/// Storage scoped to one browsing context (`sessionStorage`).
pub trait TabStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn clear(&self);
}

/// Cookies as visible to page script.
pub trait ScriptCookies: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn write(&self, instruction: &CookieInstruction);
}

pub trait Navigation: Send + Sync {
    /// `None` when the host exposes no navigation timing entry.
    fn navigation_type(&self) -> Option<NavigationType>;
    /// Full document load; drops all in-memory page state.
    fn hard_redirect(&self, path: &str);
    /// Client-side route change.
    fn push(&self, path: &str);
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

pub trait ActivitySource: Send + Sync {
    fn add_listener(
        &self,
        kind: ActivityKind,
        sink: mpsc::UnboundedSender<ActivityKind>,
    ) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

/// Browser-side view of the identity backend.
#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn current_user(&self) -> Result<Option<User>, IdentityError>;
    async fn sign_out(&self) -> Result<(), IdentityError>;
}

/// Everything a mounted monitor talks to.
#[derive(Clone)]
pub struct BrowserContext {
    pub storage: Arc<dyn TabStorage>,
    pub cookies: Arc<dyn ScriptCookies>,
    pub navigation: Arc<dyn Navigation>,
    pub notifier: Arc<dyn Notifier>,
    pub activity: Arc<dyn ActivitySource>,
    pub auth: Arc<dyn AuthClient>,
    pub clock: Arc<dyn Clock>,
}
