//! Shared protocol pieces for the Tally session guard.
//!
//! The edge gate (`tally-gate-rs`) and the presence monitor (`tally-presence`)
//! agree on three things defined here: how the liveness signal is encoded and
//! judged, how cookie writes are classified before they reach a response, and
//! which thresholds apply.

pub mod clock;
pub mod cookie;
pub mod identity;
pub mod policy;
pub mod presence;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cookie::{
    parse_cookie_header, CookieDirective, CookieInstruction, CookieOptions, LifetimePolicy,
    SameSite, SessionCookies,
};
pub use identity::{IdentityBackend, IdentityError, SignUpOutcome, User};
pub use policy::{GuardPolicy, PolicyError};
pub use presence::{SignalFreshness, StaleReason};
