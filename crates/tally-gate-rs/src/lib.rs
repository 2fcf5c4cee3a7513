//! Edge session gate and the auth surface around it.

pub mod config;
pub mod gate;
pub mod identity;
pub mod logging;
pub mod routes;

use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use tally_core::{Clock, GuardPolicy, IdentityBackend, LifetimePolicy};

pub use gate::{AuthenticatedUser, RequestState};

pub struct AppState {
    pub policy: GuardPolicy,
    pub identity: Arc<dyn IdentityBackend>,
    pub clock: Arc<dyn Clock>,
    pub lifetime_policy: LifetimePolicy,
    /// Honour `X-Forwarded-Host` when redirecting out of the auth callback.
    pub production: bool,
}

impl AppState {
    pub fn new(policy: GuardPolicy, identity: Arc<dyn IdentityBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            identity,
            clock,
            lifetime_policy: LifetimePolicy::SessionScoped,
            production: false,
        }
    }

    pub fn with_lifetime_policy(mut self, lifetime_policy: LifetimePolicy) -> Self {
        self.lifetime_policy = lifetime_policy;
        self
    }

    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(routes::home))
        .route("/api/session", get(routes::session_info))
        .route("/login", get(routes::login_page).post(routes::login))
        .route("/login/signup", post(routes::signup))
        .route("/logout", post(routes::logout))
        .route("/auth/callback", get(routes::auth_callback))
        .route("/auth/auth-code-error", get(routes::auth_code_error))
        .route("/health", get(routes::health))
        .fallback(routes::not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gate::session_gate,
        ))
        .with_state(state)
}
