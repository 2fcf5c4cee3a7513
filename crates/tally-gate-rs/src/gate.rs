//! Edge session gate.
//!
//! Runs in front of every route. Requests that carry identity cookies but no
//! fresh liveness signal are zombies: their cookies are deleted and they are
//! sent to login without ever reaching the identity backend.

use axum::extract::{Request, State};
use axum::http::header::{CACHE_CONTROL, COOKIE, EXPIRES, LOCATION, PRAGMA, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tally_core::presence::{self, SignalFreshness};
use tally_core::{
    CookieDirective, CookieInstruction, GuardPolicy, LifetimePolicy, SessionCookies, StaleReason,
    User,
};
use tracing::{debug, warn};

use crate::AppState;

pub const NO_STORE: &str = "private, no-cache, no-store, max-age=0, must-revalidate";

const BYPASS_EXACT: &[&str] = &[
    "/health",
    "/favicon.ico",
    "/robots.txt",
    "/manifest.json",
    "/manifest.webmanifest",
];
const BYPASS_PREFIXES: &[&str] = &["/static/", "/_next/static/", "/_next/image"];
const BYPASS_EXTENSIONS: &[&str] = &[".svg", ".png", ".jpg", ".jpeg", ".gif", ".webp", ".ico"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Unauthenticated,
    AuthPresentFresh { signal_age_ms: i64 },
    AuthPresentStale(StaleReason),
}

/// The revalidated user, attached to request extensions for handlers.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

pub fn is_bypassed(path: &str) -> bool {
    if BYPASS_EXACT.contains(&path) {
        return true;
    }
    if BYPASS_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    BYPASS_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

pub fn classify_request(cookies: &SessionCookies, policy: &GuardPolicy, now_ms: i64) -> RequestState {
    if !cookies.has_prefix(&policy.auth_cookie_prefix) {
        return RequestState::Unauthenticated;
    }
    match presence::classify_signal(
        cookies.get(&policy.signal_cookie),
        now_ms,
        policy.freshness_window_ms,
    ) {
        SignalFreshness::Fresh { age_ms } => RequestState::AuthPresentFresh {
            signal_age_ms: age_ms,
        },
        SignalFreshness::Stale(reason) => RequestState::AuthPresentStale(reason),
    }
}

pub fn request_cookies(headers: &HeaderMap, now: DateTime<Utc>) -> SessionCookies {
    SessionCookies::from_header_values(
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok()),
    )
    .at(now)
}

pub async fn session_gate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_bypassed(&path) {
        return next.run(request).await;
    }
    if state.policy.is_ungated(&path) {
        let mut response = next.run(request).await;
        apply_no_store(response.headers_mut());
        return response;
    }

    let status = login_redirect_status(request.method());
    let mut cookies = request_cookies(request.headers(), state.clock.now());
    let user = match classify_request(&cookies, &state.policy, state.clock.now_ms()) {
        RequestState::AuthPresentStale(reason) => {
            warn!(
                event = "zombie_purge",
                path = %path,
                reason = reason.as_str(),
                auth_cookies = cookies.names_with_prefix(&state.policy.auth_cookie_prefix).count()
            );
            return zombie_response(&cookies, &state.policy, status);
        }
        RequestState::Unauthenticated => None,
        RequestState::AuthPresentFresh { signal_age_ms } => {
            debug!(event = "revalidate", path = %path, signal_age_ms);
            match state.identity.get_user(&mut cookies).await {
                Ok(user) => user,
                Err(err) => {
                    warn!(event = "revalidate_failed", path = %path, error = %err);
                    None
                }
            }
        }
    };

    let writes = cookies.take_pending();
    let directives = backend_directives(writes, state.lifetime_policy, state.clock.now());
    let Some(user) = user else {
        debug!(event = "login_redirect", path = %path);
        let mut response = redirect(status, &state.policy.login_path, &directives);
        apply_no_store(response.headers_mut());
        return response;
    };

    if !directives.is_empty() {
        // Handlers must see refreshed tokens, not the ones the browser sent.
        match HeaderValue::from_str(&cookies.to_header_value()) {
            Ok(value) => {
                request.headers_mut().remove(COOKIE);
                request.headers_mut().insert(COOKIE, value);
            }
            Err(err) => warn!(event = "cookie_header_rewrite_failed", error = %err),
        }
    }
    request.extensions_mut().insert(AuthenticatedUser(user));

    let mut response = next.run(request).await;
    // A handler that wrote a cookie itself (logout) has the last word on it.
    let handled = set_cookie_names(response.headers());
    let directives: Vec<CookieDirective> = directives
        .into_iter()
        .filter(|directive| !handled.iter().any(|name| name == directive.name()))
        .collect();
    apply_directives(response.headers_mut(), &directives);
    apply_no_store(response.headers_mut());
    response
}

/// `307` keeps the method, which is right for navigations; anything else is
/// sent to the login page as a plain `GET`.
pub fn login_redirect_status(method: &Method) -> StatusCode {
    if method == Method::GET || method == Method::HEAD {
        StatusCode::TEMPORARY_REDIRECT
    } else {
        StatusCode::SEE_OTHER
    }
}

/// Deletions for every identity cookie on the request plus the liveness
/// cookie, then off to login.
pub fn zombie_response(
    cookies: &SessionCookies,
    policy: &GuardPolicy,
    status: StatusCode,
) -> Response {
    let directives: Vec<CookieDirective> = cookies
        .names_with_prefix(&policy.auth_cookie_prefix)
        .map(|name| CookieDirective::Delete(CookieInstruction::delete(name)))
        .chain(std::iter::once(CookieDirective::Delete(
            presence::clear_signal(policy),
        )))
        .collect();
    let mut response = redirect(status, &policy.login_path, &directives);
    apply_no_store(response.headers_mut());
    response
}

pub fn backend_directives(
    writes: Vec<CookieInstruction>,
    policy: LifetimePolicy,
    now: DateTime<Utc>,
) -> Vec<CookieDirective> {
    writes
        .into_iter()
        .map(|instruction| CookieDirective::classify(instruction, policy, now))
        .collect()
}

pub fn redirect(status: StatusCode, location: &str, directives: &[CookieDirective]) -> Response {
    let location = HeaderValue::from_str(location).unwrap_or(HeaderValue::from_static("/"));
    let mut response = (status, [(LOCATION, location)]).into_response();
    apply_directives(response.headers_mut(), directives);
    response
}

pub fn apply_directives(headers: &mut HeaderMap, directives: &[CookieDirective]) {
    for directive in directives {
        match HeaderValue::from_str(&directive.to_header_value()) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(err) => warn!(event = "set_cookie_invalid", cookie = directive.name(), error = %err),
        }
    }
}

fn set_cookie_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split_once('=').map(|(name, _)| name.trim().to_string()))
        .collect()
}

pub fn apply_no_store(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
}
