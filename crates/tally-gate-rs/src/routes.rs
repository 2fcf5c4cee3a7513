use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::{Extension, Form, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tally_core::presence;
use tally_core::{CookieDirective, CookieInstruction, IdentityError, SessionCookies, SignUpOutcome};
use tracing::{info, warn};
use url::form_urlencoded;

use crate::gate::{backend_directives, redirect, request_cookies, AuthenticatedUser};
use crate::AppState;

pub const AUTH_CODE_ERROR_PATH: &str = "/auth/auth-code-error";

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginPageQuery {
    pub error: Option<String>,
    pub notice: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub next: Option<String>,
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn login_page(Query(query): Query<LoginPageQuery>) -> Html<String> {
    let mut banner = String::new();
    if let Some(error) = query.error.filter(|value| !value.is_empty()) {
        banner.push_str(&format!(
            "<p class=\"error\" role=\"alert\">{}</p>",
            escape_html(&error)
        ));
    }
    if let Some(notice) = query.notice.filter(|value| !value.is_empty()) {
        banner.push_str(&format!(
            "<p class=\"notice\" role=\"status\">{}</p>",
            escape_html(&notice)
        ));
    }
    Html(format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Sign in</title></head>
<body>
<main>
<h1>Sign in</h1>
{banner}
<form method="post" action="/login">
<label>Email <input name="email" type="email" autocomplete="username" required></label>
<label>Password <input name="password" type="password" autocomplete="current-password" required></label>
<button type="submit">Log in</button>
<button type="submit" formaction="/login/signup">Sign up</button>
</form>
</main>
</body>
</html>"#
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<Credentials>,
) -> Response {
    let mut cookies = request_cookies(&headers, state.clock.now());
    let email = form.email.trim();
    match state
        .identity
        .sign_in_with_password(&mut cookies, email, &form.password)
        .await
    {
        Ok(user) => {
            info!(event = "login", user_id = %user.id);
            signed_in_redirect(&state, &mut cookies, "/")
        }
        Err(err) => {
            warn!(event = "login_failed", error = %err);
            let directives = take_directives(&state, &mut cookies);
            redirect(
                StatusCode::SEE_OTHER,
                &login_url("error", &login_failure_message(&err)),
                &directives,
            )
        }
    }
}

pub async fn signup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<Credentials>,
) -> Response {
    let mut cookies = request_cookies(&headers, state.clock.now());
    match state
        .identity
        .sign_up(&mut cookies, form.email.trim(), &form.password)
        .await
    {
        Ok(SignUpOutcome::SignedIn(user)) => {
            info!(event = "signup", user_id = %user.id, confirmed = true);
            signed_in_redirect(&state, &mut cookies, "/")
        }
        Ok(SignUpOutcome::ConfirmationRequired) => {
            info!(event = "signup", confirmed = false);
            let directives = take_directives(&state, &mut cookies);
            redirect(
                StatusCode::SEE_OTHER,
                &login_url("notice", "Check your email to confirm your account"),
                &directives,
            )
        }
        Err(err) => {
            warn!(event = "signup_failed", error = %err);
            let message = match err {
                IdentityError::Rejected { message, .. } => message,
                other => login_failure_message(&other),
            };
            let directives = take_directives(&state, &mut cookies);
            redirect(StatusCode::SEE_OTHER, &login_url("error", &message), &directives)
        }
    }
}

/// Revoke at the backend, then drop every cookie the browser sent.
pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let mut cookies = request_cookies(&headers, state.clock.now());
    let names: Vec<String> = cookies
        .get_all()
        .iter()
        .map(|(name, _)| name.clone())
        .collect();
    if let Err(err) = state.identity.sign_out(&mut cookies).await {
        warn!(event = "sign_out_failed", error = %err);
    }
    let mut directives = take_directives(&state, &mut cookies);
    for name in names {
        if !directives.iter().any(|directive| directive.name() == name) {
            directives.push(CookieDirective::Delete(CookieInstruction::delete(name)));
        }
    }
    info!(event = "logout", cleared = directives.len());
    redirect(StatusCode::SEE_OTHER, &state.policy.login_path, &directives)
}

pub async fn auth_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let mut cookies = request_cookies(&headers, state.clock.now());
    let Some(code) = query.code.filter(|code| !code.is_empty()) else {
        warn!(event = "auth_callback_failed", error = "missing code");
        return redirect(StatusCode::TEMPORARY_REDIRECT, AUTH_CODE_ERROR_PATH, &[]);
    };
    match state
        .identity
        .exchange_code_for_session(&mut cookies, &code)
        .await
    {
        Ok(user) => {
            let next = sanitize_next(query.next.as_deref());
            let target = match forwarded_host(&headers) {
                Some(host) if state.production => format!("https://{host}{next}"),
                _ => next,
            };
            info!(event = "auth_callback", user_id = %user.id, location = %target);
            signed_in_redirect(&state, &mut cookies, &target)
        }
        Err(err) => {
            warn!(event = "auth_callback_failed", error = %err);
            let directives = take_directives(&state, &mut cookies);
            redirect(
                StatusCode::TEMPORARY_REDIRECT,
                AUTH_CODE_ERROR_PATH,
                &directives,
            )
        }
    }
}

pub async fn auth_code_error() -> (StatusCode, Html<&'static str>) {
    (
        StatusCode::BAD_REQUEST,
        Html(
            r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Sign-in link problem</title></head>
<body>
<main>
<h1>That sign-in link did not work</h1>
<p>It may have expired or already been used. <a href="/login">Back to sign in</a></p>
</main>
</body>
</html>"#,
        ),
    )
}

pub async fn home(Extension(AuthenticatedUser(user)): Extension<AuthenticatedUser>) -> Html<String> {
    let email = user.email.as_deref().unwrap_or("unknown");
    Html(format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Tally</title></head>
<body>
<main data-presence-monitor="required">
<p>Signed in as {}</p>
<form method="post" action="/logout"><button type="submit">Log out</button></form>
</main>
</body>
</html>"#,
        escape_html(email)
    ))
}

pub async fn session_info(
    Extension(AuthenticatedUser(user)): Extension<AuthenticatedUser>,
) -> Json<serde_json::Value> {
    Json(json!({ "user": { "id": user.id, "email": user.email } }))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

/// Backend cookie writes plus the first liveness signal, which has to outlive
/// the redirect into the app until the page's own heartbeat takes over.
fn signed_in_redirect(state: &AppState, cookies: &mut SessionCookies, location: &str) -> Response {
    let mut directives = take_directives(state, cookies);
    directives.push(CookieDirective::SetPersistent(presence::login_signal(
        &state.policy,
        state.clock.now_ms(),
    )));
    redirect(StatusCode::SEE_OTHER, location, &directives)
}

fn take_directives(state: &AppState, cookies: &mut SessionCookies) -> Vec<CookieDirective> {
    backend_directives(
        cookies.take_pending(),
        state.lifetime_policy,
        state.clock.now(),
    )
}

fn login_failure_message(err: &IdentityError) -> String {
    match err {
        IdentityError::InvalidCredentials(message) => message.clone(),
        IdentityError::Unreachable(_) => "Sign-in is temporarily unavailable".to_string(),
        _ => "Could not sign in".to_string(),
    }
}

fn login_url(key: &str, message: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair(key, message)
        .finish();
    format!("/login?{query}")
}

/// Only same-origin absolute paths are followed.
pub fn sanitize_next(next: Option<&str>) -> String {
    match next {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

fn forwarded_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get("x-forwarded-host")?.to_str().ok()?.trim();
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    valid.then(|| host.to_string())
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn next_must_be_a_local_path() {
        assert_eq!(sanitize_next(Some("/reports?tab=2")), "/reports?tab=2");
        assert_eq!(sanitize_next(Some("//evil.example")), "/");
        assert_eq!(sanitize_next(Some("https://evil.example")), "/");
        assert_eq!(sanitize_next(Some("/\\evil")), "/");
        assert_eq!(sanitize_next(None), "/");
    }

    #[test]
    fn forwarded_host_rejects_odd_characters() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-host", HeaderValue::from_static("app.example.com"));
        assert_eq!(forwarded_host(&headers).as_deref(), Some("app.example.com"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("a.com/evil"));
        assert_eq!(forwarded_host(&headers), None);
    }

    #[test]
    fn login_messages_are_escaped_and_encoded() {
        assert_eq!(escape_html("<b>\"x\"</b>"), "&lt;b&gt;&quot;x&quot;&lt;/b&gt;");
        assert_eq!(
            login_url("error", "Invalid login credentials"),
            "/login?error=Invalid+login+credentials"
        );
    }
}
