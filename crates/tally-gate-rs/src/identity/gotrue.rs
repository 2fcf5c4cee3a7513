use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    Clock, CookieInstruction, CookieOptions, IdentityBackend, IdentityError, SameSite,
    SessionCookies, SignUpOutcome, User,
};
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};

/// Access tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;
const SESSION_COOKIE_MAX_AGE_SECS: i64 = 400 * 24 * 60 * 60;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3_600;

/// What the session cookie holds, url-encoded JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for a GoTrue (Supabase Auth) server.
pub struct GoTrueBackend {
    http: reqwest::Client,
    base: Url,
    anon_key: String,
    session_cookie: String,
    verifier_cookie: String,
    secure: bool,
    clock: Arc<dyn Clock>,
}

impl GoTrueBackend {
    pub fn new(
        url: &str,
        anon_key: &str,
        project_ref: &str,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let base = Url::parse(&format!("{}/auth/v1/", url.trim().trim_end_matches('/')))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let session_cookie = format!("sb-{project_ref}-auth-token");
        Ok(Self {
            http,
            base,
            anon_key: anon_key.to_string(),
            verifier_cookie: format!("{session_cookie}-code-verifier"),
            session_cookie,
            secure: false,
            clock,
        })
    }

    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn session_cookie_name(&self) -> &str {
        &self.session_cookie
    }

    pub fn verifier_cookie_name(&self) -> &str {
        &self.verifier_cookie
    }

    /// Encode a session the way it is stored in the cookie.
    pub fn encode_session(session: &StoredSession) -> Result<String, IdentityError> {
        let raw = serde_json::to_string(session)
            .map_err(|err| IdentityError::MalformedSession(err.to_string()))?;
        Ok(form_urlencoded::byte_serialize(raw.as_bytes()).collect())
    }

    fn decode_session(raw: &str) -> Result<StoredSession, IdentityError> {
        let decoded = form_urlencoded::parse(raw.as_bytes())
            .next()
            .map(|(value, _)| value.into_owned())
            .unwrap_or_default();
        serde_json::from_str(&decoded).map_err(|err| IdentityError::MalformedSession(err.to_string()))
    }

    fn read_session(&self, cookies: &SessionCookies) -> Result<Option<StoredSession>, IdentityError> {
        match cookies.get(&self.session_cookie) {
            Some(raw) => Self::decode_session(raw).map(Some),
            None => Ok(None),
        }
    }

    fn write_session(
        &self,
        cookies: &mut SessionCookies,
        token: &TokenResponse,
    ) -> Result<StoredSession, IdentityError> {
        let now_secs = self.clock.now_ms() / 1000;
        let session = StoredSession {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_at
                .unwrap_or(now_secs + token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)),
        };
        cookies.set(CookieInstruction::new(
            self.session_cookie.clone(),
            Self::encode_session(&session)?,
            CookieOptions::root()
                .with_max_age(SESSION_COOKIE_MAX_AGE_SECS)
                .with_same_site(SameSite::Lax)
                .with_secure(self.secure),
        ));
        Ok(session)
    }

    fn drop_session(&self, cookies: &mut SessionCookies) {
        let mut deletion = CookieInstruction::delete(self.session_cookie.clone());
        deletion.options = deletion
            .options
            .with_same_site(SameSite::Lax)
            .with_secure(self.secure);
        cookies.set(deletion);
    }

    fn endpoint(&self, path: &str, grant_type: Option<&str>) -> Result<Url, IdentityError> {
        let mut url = self
            .base
            .join(path)
            .map_err(|err| IdentityError::Unreachable(err.to_string()))?;
        if let Some(grant_type) = grant_type {
            url.query_pairs_mut().append_pair("grant_type", grant_type);
        }
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, IdentityError> {
        request
            .header("apikey", &self.anon_key)
            .send()
            .await
            .map_err(|err| IdentityError::Unreachable(err.to_string()))
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> Result<Response, IdentityError> {
        let url = self.endpoint("token", Some(grant_type))?;
        self.send(self.http.post(url).json(&body)).await
    }

    async fn parse_token(response: Response) -> Result<TokenResponse, IdentityError> {
        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| IdentityError::MalformedSession(err.to_string()))
    }

    /// `Ok(None)` means the refresh token was refused and the session is gone.
    async fn refresh(
        &self,
        cookies: &mut SessionCookies,
        refresh_token: &str,
    ) -> Result<Option<StoredSession>, IdentityError> {
        let response = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        match response.status() {
            status if status.is_success() => {
                let token = Self::parse_token(response).await?;
                debug!(event = "session_refreshed", user_id = %token.user.id);
                self.write_session(cookies, &token).map(Some)
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                info!(event = "refresh_rejected", status = response.status().as_u16());
                self.drop_session(cookies);
                Ok(None)
            }
            _ => Err(rejection(response).await),
        }
    }
}

#[async_trait]
impl IdentityBackend for GoTrueBackend {
    async fn get_user(&self, cookies: &mut SessionCookies) -> Result<Option<User>, IdentityError> {
        let session = match self.read_session(cookies) {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(event = "session_cookie_malformed", error = %err);
                self.drop_session(cookies);
                return Ok(None);
            }
        };
        let now_secs = self.clock.now_ms() / 1000;
        let session = if session.expires_at - now_secs <= REFRESH_MARGIN_SECS {
            match self.refresh(cookies, &session.refresh_token).await? {
                Some(session) => session,
                None => return Ok(None),
            }
        } else {
            session
        };

        let url = self.endpoint("user", None)?;
        let response = self
            .send(self.http.get(url).bearer_auth(&session.access_token))
            .await?;
        match response.status() {
            status if status.is_success() => response
                .json::<User>()
                .await
                .map(Some)
                .map_err(|err| IdentityError::MalformedSession(err.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.drop_session(cookies);
                Ok(None)
            }
            _ => Err(rejection(response).await),
        }
    }

    async fn sign_out(&self, cookies: &mut SessionCookies) -> Result<(), IdentityError> {
        let session = self.read_session(cookies).ok().flatten();
        self.drop_session(cookies);
        let Some(session) = session else {
            return Ok(());
        };
        let url = self.endpoint("logout", None)?;
        let response = self
            .send(self.http.post(url).bearer_auth(&session.access_token))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // Already revoked or expired server-side.
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(rejection(response).await),
        }
    }

    async fn sign_in_with_password(
        &self,
        cookies: &mut SessionCookies,
        email: &str,
        password: &str,
    ) -> Result<User, IdentityError> {
        let response = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        match response.status() {
            status if status.is_success() => {
                let token = Self::parse_token(response).await?;
                self.write_session(cookies, &token)?;
                Ok(token.user)
            }
            StatusCode::BAD_REQUEST => match rejection(response).await {
                IdentityError::Rejected { message, .. } => {
                    Err(IdentityError::InvalidCredentials(message))
                }
                other => Err(other),
            },
            _ => Err(rejection(response).await),
        }
    }

    async fn sign_up(
        &self,
        cookies: &mut SessionCookies,
        email: &str,
        password: &str,
    ) -> Result<SignUpOutcome, IdentityError> {
        let url = self.endpoint("signup", None)?;
        let response = self
            .send(
                self.http
                    .post(url)
                    .json(&json!({ "email": email, "password": password })),
            )
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| IdentityError::MalformedSession(err.to_string()))?;
        if body.get("access_token").is_none() {
            return Ok(SignUpOutcome::ConfirmationRequired);
        }
        let token: TokenResponse = serde_json::from_value(body)
            .map_err(|err| IdentityError::MalformedSession(err.to_string()))?;
        self.write_session(cookies, &token)?;
        Ok(SignUpOutcome::SignedIn(token.user))
    }

    async fn exchange_code_for_session(
        &self,
        cookies: &mut SessionCookies,
        code: &str,
    ) -> Result<User, IdentityError> {
        let verifier = cookies
            .get(&self.verifier_cookie)
            .map(str::to_string)
            .ok_or(IdentityError::MissingCodeVerifier)?;
        cookies.set(CookieInstruction::delete(self.verifier_cookie.clone()));
        let response = self
            .token_grant(
                "pkce",
                json!({ "auth_code": code, "code_verifier": verifier }),
            )
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        let token = Self::parse_token(response).await?;
        self.write_session(cookies, &token)?;
        Ok(token.user)
    }
}

async fn rejection(response: Response) -> IdentityError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let message = parsed
        .error_description
        .or(parsed.msg)
        .or(parsed.message)
        .or(parsed.error)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string()
        });
    IdentityError::Rejected {
        status: status.as_u16(),
        message,
    }
}
