use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_core::{
    Clock, CookieInstruction, CookieOptions, IdentityBackend, IdentityError, SameSite,
    SessionCookies, SignUpOutcome, User,
};

pub const MEMORY_SESSION_COOKIE: &str = "sb-local-auth-token";

/// Lifetime the backend asks for; the gate decides whether it survives.
const SESSION_COOKIE_MAX_AGE_SECS: i64 = 400 * 24 * 60 * 60;

struct Account {
    user: User,
    password: String,
}

struct Session {
    user: User,
    issued_at_ms: i64,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, Session>,
    codes: HashMap<String, String>,
    minted: u64,
}

/// Process-local identity backend for development and tests.
///
/// Sessions are opaque tokens in a single `sb-local-auth-token` cookie and
/// are rotated on revalidation once they are older than the rotation
/// interval, which exercises the refresh path of the gate.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    rotate_after_ms: i64,
    secure: bool,
    unavailable: AtomicBool,
    lookups: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>, rotate_after: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            rotate_after_ms: rotate_after.as_millis() as i64,
            secure: false,
            unavailable: AtomicBool::new(false),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn add_user(&self, email: &str, password: &str) -> User {
        let email = normalize_email(email);
        let user = User {
            id: format!("user-{}", &sha256_hex(email.as_bytes())[..12]),
            email: Some(email.clone()),
        };
        if let Ok(mut inner) = self.inner.lock() {
            inner.accounts.insert(
                email,
                Account {
                    user: user.clone(),
                    password: password.to_string(),
                },
            );
        }
        user
    }

    /// One-time code for the callback route, as an OAuth provider or a
    /// magic link would hand out.
    pub fn issue_code(&self, email: &str) -> Option<String> {
        let email = normalize_email(email);
        let mut inner = self.inner.lock().ok()?;
        if !inner.accounts.contains_key(&email) {
            return None;
        }
        let code = self.mint(&mut inner, &format!("code:{email}"));
        inner.codes.insert(code.clone(), email);
        Some(code)
    }

    /// Simulate an outage: every call fails as unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `get_user` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.sessions.len())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<(), IdentityError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdentityError::Unreachable(
                "memory backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, IdentityError> {
        self.inner
            .lock()
            .map_err(|_| IdentityError::Unreachable("memory backend poisoned".to_string()))
    }

    fn mint(&self, inner: &mut Inner, seed: &str) -> String {
        inner.minted += 1;
        sha256_hex(format!("{seed}:{}:{}", inner.minted, self.clock.now_ms()).as_bytes())
    }

    fn start_session(&self, inner: &mut Inner, cookies: &mut SessionCookies, user: &User) {
        let token = self.mint(inner, &user.id);
        inner.sessions.insert(
            token.clone(),
            Session {
                user: user.clone(),
                issued_at_ms: self.clock.now_ms(),
            },
        );
        cookies.set(self.session_cookie(token));
    }

    fn session_cookie(&self, token: String) -> CookieInstruction {
        CookieInstruction::new(
            MEMORY_SESSION_COOKIE,
            token,
            CookieOptions::root()
                .with_max_age(SESSION_COOKIE_MAX_AGE_SECS)
                .with_same_site(SameSite::Lax)
                .with_http_only()
                .with_secure(self.secure),
        )
    }

    fn session_deletion(&self) -> CookieInstruction {
        let mut deletion = CookieInstruction::delete(MEMORY_SESSION_COOKIE);
        deletion.options = deletion
            .options
            .with_same_site(SameSite::Lax)
            .with_http_only()
            .with_secure(self.secure);
        deletion
    }
}

#[async_trait]
impl IdentityBackend for MemoryBackend {
    async fn get_user(&self, cookies: &mut SessionCookies) -> Result<Option<User>, IdentityError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;
        let Some(token) = cookies.get(MEMORY_SESSION_COOKIE).map(str::to_string) else {
            return Ok(None);
        };
        let mut inner = self.lock()?;
        let Some(session) = inner.sessions.get(&token) else {
            cookies.set(self.session_deletion());
            return Ok(None);
        };
        let user = session.user.clone();
        if self.clock.now_ms() - session.issued_at_ms >= self.rotate_after_ms {
            inner.sessions.remove(&token);
            self.start_session(&mut inner, cookies, &user);
        }
        Ok(Some(user))
    }

    async fn sign_out(&self, cookies: &mut SessionCookies) -> Result<(), IdentityError> {
        let token = cookies.get(MEMORY_SESSION_COOKIE).map(str::to_string);
        cookies.set(self.session_deletion());
        self.ensure_available()?;
        if let Some(token) = token {
            self.lock()?.sessions.remove(&token);
        }
        Ok(())
    }

    async fn sign_in_with_password(
        &self,
        cookies: &mut SessionCookies,
        email: &str,
        password: &str,
    ) -> Result<User, IdentityError> {
        self.ensure_available()?;
        let mut inner = self.lock()?;
        let user = match inner.accounts.get(&normalize_email(email)) {
            Some(account) if account.password == password => account.user.clone(),
            _ => {
                return Err(IdentityError::InvalidCredentials(
                    "Invalid login credentials".to_string(),
                ))
            }
        };
        self.start_session(&mut inner, cookies, &user);
        Ok(user)
    }

    async fn sign_up(
        &self,
        cookies: &mut SessionCookies,
        email: &str,
        password: &str,
    ) -> Result<SignUpOutcome, IdentityError> {
        self.ensure_available()?;
        if password.len() < 6 {
            return Err(IdentityError::Rejected {
                status: 422,
                message: "Password should be at least 6 characters".to_string(),
            });
        }
        let exists = self.lock()?.accounts.contains_key(&normalize_email(email));
        if exists {
            return Err(IdentityError::Rejected {
                status: 422,
                message: "User already registered".to_string(),
            });
        }
        let user = self.add_user(email, password);
        let mut inner = self.lock()?;
        self.start_session(&mut inner, cookies, &user);
        Ok(SignUpOutcome::SignedIn(user))
    }

    async fn exchange_code_for_session(
        &self,
        cookies: &mut SessionCookies,
        code: &str,
    ) -> Result<User, IdentityError> {
        self.ensure_available()?;
        let mut inner = self.lock()?;
        let user = inner
            .codes
            .remove(code)
            .and_then(|email| inner.accounts.get(&email).map(|account| account.user.clone()))
            .ok_or_else(|| IdentityError::Rejected {
                status: 400,
                message: "invalid or expired auth code".to_string(),
            })?;
        self.start_session(&mut inner, cookies, &user);
        Ok(user)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
