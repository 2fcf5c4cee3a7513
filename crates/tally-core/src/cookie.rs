use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const EXPIRES_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes attached to a cookie write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Lifetime in seconds. Zero or negative means "delete".
    pub max_age: Option<i64>,
    pub expires: Option<DateTime<Utc>>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<SameSite>,
}

impl CookieOptions {
    pub fn root() -> Self {
        Self {
            path: Some("/".to_string()),
            ..Self::default()
        }
    }

    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    pub fn with_http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// True when these options instruct the browser to drop the cookie.
    pub fn is_deletion(&self, now: DateTime<Utc>) -> bool {
        if let Some(max_age) = self.max_age {
            return max_age <= 0;
        }
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn without_lifetime(mut self) -> Self {
        self.max_age = None;
        self.expires = None;
        self
    }
}

/// A cookie write as requested by some collaborator (usually the identity
/// backend's `setAll` callback), before any lifetime policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieInstruction {
    pub name: String,
    pub value: String,
    pub options: CookieOptions,
}

impl CookieInstruction {
    pub fn new(name: impl Into<String>, value: impl Into<String>, options: CookieOptions) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            options,
        }
    }

    /// Root-path deletion, the shape every purge uses.
    pub fn delete(name: impl Into<String>) -> Self {
        let mut options = CookieOptions::root().with_max_age(0);
        options.expires = DateTime::from_timestamp(0, 0);
        Self::new(name, "", options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifetimePolicy {
    /// Strip lifetimes from affirmative writes so the cookie dies with the
    /// browser process.
    #[default]
    SessionScoped,
    Preserve,
}

/// What actually gets written to a response for one cookie.
///
/// A deletion is its own variant and is never re-shaped: only the two `Set*`
/// variants are produced by lifetime coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieDirective {
    Delete(CookieInstruction),
    SetSessionScoped(CookieInstruction),
    SetPersistent(CookieInstruction),
}

impl CookieDirective {
    pub fn classify(
        instruction: CookieInstruction,
        policy: LifetimePolicy,
        now: DateTime<Utc>,
    ) -> Self {
        if instruction.options.is_deletion(now) {
            return CookieDirective::Delete(instruction);
        }
        match policy {
            LifetimePolicy::SessionScoped => CookieDirective::SetSessionScoped(CookieInstruction {
                options: instruction.options.without_lifetime(),
                ..instruction
            }),
            LifetimePolicy::Preserve => {
                if instruction.options.max_age.is_none() && instruction.options.expires.is_none() {
                    CookieDirective::SetSessionScoped(instruction)
                } else {
                    CookieDirective::SetPersistent(instruction)
                }
            }
        }
    }

    pub fn instruction(&self) -> &CookieInstruction {
        match self {
            CookieDirective::Delete(instruction)
            | CookieDirective::SetSessionScoped(instruction)
            | CookieDirective::SetPersistent(instruction) => instruction,
        }
    }

    pub fn name(&self) -> &str {
        &self.instruction().name
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, CookieDirective::Delete(_))
    }

    /// Render as a `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let instruction = self.instruction();
        let options = &instruction.options;
        let mut out = format!("{}={}", instruction.name, instruction.value);
        if let Some(path) = &options.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(domain) = &options.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(max_age) = options.max_age {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if let Some(expires) = options.expires {
            out.push_str(&format!("; Expires={}", expires.format(EXPIRES_FORMAT)));
        }
        if options.http_only {
            out.push_str("; HttpOnly");
        }
        if options.secure {
            out.push_str("; Secure");
        }
        if let Some(same_site) = options.same_site {
            out.push_str(&format!("; SameSite={same_site}"));
        }
        out
    }
}

/// Parse a `Cookie` request header into ordered name/value pairs.
pub fn parse_cookie_header(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
                .unwrap_or(value);
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// The cookie callback contract handed to an identity backend: `get_all`
/// reads the request's cookies, `set_all` queues writes for the response and
/// updates the readable view so later reads in the same request see them.
#[derive(Debug, Clone, Default)]
pub struct SessionCookies {
    jar: Vec<(String, String)>,
    pending: Vec<CookieInstruction>,
    /// Request time used to tell an `Expires`-only write from a deletion.
    now: Option<DateTime<Utc>>,
}

impl SessionCookies {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self {
            jar: pairs,
            pending: Vec::new(),
            now: None,
        }
    }

    /// Pin the request time so `set_all` agrees with `CookieDirective::classify`
    /// under an injected clock.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn from_header_values<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let pairs = values.into_iter().flat_map(parse_cookie_header).collect();
        Self::new(pairs)
    }

    pub fn get_all(&self) -> &[(String, String)] {
        &self.jar
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.jar
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn names_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.jar
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(move |name| name.starts_with(prefix))
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.names_with_prefix(prefix).next().is_some()
    }

    pub fn set(&mut self, instruction: CookieInstruction) {
        self.set_all(vec![instruction]);
    }

    pub fn set_all(&mut self, instructions: Vec<CookieInstruction>) {
        let now = self.now.unwrap_or_else(Utc::now);
        for instruction in instructions {
            self.jar.retain(|(name, _)| name != &instruction.name);
            if !instruction.options.is_deletion(now) {
                self.jar
                    .push((instruction.name.clone(), instruction.value.clone()));
            }
            self.pending.push(instruction);
        }
    }

    pub fn pending(&self) -> &[CookieInstruction] {
        &self.pending
    }

    pub fn take_pending(&mut self) -> Vec<CookieInstruction> {
        std::mem::take(&mut self.pending)
    }

    /// The readable view re-serialized as a `Cookie` header.
    pub fn to_header_value(&self) -> String {
        self.jar
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_cookie_header_pairs() {
        let pairs = parse_cookie_header("sb-a-auth-token=abc; session_presence=\"17\" ; junk; =x");
        assert_eq!(
            pairs,
            vec![
                ("sb-a-auth-token".to_string(), "abc".to_string()),
                ("session_presence".to_string(), "17".to_string()),
            ]
        );
    }

    #[test]
    fn zero_max_age_is_passed_through_as_delete() {
        let instruction = CookieInstruction::new(
            "sb-x-auth-token",
            "",
            CookieOptions::root().with_max_age(0).with_http_only(),
        );
        let directive = CookieDirective::classify(
            instruction.clone(),
            LifetimePolicy::SessionScoped,
            now(),
        );
        assert_eq!(directive, CookieDirective::Delete(instruction));
        let header = directive.to_header_value();
        assert!(header.contains("Max-Age=0"), "{header}");
    }

    #[test]
    fn negative_max_age_keeps_its_value() {
        let instruction =
            CookieInstruction::new("sb-x", "", CookieOptions::root().with_max_age(-1));
        let directive = CookieDirective::classify(instruction, LifetimePolicy::Preserve, now());
        assert!(directive.is_delete());
        assert!(directive.to_header_value().contains("Max-Age=-1"));
    }

    #[test]
    fn past_expires_without_max_age_is_a_delete() {
        let mut options = CookieOptions::root();
        options.expires = Some(now() - Duration::seconds(1));
        let directive = CookieDirective::classify(
            CookieInstruction::new("sb-x", "", options),
            LifetimePolicy::SessionScoped,
            now(),
        );
        assert!(directive.is_delete());
        assert!(directive.to_header_value().contains("Expires="));
    }

    #[test]
    fn affirmative_write_is_coerced_to_session_scope() {
        let mut options = CookieOptions::root()
            .with_max_age(34_560_000)
            .with_same_site(SameSite::Lax);
        options.expires = Some(now() + Duration::days(400));
        let directive = CookieDirective::classify(
            CookieInstruction::new("sb-x-auth-token", "tok", options),
            LifetimePolicy::SessionScoped,
            now(),
        );
        match &directive {
            CookieDirective::SetSessionScoped(instruction) => {
                assert_eq!(instruction.options.max_age, None);
                assert_eq!(instruction.options.expires, None);
                assert_eq!(instruction.options.same_site, Some(SameSite::Lax));
            }
            other => panic!("unexpected directive {other:?}"),
        }
        assert_eq!(
            directive.to_header_value(),
            "sb-x-auth-token=tok; Path=/; SameSite=Lax"
        );
    }

    #[test]
    fn preserve_policy_keeps_persistent_lifetime() {
        let directive = CookieDirective::classify(
            CookieInstruction::new("theme", "dark", CookieOptions::root().with_max_age(60)),
            LifetimePolicy::Preserve,
            now(),
        );
        assert!(matches!(directive, CookieDirective::SetPersistent(_)));
    }

    #[test]
    fn set_all_updates_readable_view_and_queues_writes() {
        let mut cookies = SessionCookies::from_header_values(["sb-a=1; other=2"]);
        cookies.set_all(vec![
            CookieInstruction::new("sb-a", "2", CookieOptions::root()),
            CookieInstruction::delete("other"),
        ]);
        assert_eq!(cookies.get("sb-a"), Some("2"));
        assert_eq!(cookies.get("other"), None);
        assert_eq!(cookies.pending().len(), 2);
        assert_eq!(cookies.to_header_value(), "sb-a=2");
        assert_eq!(cookies.take_pending().len(), 2);
        assert!(cookies.pending().is_empty());
    }

    #[test]
    fn expires_only_write_is_judged_at_the_pinned_request_time() {
        let now = DateTime::from_timestamp(4_102_444_800, 0).expect("2100-01-01");
        let lapsed = DateTime::from_timestamp(2_524_608_000, 0).expect("2050-01-01");
        let mut options = CookieOptions::root();
        options.expires = Some(lapsed);
        let instruction = CookieInstruction::new("sb-a", "stale", options);

        let mut cookies = SessionCookies::from_header_values(["sb-a=1"]).at(now);
        cookies.set_all(vec![instruction.clone()]);
        assert_eq!(cookies.get("sb-a"), None);
        assert!(CookieDirective::classify(instruction, LifetimePolicy::SessionScoped, now).is_delete());
    }
}
