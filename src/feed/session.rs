use std::fmt;

use chrono::{DateTime, Duration, Utc};

/// How long the feed keeps a session alive without authenticated calls.
pub const IDLE_WINDOW_SECS: i64 = 120;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated feed session owned by the caller.
///
/// The feed expires cookies after [`IDLE_WINDOW_SECS`] of inactivity, so every
/// successful authenticated call pushes `expires_at` forward.
#[derive(Debug, Clone)]
pub struct Session {
    credentials: Credentials,
    cookies: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cookies: Vec::new(),
            expires_at: None,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now < at)
    }

    pub fn establish(&mut self, cookies: Vec<String>, now: DateTime<Utc>) {
        self.cookies = cookies;
        self.touch(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.expires_at = Some(now + Duration::seconds(IDLE_WINDOW_SECS));
    }

    pub fn invalidate(&mut self) {
        self.cookies.clear();
        self.expires_at = None;
    }

    /// Value for the `Cookie` request header.
    pub fn cookie_header(&self) -> Option<String> {
        (!self.cookies.is_empty()).then(|| self.cookies.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_not_live() {
        let session = Session::new(Credentials::new("bot", "secret"));
        assert!(!session.is_live_at(Utc::now()));
        assert!(session.cookie_header().is_none());
    }

    #[test]
    fn touch_extends_idle_window() {
        let now = Utc::now();
        let mut session = Session::new(Credentials::new("bot", "secret"));
        session.establish(vec!["RETS-Session-ID=abc".into(), "X=1".into()], now);

        assert!(session.is_live_at(now + Duration::seconds(IDLE_WINDOW_SECS - 1)));
        assert!(!session.is_live_at(now + Duration::seconds(IDLE_WINDOW_SECS)));
        assert_eq!(
            session.cookie_header().as_deref(),
            Some("RETS-Session-ID=abc; X=1")
        );

        session.touch(now + Duration::seconds(100));
        assert!(session.is_live_at(now + Duration::seconds(200)));

        session.invalidate();
        assert!(!session.is_live_at(now));
    }

    #[test]
    fn debug_hides_password() {
        let creds = Credentials::new("bot", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
