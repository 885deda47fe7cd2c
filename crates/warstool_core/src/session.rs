use std::env;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::cookie::Jar;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::WarsConfig;

pub const DEFAULT_BASE_URL: &str = "https://shogiwars.heroz.jp";
pub const SESSION_COOKIE_NAME: &str = "_web_session";

const MYPAGE_PATH: &str = "/users/mypage";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no session cookie provided (set SHOGIWARS_SESSION_COOKIE or pass --session-cookie)")]
    MissingCredentials,
    #[error("invalid site URL {0}")]
    InvalidBaseUrl(String),
    #[error("session was rejected by the server (landed on {0})")]
    Rejected(String),
    #[error("could not resolve the account id from {0}")]
    UnresolvedAccount(String),
    #[error("failed to reach the server while establishing a session: {0}")]
    Transport(String),
}

/// What the session collaborator needs. Interactive login is done
/// elsewhere; only the resulting session cookie is consumed here.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub session_cookie: String,
    pub account: Option<String>,
}

impl Credentials {
    pub fn new(session_cookie: impl Into<String>, account: Option<String>) -> Self {
        Self {
            session_cookie: session_cookie.into(),
            account: account
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    /// Reads SHOGIWARS_SESSION_COOKIE and SHOGIWARS_ACCOUNT, letting explicit
    /// values win.
    pub fn resolve(
        cookie_override: Option<String>,
        account_override: Option<String>,
    ) -> Result<Self, AuthError> {
        let cookie = cookie_override
            .or_else(|| env::var("SHOGIWARS_SESSION_COOKIE").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        let account = account_override.or_else(|| env::var("SHOGIWARS_ACCOUNT").ok());
        Ok(Self::new(cookie, account))
    }

    /// `name=value` form; a bare value is assumed to be the web session cookie.
    pub fn cookie_pair(&self) -> String {
        let value = self.session_cookie.trim();
        if value.contains('=') {
            value.to_string()
        } else {
            format!("{SESSION_COOKIE_NAME}={value}")
        }
    }
}

/// An authenticated capability, passed explicitly to every page fetch.
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    base_url: Url,
}

impl Session {
    pub fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

pub trait SessionProvider {
    /// Returns the session and the account id it belongs to.
    fn establish_session(&self, credentials: &Credentials) -> Result<(Session, String), AuthError>;
}

#[derive(Debug, Clone)]
pub struct CookieSessionProvider {
    base_url: String,
    user_agent: String,
    timeout: Duration,
}

impl CookieSessionProvider {
    pub fn new(base_url: impl Into<String>, user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            user_agent: user_agent.into(),
            timeout,
        }
    }

    pub fn from_config(config: &WarsConfig) -> Self {
        Self::new(
            config.base_url(),
            config.user_agent(),
            Duration::from_millis(config.timeout_ms()),
        )
    }

    fn build_session(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let base_url = Url::parse(&self.base_url)
            .map_err(|_| AuthError::InvalidBaseUrl(self.base_url.clone()))?;

        let jar = Jar::default();
        jar.add_cookie_str(&format!("{}; Path=/", credentials.cookie_pair()), &base_url);

        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .cookie_provider(Arc::new(jar))
            .build()
            .map_err(|error| AuthError::Transport(error.to_string()))?;
        Ok(Session::new(client, base_url))
    }

    fn resolve_account(&self, session: &Session) -> Result<String, AuthError> {
        let url = session
            .base_url()
            .join(MYPAGE_PATH)
            .map_err(|_| AuthError::InvalidBaseUrl(self.base_url.clone()))?;
        let response = session
            .client()
            .get(url)
            .query(&[("locale", "ja")])
            .send()
            .map_err(|error| AuthError::Transport(error.to_string()))?;

        let status = response.status();
        let landed = response.url().clone();
        debug!(status = %status, url = %landed, "my page response");
        if is_login_url(&landed) || status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AuthError::Rejected(landed.to_string()));
        }
        if !status.is_success() {
            return Err(AuthError::Transport(format!("my page returned HTTP {status}")));
        }
        account_from_mypage_url(&landed).ok_or_else(|| AuthError::UnresolvedAccount(landed.to_string()))
    }
}

impl SessionProvider for CookieSessionProvider {
    fn establish_session(&self, credentials: &Credentials) -> Result<(Session, String), AuthError> {
        let session = self.build_session(credentials)?;
        let account = match &credentials.account {
            Some(account) => account.clone(),
            None => self.resolve_account(&session)?,
        };
        info!(account = %account, "session established");
        Ok((session, account))
    }
}

/// `/users/mypage/<id>` is where the site lands a signed-in user.
pub fn account_from_mypage_url(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "users" && segments.next() == Some("mypage") {
            return segments
                .next()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string);
        }
    }
    None
}

pub fn is_login_url(url: &Url) -> bool {
    url.path().contains("login")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Url;

    use super::{
        AuthError, CookieSessionProvider, Credentials, SessionProvider, account_from_mypage_url,
        is_login_url,
    };

    fn url(value: &str) -> Url {
        Url::parse(value).expect("fixture url")
    }

    #[test]
    fn account_is_read_from_mypage_redirect() {
        assert_eq!(
            account_from_mypage_url(&url(
                "https://shogiwars.heroz.jp/users/mypage/ohakado?locale=ja&signup=false"
            )),
            Some("ohakado".to_string())
        );
        assert_eq!(
            account_from_mypage_url(&url("https://shogiwars.heroz.jp/users/mypage")),
            None
        );
        assert_eq!(
            account_from_mypage_url(&url("https://shogiwars.heroz.jp/games/history")),
            None
        );
    }

    #[test]
    fn login_pages_are_detected() {
        assert!(is_login_url(&url("https://shogiwars.heroz.jp/loginm?locale=ja")));
        assert!(!is_login_url(&url("https://shogiwars.heroz.jp/games/history")));
    }

    #[test]
    fn bare_cookie_values_get_the_session_cookie_name() {
        let bare = Credentials::new("abc123", None);
        assert_eq!(bare.cookie_pair(), "_web_session=abc123");
        let full = Credentials::new(" other=xyz ", Some("  ".to_string()));
        assert_eq!(full.cookie_pair(), "other=xyz");
        assert!(full.account.is_none());
    }

    #[test]
    fn explicit_cookie_override_wins() {
        let credentials = Credentials::resolve(Some("abc".to_string()), Some("ohakado".to_string()))
            .expect("credentials");
        assert_eq!(credentials.session_cookie, "abc");
        assert_eq!(credentials.account.as_deref(), Some("ohakado"));
    }

    #[test]
    fn explicit_account_skips_network_resolution() {
        let provider = CookieSessionProvider::new(
            "http://127.0.0.1:9",
            "warstool-test",
            Duration::from_millis(50),
        );
        let credentials = Credentials::new("abc", Some("ohakado".to_string()));
        let (session, account) = provider
            .establish_session(&credentials)
            .expect("session without network");
        assert_eq!(account, "ohakado");
        assert_eq!(session.base_url().as_str(), "http://127.0.0.1:9/");
    }

    #[test]
    fn invalid_base_url_is_an_auth_error() {
        let provider = CookieSessionProvider::new("not a url", "ua", Duration::from_millis(50));
        let error = provider
            .establish_session(&Credentials::new("abc", Some("me".to_string())))
            .expect_err("must fail");
        assert!(matches!(error, AuthError::InvalidBaseUrl(_)));
    }
}
