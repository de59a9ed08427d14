//! Authenticated session against the case-research platform.
//!
//! [`SessionManager`] owns the only [`SessionContext`] of a run. Every platform
//! request goes through the context's HTTP client, so cookies set by the login
//! form (and any later `Set-Cookie`) ride along on all subsequent requests.
//!
//! Session death is detected from responses, not timers: a final URL on the
//! login path or an HTML body carrying the login marker means the platform
//! wants credentials again.

mod error;
mod state;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, RETRY_AFTER};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use error::{AuthError, NavigationError, RetrievalError};

use crate::config::{Credentials, PlatformConfig};
use crate::retry::{FailureType, RetryDecision, RetryPolicy, parse_retry_after};
use crate::storage::DocumentStore;
use crate::user_agent;
use state::PersistedSession;

/// A response body together with where it actually came from.
#[derive(Debug, Clone)]
pub struct Page {
    /// URL after redirects.
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Page {
    /// Body decoded as UTF-8, invalid sequences replaced.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// True for `text/html` responses and for responses with no content type.
    #[must_use]
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_none_or(|ct| ct.to_ascii_lowercase().contains("text/html"))
    }
}

/// A page fetched by [`SessionManager::get_with_retry`].
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub page: Page,
    /// Attempts it took, including the successful one.
    pub attempts: u32,
}

/// One authenticated session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    authenticated: bool,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    jar: Arc<Jar>,
    client: Client,
    generation: u32,
}

impl SessionContext {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Best-effort expiry; the platform may end the session earlier.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Increases by one every time a session is established.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// True when the jar holds cookies that would be sent to `url`.
    #[must_use]
    pub fn carries_cookies_for(&self, url: &Url) -> bool {
        self.jar.cookies(url).is_some()
    }

    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.authenticated && self.expires_at.is_none_or(|expiry| now < expiry)
    }
}

/// Outcome of one attempt inside [`SessionManager::get_with_retry`].
enum AttemptFailure {
    Navigation(NavigationError),
    Unusable(String),
}

/// Establishes, checks and re-establishes the platform session.
#[derive(Debug)]
pub struct SessionManager {
    platform: PlatformConfig,
    credentials: Credentials,
    policy: RetryPolicy,
    origin: Url,
    login_url: Url,
    landing_url: Url,
    state_store: Option<(DocumentStore, String)>,
    context: Option<SessionContext>,
    generation: u32,
    reacquires: u32,
    request_delay: Duration,
    last_request: Option<Instant>,
}

impl SessionManager {
    /// Creates a manager; no request is made until [`acquire`](Self::acquire).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidUrl`] when the platform URLs do not parse.
    pub fn new(
        platform: &PlatformConfig,
        credentials: Credentials,
        policy: RetryPolicy,
    ) -> Result<Self, AuthError> {
        let origin = platform
            .base()
            .map_err(|e| AuthError::InvalidUrl(e.to_string()))?;
        let login_url = platform
            .join(&platform.login_path)
            .map_err(|e| AuthError::InvalidUrl(e.to_string()))?;
        let landing_url = platform
            .join(&platform.landing_path)
            .map_err(|e| AuthError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            platform: platform.clone(),
            credentials,
            policy,
            origin,
            login_url,
            landing_url,
            state_store: None,
            context: None,
            generation: 0,
            reacquires: 0,
            request_delay: Duration::from_millis(platform.request_delay_ms),
            last_request: None,
        })
    }

    /// Persists cookie material under `key` in `store` and restores it on the
    /// next [`acquire`](Self::acquire).
    #[must_use]
    pub fn with_state_store(mut self, store: DocumentStore, key: impl Into<String>) -> Self {
        self.state_store = Some((store, key.into()));
        self
    }

    /// Current context, if one has been established.
    #[must_use]
    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    /// How many times [`reacquire`](Self::reacquire) ran.
    #[must_use]
    pub fn reacquire_count(&self) -> u32 {
        self.reacquires
    }

    /// Platform origin all relative links resolve against.
    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Returns a usable session, establishing one if needed.
    ///
    /// Reuses the current context while it is authenticated and not past its
    /// best-effort expiry. Otherwise restores persisted cookies and probes the
    /// landing page, then falls back to the login form with bounded retries.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when no session can be established.
    #[instrument(skip(self))]
    pub async fn acquire(&mut self) -> Result<&SessionContext, AuthError> {
        let context = match self.context.take() {
            Some(context) if context.is_usable(Utc::now()) => context,
            _ => self.establish(true).await?,
        };
        Ok(&*self.context.insert(context))
    }

    /// Discards the current context and logs in from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the new login fails.
    #[instrument(skip(self), fields(reacquires = self.reacquires + 1))]
    pub async fn reacquire(&mut self) -> Result<&SessionContext, AuthError> {
        self.reacquires += 1;
        self.context = None;
        info!("re-establishing platform session");
        let context = self.establish(false).await?;
        Ok(&*self.context.insert(context))
    }

    /// False when `page` shows the session is gone: the request ended on the
    /// login path, or an HTML body carries the login marker.
    #[must_use]
    pub fn is_valid(&self, page: &Page) -> bool {
        let login_path = self.login_url.path().trim_end_matches('/');
        let on_login = !login_path.is_empty()
            && page.url.path().trim_end_matches('/') == login_path;
        if on_login {
            return false;
        }
        !(page.is_html() && page.text().contains(&self.platform.login_marker))
    }

    /// Single GET through the session client. No retries, no validity check.
    ///
    /// # Errors
    ///
    /// Returns [`NavigationError`] for transport failures, non-2xx statuses, or
    /// when no session has been acquired.
    pub async fn get(&mut self, url: &Url) -> Result<Page, NavigationError> {
        let Some(client) = self.context.as_ref().map(|c| c.client.clone()) else {
            return Err(NavigationError::NoSession {
                url: url.to_string(),
            });
        };
        self.throttle().await;
        debug!(url = %url, "GET");
        send(client.get(url.clone()), url).await
    }

    /// GET with the session's retry policy and one re-login.
    ///
    /// Transient failures and pages rejected by `accept` are retried with
    /// backoff (honouring `Retry-After` on 429). A login page triggers exactly
    /// one [`reacquire`](Self::reacquire) and the same URL is requested again
    /// without consuming an attempt; a second login page is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Auth`] when re-login fails or the session dies
    /// twice, [`RetrievalError::Failed`] for permanent or exhausted request
    /// failures and [`RetrievalError::Unusable`] when `accept` never passes.
    #[instrument(skip(self, url, accept), fields(url = %url))]
    pub async fn get_with_retry<F>(
        &mut self,
        url: &Url,
        accept: F,
    ) -> Result<Retrieved, RetrievalError>
    where
        F: Fn(&Page) -> Result<(), String>,
    {
        let mut attempt = 1;
        let mut relogged = false;

        loop {
            let failure = match self.get(url).await {
                Ok(page) if !self.is_valid(&page) => {
                    if relogged {
                        return Err(AuthError::Expired {
                            url: url.to_string(),
                        }
                        .into());
                    }
                    warn!(url = %url, "platform returned its login page");
                    self.reacquire().await?;
                    relogged = true;
                    continue;
                }
                Ok(page) => match accept(&page) {
                    Ok(()) => {
                        return Ok(Retrieved {
                            page,
                            attempts: attempt,
                        });
                    }
                    Err(reason) => AttemptFailure::Unusable(reason),
                },
                Err(e) => AttemptFailure::Navigation(e),
            };

            let (failure_type, retry_after) = match &failure {
                AttemptFailure::Navigation(e) => (e.failure_type(), e.retry_after()),
                AttemptFailure::Unusable(_) => (FailureType::Transient, None),
            };

            match self.policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let wait = retry_after.unwrap_or(delay);
                    match &failure {
                        AttemptFailure::Navigation(e) => {
                            warn!(attempt, error = %e, ?wait, "request failed, retrying");
                        }
                        AttemptFailure::Unusable(reason) => {
                            warn!(attempt, reason = %reason, ?wait, "unusable response, retrying");
                        }
                    }
                    tokio::time::sleep(wait).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, reason = %reason, "not retrying");
                    return Err(match failure {
                        AttemptFailure::Navigation(source) => RetrievalError::Failed {
                            url: url.to_string(),
                            attempts: attempt,
                            source,
                        },
                        AttemptFailure::Unusable(reason) => RetrievalError::Unusable {
                            url: url.to_string(),
                            attempts: attempt,
                            reason,
                        },
                    });
                }
            }
        }
    }

    async fn establish(&mut self, restore: bool) -> Result<SessionContext, AuthError> {
        let jar = Arc::new(Jar::default());
        let client = build_client(Arc::clone(&jar), &self.platform).map_err(AuthError::Client)?;

        if restore && self.restore_state(&jar).await && self.probe(&client).await {
            info!("reusing persisted platform session");
            return Ok(self.new_context(jar, client));
        }

        if !self.credentials.is_complete() {
            return Err(AuthError::MissingCredentials);
        }

        let mut attempt = 1;
        loop {
            let (failure_type, retry_after, last_error) = match self.login_once(&client).await {
                Ok(page) if self.is_valid(&page) => break,
                Ok(_) => {
                    warn!(attempt, "login rejected");
                    (FailureType::Transient, None, None)
                }
                Err(e) => {
                    warn!(attempt, error = %e, "login request failed");
                    (e.failure_type(), e.retry_after(), Some(e))
                }
            };

            match self.policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    tokio::time::sleep(retry_after.unwrap_or(delay)).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, reason = %reason, "giving up on login");
                    return Err(match last_error {
                        Some(source) => AuthError::Unreachable {
                            attempts: attempt,
                            source,
                        },
                        None => AuthError::Rejected { attempts: attempt },
                    });
                }
            }
        }

        info!(attempts = attempt, "logged in to platform");
        self.persist_state(&jar).await;
        Ok(self.new_context(jar, client))
    }

    fn new_context(&mut self, jar: Arc<Jar>, client: Client) -> SessionContext {
        self.generation += 1;
        let acquired_at = Utc::now();
        let expires_at = i64::try_from(self.platform.session_ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| acquired_at.checked_add_signed(ttl));
        SessionContext {
            authenticated: true,
            acquired_at,
            expires_at,
            jar,
            client,
            generation: self.generation,
        }
    }

    async fn login_once(&mut self, client: &Client) -> Result<Page, NavigationError> {
        // The form page sets pre-login cookies on some deployments.
        self.throttle().await;
        send(client.get(self.login_url.clone()), &self.login_url).await?;

        let form = [
            (
                self.platform.username_field.clone(),
                self.credentials.username.clone(),
            ),
            (
                self.platform.password_field.clone(),
                self.credentials.password.clone(),
            ),
        ];
        self.throttle().await;
        send(client.post(self.login_url.clone()).form(&form), &self.login_url).await
    }

    async fn probe(&mut self, client: &Client) -> bool {
        self.throttle().await;
        match send(client.get(self.landing_url.clone()), &self.landing_url).await {
            Ok(page) => {
                let valid = self.is_valid(&page);
                debug!(valid, "landing page probe");
                valid
            }
            Err(e) => {
                debug!(error = %e, "landing page probe failed");
                false
            }
        }
    }

    async fn restore_state(&self, jar: &Jar) -> bool {
        let Some((store, key)) = &self.state_store else {
            return false;
        };
        match state::load(store, key).await {
            Ok(Some(saved)) => {
                let restored = saved.restore_into(jar, &self.origin);
                debug!(cookies = restored, saved_at = %saved.saved_at, "restored session cookies");
                restored > 0
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "failed to read persisted session; logging in");
                false
            }
        }
    }

    async fn persist_state(&self, jar: &Jar) {
        let Some((store, key)) = &self.state_store else {
            return;
        };
        let Some(snapshot) = PersistedSession::capture(jar, &self.origin) else {
            debug!("no session cookies to persist");
            return;
        };
        if let Err(e) = state::save(store, key, &snapshot).await {
            warn!(error = %e, "failed to persist session cookies");
        }
    }

    async fn throttle(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.request_delay {
                tokio::time::sleep(self.request_delay - elapsed).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

fn build_client(jar: Arc<Jar>, platform: &PlatformConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .cookie_provider(jar)
        .connect_timeout(Duration::from_secs(platform.connect_timeout_secs))
        .timeout(Duration::from_secs(platform.request_timeout_secs))
        .gzip(true)
        .user_agent(user_agent::default_session_user_agent())
        .build()
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

async fn send(request: reqwest::RequestBuilder, url: &Url) -> Result<Page, NavigationError> {
    let response = request
        .send()
        .await
        .map_err(|e| NavigationError::from_reqwest(url.as_str(), e))?;

    let status = response.status();
    let final_url = response.url().clone();
    let content_type = header_value(response.headers(), &CONTENT_TYPE);

    if !status.is_success() {
        let retry_after =
            header_value(response.headers(), &RETRY_AFTER).and_then(|v| parse_retry_after(&v));
        return Err(NavigationError::http_status(
            final_url.as_str(),
            status.as_u16(),
            retry_after,
        ));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| NavigationError::from_reqwest(final_url.as_str(), e))?;

    Ok(Page {
        url: final_url,
        status: status.as_u16(),
        content_type,
        body: body.to_vec(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOGIN_HTML: &str =
        r#"<html><form><input id="userid" name="userid"><input id="password"></form></html>"#;
    const HOME_HTML: &str = "<html><h1>Alerts</h1></html>";

    fn platform(server: &MockServer) -> PlatformConfig {
        PlatformConfig {
            base_url: server.uri(),
            request_delay_ms: 0,
            ..PlatformConfig::default()
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "clerk".into(),
            password: "s3cret".into(),
        }
    }

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html")
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/signin"))
            .respond_with(html(LOGIN_HTML))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/signin"))
            .and(body_string_contains("userid=clerk"))
            .respond_with(
                ResponseTemplate::new(303)
                    .insert_header("location", "/home")
                    .insert_header("set-cookie", "SESSIONID=abc; Path=/"),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/home"))
            .respond_with(html(HOME_HTML))
            .mount(server)
            .await;
    }

    fn page(url: &str, content_type: Option<&str>, body: &str) -> Page {
        Page {
            url: Url::parse(url).unwrap(),
            status: 200,
            content_type: content_type.map(ToString::to_string),
            body: body.as_bytes().to_vec(),
        }
    }

    // ==================== Acquire Tests ====================

    #[tokio::test]
    async fn test_acquire_logs_in_and_persists_cookies() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        let store = DocumentStore::in_memory();

        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(3))
                .unwrap()
                .with_state_store(store.clone(), "state/session.json");

        let context = manager.acquire().await.unwrap();
        assert!(context.is_authenticated());
        assert_eq!(context.generation(), 1);
        assert!(context.expires_at().is_some());
        assert!(context.carries_cookies_for(&Url::parse(&server.uri()).unwrap()));

        let saved = store.get("state/session.json").await.unwrap().unwrap();
        let saved = String::from_utf8(saved).unwrap();
        assert!(saved.contains("SESSIONID=abc"), "{saved}");
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_context() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(0))
                .unwrap();

        manager.acquire().await.unwrap();
        let generation = manager.acquire().await.unwrap().generation();
        assert_eq!(generation, 1);
    }

    #[tokio::test]
    async fn test_acquire_restores_persisted_session_without_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("cookie", "SESSIONID=abc"))
            .respond_with(html(HOME_HTML))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/signin"))
            .respond_with(html(HOME_HTML))
            .expect(0)
            .mount(&server)
            .await;

        let store = DocumentStore::in_memory();
        let origin = Url::parse(&server.uri()).unwrap();
        let saved = PersistedSession {
            origin: origin.origin().ascii_serialization(),
            cookies: vec!["SESSIONID=abc".into()],
            saved_at: Utc::now(),
        };
        state::save(&store, "state/session.json", &saved).await.unwrap();

        let mut manager = SessionManager::new(
            &platform(&server),
            Credentials::default(),
            RetryPolicy::immediate(0),
        )
        .unwrap()
        .with_state_store(store, "state/session.json");

        assert!(manager.acquire().await.unwrap().is_authenticated());
    }

    #[tokio::test]
    async fn test_acquire_rejected_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/signin"))
            .respond_with(html(LOGIN_HTML))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/signin"))
            .respond_with(html(LOGIN_HTML))
            .expect(4)
            .mount(&server)
            .await;

        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(3))
                .unwrap();
        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { attempts: 4 }), "{err:?}");
    }

    #[tokio::test]
    async fn test_acquire_unreachable_after_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/signin"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(1))
                .unwrap();
        let err = manager.acquire().await.unwrap_err();
        assert!(
            matches!(err, AuthError::Unreachable { attempts: 2, .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_acquire_without_credentials_fails_fast() {
        let server = MockServer::start().await;
        let mut manager = SessionManager::new(
            &platform(&server),
            Credentials::default(),
            RetryPolicy::immediate(3),
        )
        .unwrap();
        assert!(matches!(
            manager.acquire().await.unwrap_err(),
            AuthError::MissingCredentials
        ));
    }

    // ==================== Validity Tests ====================

    #[test]
    fn test_is_valid_detects_login_marker_and_login_url() {
        let config = PlatformConfig {
            base_url: "https://courts.example.com".into(),
            ..PlatformConfig::default()
        };
        let manager =
            SessionManager::new(&config, credentials(), RetryPolicy::immediate(0)).unwrap();

        assert!(manager.is_valid(&page(
            "https://courts.example.com/alerts",
            Some("text/html"),
            HOME_HTML
        )));
        assert!(!manager.is_valid(&page(
            "https://courts.example.com/alerts",
            Some("text/html; charset=utf-8"),
            LOGIN_HTML
        )));
        assert!(!manager.is_valid(&page(
            "https://courts.example.com/signin?next=/alerts",
            Some("text/html"),
            "<html></html>"
        )));
        // Binary bodies are never scanned for the marker.
        assert!(manager.is_valid(&page(
            "https://courts.example.com/doc/1",
            Some("application/pdf"),
            r#"%PDF id="userid""#
        )));
    }

    // ==================== Retrieval Tests ====================

    #[tokio::test]
    async fn test_get_before_acquire_is_no_session() {
        let server = MockServer::start().await;
        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(0))
                .unwrap();
        let url = Url::parse(&format!("{}/alerts", server.uri())).unwrap();
        assert!(matches!(
            manager.get(&url).await.unwrap_err(),
            NavigationError::NoSession { .. }
        ));
    }

    #[tokio::test]
    async fn test_get_with_retry_reacquires_once_on_login_page() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .respond_with(html(LOGIN_HTML))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .respond_with(html(HOME_HTML))
            .mount(&server)
            .await;

        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(3))
                .unwrap();
        manager.acquire().await.unwrap();

        let url = Url::parse(&format!("{}/alerts", server.uri())).unwrap();
        let retrieved = manager.get_with_retry(&url, |_| Ok(())).await.unwrap();
        assert_eq!(retrieved.attempts, 1);
        assert!(retrieved.page.text().contains("Alerts"));
        assert_eq!(manager.reacquire_count(), 1);
        assert_eq!(manager.context().unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_get_with_retry_fails_when_session_dies_twice() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .respond_with(html(LOGIN_HTML))
            .mount(&server)
            .await;

        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(3))
                .unwrap();
        manager.acquire().await.unwrap();

        let url = Url::parse(&format!("{}/alerts", server.uri())).unwrap();
        let err = manager.get_with_retry(&url, |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Auth(AuthError::Expired { .. })));
        assert_eq!(manager.reacquire_count(), 1);
    }

    #[tokio::test]
    async fn test_get_with_retry_retries_transient_then_succeeds() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .respond_with(html(HOME_HTML))
            .mount(&server)
            .await;

        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(3))
                .unwrap();
        manager.acquire().await.unwrap();

        let url = Url::parse(&format!("{}/alerts", server.uri())).unwrap();
        let retrieved = manager.get_with_retry(&url, |_| Ok(())).await.unwrap();
        assert_eq!(retrieved.attempts, 3);
        assert_eq!(manager.reacquire_count(), 0);
    }

    #[tokio::test]
    async fn test_get_with_retry_permanent_status_is_not_retried() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(3))
                .unwrap();
        manager.acquire().await.unwrap();

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let err = manager.get_with_retry(&url, |_| Ok(())).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test]
    async fn test_get_with_retry_unusable_content_exhausts_budget() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(html("<html>maintenance</html>"))
            .expect(3)
            .mount(&server)
            .await;

        let mut manager =
            SessionManager::new(&platform(&server), credentials(), RetryPolicy::immediate(2))
                .unwrap();
        manager.acquire().await.unwrap();

        let url = Url::parse(&format!("{}/doc", server.uri())).unwrap();
        let err = manager
            .get_with_retry(&url, |_| Err("not a pdf".to_string()))
            .await
            .unwrap_err();
        assert!(
            matches!(err, RetrievalError::Unusable { attempts: 3, ref reason, .. } if reason == "not a pdf")
        );
    }
}
