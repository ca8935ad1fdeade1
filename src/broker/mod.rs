//! The authentication broker.
//!
//! Sits between unauthenticated HTTP requests and long-lived sessions: it
//! picks a login driver for each request, drives the helper conversation
//! to a verdict, and on success mints a session cookie. Everything hangs
//! off one [`Broker`], which owns the secret key, the session and pending
//! tables, the admission throttle, and the idle timers.

pub mod conversation;
pub mod creds;
pub mod error;
pub mod headers;
pub mod nonce;
pub mod pipe;
pub mod session;
pub mod spawn;
pub mod ssh;
pub mod throttle;

use crate::config::{self, Config};
use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, SET_COOKIE},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use conversation::{Conversation, DriverState};
use nonce::NonceFactory;
use session::Session;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use throttle::MaxStartups;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use creds::Credentials;
pub use error::AuthError;
pub use session::{Bridge, ServiceEvent, WebService};
pub use ssh::{SshConnector, SshRequest, SshTransportHandle};

const COOKIE_PREFIX: &str = "v=2;k=";
const SCHEME_LOGIN_REPLY: &str = "x-login-reply";
const FALLBACK_SCHEME: &str = "negotiate";

/// What a finished login hands back to the HTTP layer. Challenge and
/// cookie headers are already set on the response header map.
#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated {
        user: String,
        body: serde_json::Value,
    },
    /// The helper wants another round; the body carries whatever fields
    /// accompanied the prompt.
    Challenge { body: serde_json::Value },
}

pub(crate) enum Finalize {
    Credentials {
        creds: Credentials,
        bridge: Option<Bridge>,
    },
    Prompt(serde_json::Value),
}

pub struct BrokerBuilder {
    config: Config,
    cookie_insecure: bool,
    login_loopback: bool,
    ssh_connector: Option<SshConnector>,
}

impl BrokerBuilder {
    /// Drop the `Secure` cookie attribute, for plain-HTTP deployments.
    #[must_use]
    pub fn cookie_insecure(mut self, insecure: bool) -> Self {
        self.cookie_insecure = insecure;
        self
    }

    /// Route Basic logins through the SSH driver even for localhost.
    #[must_use]
    pub fn login_loopback(mut self, loopback: bool) -> Self {
        self.login_loopback = loopback;
        self
    }

    #[must_use]
    pub fn ssh_connector(mut self, connector: SshConnector) -> Self {
        self.ssh_connector = Some(connector);
        self
    }

    /// # Errors
    /// Returns an error if the OS RNG cannot seed the secret key; callers
    /// treat this as fatal at startup.
    pub fn build(self) -> anyhow::Result<Broker> {
        let throttle = self
            .config
            .web_service
            .max_startups
            .as_deref()
            .map(MaxStartups::parse)
            .unwrap_or_default();

        let service_idle = Duration::from_secs(self.config.web_service.service_idle);
        let process_idle = Duration::from_secs(self.config.web_service.process_idle);
        let login_loopback = self.login_loopback || self.config.web_service.login_loopback;

        let (idling, _) = broadcast::channel(4);

        let inner = Arc::new(BrokerInner {
            nonces: NonceFactory::new()?,
            config: self.config,
            gssapi_unavailable: AtomicBool::new(false),
            ssh_connector: self.ssh_connector,
            throttle,
            startups: AtomicU32::new(0),
            login_loopback,
            cookie_insecure: self.cookie_insecure,
            service_idle,
            process_idle,
            sessions: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            process_timer: StdMutex::new(None),
            idling,
        });

        inner.reset_process_timer();

        Ok(Broker { inner })
    }
}

pub(crate) struct BrokerInner {
    pub(crate) nonces: NonceFactory,
    pub(crate) config: Config,
    pub(crate) gssapi_unavailable: AtomicBool,
    pub(crate) ssh_connector: Option<SshConnector>,
    throttle: MaxStartups,
    startups: AtomicU32,
    login_loopback: bool,
    cookie_insecure: bool,
    service_idle: Duration,
    process_idle: Duration,
    sessions: StdMutex<HashMap<String, Arc<Session>>>,
    pending: StdMutex<HashMap<String, Arc<Conversation>>>,
    process_timer: StdMutex<Option<JoinHandle<()>>>,
    idling: broadcast::Sender<()>,
}

pub struct Broker {
    inner: Arc<BrokerInner>,
}

/// Keeps the in-flight count honest no matter how a login leaves.
struct StartupGuard(Arc<BrokerInner>);

impl Drop for StartupGuard {
    fn drop(&mut self) {
        self.0.startups.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Broker {
    #[must_use]
    pub fn builder(config: Config) -> BrokerBuilder {
        BrokerBuilder {
            config,
            cookie_insecure: false,
            login_loopback: false,
            ssh_connector: None,
        }
    }

    /// Run a login attempt to its verdict.
    ///
    /// Consumes the `Authorization` header from `in_headers`; challenge
    /// and cookie headers land on `out_headers`.
    ///
    /// # Errors
    /// Returns the taxonomy of [`AuthError`]; display strings are safe to
    /// surface to clients.
    pub async fn login(
        &self,
        path: &str,
        in_headers: &mut HeaderMap,
        remote_peer: Option<&str>,
        out_headers: &mut HeaderMap,
    ) -> Result<LoginOutcome, AuthError> {
        let inner = Arc::clone(&self.inner);
        let in_flight = inner.startups.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = StartupGuard(Arc::clone(&inner));

        if !inner.throttle.can_start(in_flight) {
            warn!("Request dropped; too many startup connections: {in_flight}");
            return Err(AuthError::internal("Connection closed by host"));
        }

        let application = headers::parse_application(path);
        if !headers::valid_application(&application) {
            return Err(AuthError::invalid("Invalid application name"));
        }

        let scheme = headers::parse_authorization_scheme(in_headers)
            .unwrap_or_else(|| FALLBACK_SCHEME.to_string());

        let action = if scheme == SCHEME_LOGIN_REPLY {
            SCHEME_LOGIN_REPLY
        } else if inner.login_loopback && scheme == "basic" {
            config::ACTION_SSH
        } else if let Some(action) = inner.config.action(&scheme) {
            action
        } else if scheme == "basic" || scheme == "negotiate" {
            config::ACTION_SPAWN_DECODE
        } else {
            config::ACTION_NONE
        };

        let finalize = match action {
            config::ACTION_SPAWN_HEADER => {
                let (conversation, completion) =
                    spawn::begin(&inner, &application, &scheme, false, in_headers, remote_peer)
                        .await?;
                finish(&inner, &conversation, completion, out_headers).await
            }
            config::ACTION_SPAWN_DECODE => {
                let (conversation, completion) =
                    spawn::begin(&inner, &application, &scheme, true, in_headers, remote_peer)
                        .await?;
                finish(&inner, &conversation, completion, out_headers).await
            }
            config::ACTION_SSH => {
                let (conversation, completion) =
                    ssh::begin(&inner, &application, &scheme, in_headers, remote_peer).await?;
                finish(&inner, &conversation, completion, out_headers).await
            }
            SCHEME_LOGIN_REPLY => resume(&inner, in_headers, out_headers).await,
            config::ACTION_NONE => Err(AuthError::failed("Authentication disabled")),
            other => {
                // Intentional fall-through for misconfigured schemes.
                warn!("got unknown login action: {other}");
                Err(AuthError::failed("Authentication disabled"))
            }
        }?;

        match finalize {
            Finalize::Credentials { creds, bridge } => {
                Ok(install_session(&inner, creds, bridge, &application, out_headers))
            }
            Finalize::Prompt(body) => Ok(LoginOutcome::Challenge { body }),
        }
    }

    /// Resolve a request's session cookie into its live service.
    #[must_use]
    pub fn check_cookie(&self, path: &str, headers: &HeaderMap) -> Option<WebService> {
        let application = headers::parse_application(path);
        if !headers::valid_application(&application) {
            return None;
        }

        let raw = headers::cookie_value(headers, &application)?;
        let cookie = STANDARD
            .decode(raw.as_bytes())
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())?;

        if !cookie.starts_with(COOKIE_PREFIX) {
            debug!("invalid or unsupported cookie");
            return None;
        }

        let session = self.inner.sessions.lock().expect("poisoned lock").get(&cookie).cloned();
        match session {
            Some(session) => {
                debug!(
                    "received credential cookie for user '{}'",
                    session.service().user()
                );
                Some(session.service().clone())
            }
            None => {
                debug!("received unknown/invalid credential cookie");
                None
            }
        }
    }

    /// Fires when both the session and pending tables have been empty for
    /// the process-idle window; the surrounding process exits on it.
    #[must_use]
    pub fn subscribe_idling(&self) -> broadcast::Receiver<()> {
        self.inner.idling.subscribe()
    }

    #[must_use]
    pub fn in_flight_logins(&self) -> u32 {
        self.inner.startups.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().expect("poisoned lock").len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("poisoned lock").len()
    }
}

async fn finish(
    inner: &Arc<BrokerInner>,
    conversation: &Arc<Conversation>,
    completion: oneshot::Receiver<Result<(), AuthError>>,
    out_headers: &mut HeaderMap,
) -> Result<Finalize, AuthError> {
    let verdict = completion
        .await
        .map_err(|_| AuthError::internal("login interrupted"))?;

    let result = match verdict {
        Ok(()) => {
            let is_spawn =
                conversation.with_driver(|driver| matches!(driver, DriverState::Spawn(_)));
            if is_spawn {
                spawn::finalize(inner, conversation, out_headers)
            } else {
                ssh::finalize(inner, conversation, out_headers)
            }
        }
        Err(error) => Err(error),
    };

    if result.is_err() {
        conversation.with_driver(|driver| {
            if let DriverState::Spawn(state) = driver {
                state.abort();
            }
        });
    }

    result
}

async fn resume(
    inner: &Arc<BrokerInner>,
    in_headers: &HeaderMap,
    out_headers: &mut HeaderMap,
) -> Result<Finalize, AuthError> {
    let header = in_headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AuthError::failed("Invalid resume token"))?;

    let mut parts = header.splitn(3, ' ');
    let (Some(_scheme), Some(id), Some(answer)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::failed("Invalid resume token"));
    };

    let conversation = inner
        .pending
        .lock()
        .expect("poisoned lock")
        .remove(id)
        .ok_or_else(|| AuthError::failed("Invalid resume token"))?;
    conversation.clear_purge();

    let decoded = STANDARD
        .decode(answer.as_bytes())
        .ok()
        .map(Zeroizing::new)
        .filter(|decoded| !decoded.is_empty())
        .ok_or_else(|| AuthError::failed("Invalid resume token"))?;

    let completion = conversation.begin_completion();
    conversation.answer(&decoded).await?;
    finish(inner, &conversation, completion, out_headers).await
}

fn install_session(
    inner: &Arc<BrokerInner>,
    creds: Credentials,
    bridge: Option<Bridge>,
    application: &str,
    out_headers: &mut HeaderMap,
) -> LoginOutcome {
    let id = inner.nonces.mint();
    let cookie = format!("{COOKIE_PREFIX}{id}");
    let body = creds.to_json();
    let user = creds.user().to_string();

    let service = WebService::new(creds, bridge);
    let session = Arc::new(Session::new(cookie.clone(), service.clone()));

    let mut events = service.subscribe();
    let weak = Arc::downgrade(inner);
    let watched = cookie.clone();
    session.set_watcher(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::Idling) => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.on_session_idling(&watched);
                }
                Ok(ServiceEvent::Destroy) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.remove_session(&watched);
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }));

    inner
        .sessions
        .lock()
        .expect("poisoned lock")
        .insert(cookie.clone(), session);

    let encoded = STANDARD.encode(&cookie);
    let secure = if inner.cookie_insecure { "" } else { " Secure;" };
    let header = format!("{application}={encoded}; Path=/;{secure} HttpOnly");
    if let Ok(value) = HeaderValue::from_str(&header) {
        out_headers.insert(SET_COOKIE, value);
    }

    // Fresh sessions start idle; the caller has the idle window to attach.
    inner.on_session_idling(&cookie);

    info!("logged in user: {user}");
    LoginOutcome::Authenticated { user, body }
}

impl BrokerInner {
    /// Park a conversation in the pending table and challenge the client
    /// to resume it.
    pub(crate) fn prepare_login_reply(
        self: &Arc<Self>,
        prompt_data: &mut serde_json::Value,
        headers: &mut HeaderMap,
        conversation: &Arc<Conversation>,
    ) -> Result<(), AuthError> {
        let Some(prompt) = prompt_data.get("prompt").and_then(serde_json::Value::as_str) else {
            return Err(AuthError::invalid("Authentication failed: missing prompt"));
        };

        headers::build_prompt_challenge(headers, conversation.id(), prompt);

        let id = conversation.id().to_string();
        self.pending
            .lock()
            .expect("poisoned lock")
            .insert(id.clone(), Arc::clone(conversation));

        let weak = Arc::downgrade(self);
        conversation.set_purge(move || {
            if let Some(inner) = weak.upgrade() {
                inner.pending.lock().expect("poisoned lock").remove(&id);
            }
        });

        if let Some(object) = prompt_data.as_object_mut() {
            object.remove("prompt");
        }
        Ok(())
    }

    fn on_session_idling(self: &Arc<Self>, cookie: &str) {
        let session = self
            .sessions
            .lock()
            .expect("poisoned lock")
            .get(cookie)
            .cloned();
        let Some(session) = session else { return };

        debug!("{}: login is idle", session.service().user());

        // The minimum amount of time before a request claims this service,
        // otherwise it goes away.
        let weak = Arc::downgrade(self);
        let watched = cookie.to_string();
        let idle = self.service_idle;
        session.replace_idle_timer(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(inner) = weak.upgrade() else { return };
            let session = inner
                .sessions
                .lock()
                .expect("poisoned lock")
                .get(&watched)
                .cloned();
            if let Some(session) = session {
                if session.service().is_idle() {
                    info!("{}: timed out", session.service().user());
                    inner.remove_session(&watched);
                }
            }
        }));

        // Also restart the timer that watches the whole process.
        self.reset_process_timer();
    }

    fn remove_session(&self, cookie: &str) {
        let session = self.sessions.lock().expect("poisoned lock").remove(cookie);
        if let Some(session) = session {
            session.teardown();
        }
    }

    fn reset_process_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.process_idle;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            let sessions_empty = inner.sessions.lock().expect("poisoned lock").is_empty();
            let pending_empty = inner.pending.lock().expect("poisoned lock").is_empty();
            if sessions_empty && pending_empty {
                debug!("web service is idle");
                let _ = inner.idling.send(());
            }
        });
        if let Some(old) = self
            .process_timer
            .lock()
            .expect("poisoned lock")
            .replace(timer)
        {
            old.abort();
        }
    }
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        if let Some(timer) = self.process_timer.lock().expect("poisoned lock").take() {
            timer.abort();
        }
    }
}
