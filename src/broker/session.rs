//! Authenticated sessions and the web-service handle they wrap.
//!
//! A session pairs credentials with a live service and a per-session idle
//! timer. The service is opaque to the rest of the broker: it reports
//! whether it is idle and emits `Idling`/`Destroy` events; the broker
//! reaps accordingly.

use crate::broker::creds::Credentials;
use crate::broker::ssh::SshTransportHandle;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

/// The post-login channel to the machine: the helper's stdin/stdout, or
/// the SSH transport that authenticated.
pub enum Bridge {
    Pipe(tokio::process::Child),
    Ssh(SshTransportHandle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    Idling,
    Destroy,
}

struct ServiceInner {
    creds: StdMutex<Credentials>,
    bridge: StdMutex<Option<Bridge>>,
    idle: AtomicBool,
    disposed: AtomicBool,
    events: broadcast::Sender<ServiceEvent>,
}

/// Handle to the live service behind a session.
#[derive(Clone)]
pub struct WebService {
    inner: Arc<ServiceInner>,
}

impl WebService {
    pub(crate) fn new(creds: Credentials, bridge: Option<Bridge>) -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            inner: Arc::new(ServiceInner {
                creds: StdMutex::new(creds),
                bridge: StdMutex::new(bridge),
                // A fresh service has no connections yet.
                idle: AtomicBool::new(true),
                disposed: AtomicBool::new(false),
                events,
            }),
        }
    }

    #[must_use]
    pub fn user(&self) -> String {
        self.inner.creds.lock().expect("creds lock").user().to_string()
    }

    #[must_use]
    pub fn csrf_token(&self) -> String {
        self.inner
            .creds
            .lock()
            .expect("creds lock")
            .csrf_token()
            .to_string()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.idle.load(Ordering::Relaxed)
    }

    /// Track connection activity. A transition into the idle state emits
    /// `Idling`.
    pub fn set_idle(&self, idle: bool) {
        let was_idle = self.inner.idle.swap(idle, Ordering::Relaxed);
        if idle && !was_idle {
            let _ = self.inner.events.send(ServiceEvent::Idling);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn with_creds<R>(&self, f: impl FnOnce(&mut Credentials) -> R) -> R {
        f(&mut self.inner.creds.lock().expect("creds lock"))
    }

    /// Ask the broker to tear the session down; used by the surrounding
    /// process when a service goes away on its own.
    pub fn destroy(&self) {
        let _ = self.inner.events.send(ServiceEvent::Destroy);
    }

    /// Release the bridge. A still-running helper gets a `SIGTERM`; an SSH
    /// transport is closed.
    pub(crate) fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let bridge = self.inner.bridge.lock().expect("bridge lock").take();
        match bridge {
            Some(Bridge::Pipe(mut child)) => {
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = child.wait().await;
                    });
                }
            }
            Some(Bridge::Ssh(transport)) => transport.close("disconnected"),
            None => {}
        }
    }
}

/// One entry of the session table.
pub(crate) struct Session {
    cookie: String,
    service: WebService,
    idle_timer: StdMutex<Option<JoinHandle<()>>>,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(cookie: String, service: WebService) -> Self {
        Self {
            cookie,
            service,
            idle_timer: StdMutex::new(None),
            watcher: StdMutex::new(None),
        }
    }

    pub(crate) fn cookie(&self) -> &str {
        &self.cookie
    }

    pub(crate) fn service(&self) -> &WebService {
        &self.service
    }

    pub(crate) fn set_watcher(&self, watcher: JoinHandle<()>) {
        *self.watcher.lock().expect("watcher lock") = Some(watcher);
    }

    pub(crate) fn replace_idle_timer(&self, timer: JoinHandle<()>) {
        if let Some(old) = self.idle_timer.lock().expect("timer lock").replace(timer) {
            old.abort();
        }
    }

    /// Poison the credentials and release the service. Safe to run twice.
    pub(crate) fn teardown(&self) {
        if let Some(timer) = self.idle_timer.lock().expect("timer lock").take() {
            timer.abort();
        }
        if let Some(watcher) = self.watcher.lock().expect("watcher lock").take() {
            watcher.abort();
        }
        debug!("session for {} closing", self.service.user());
        self.service.with_creds(Credentials::poison);
        self.service.dispose();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> WebService {
        let creds = Credentials::new("alice", "cockpit", "csrf")
            .with_password(Some(secrecy::SecretString::new("secret".to_string())))
            .with_login_data(Some(serde_json::json!({ "user": "alice" })));
        WebService::new(creds, None)
    }

    #[tokio::test]
    async fn new_service_starts_idle() {
        assert!(service().is_idle());
    }

    #[tokio::test]
    async fn idle_transition_emits_event() {
        let service = service();
        let mut events = service.subscribe();
        service.set_idle(false);
        service.set_idle(true);
        assert_eq!(events.recv().await.expect("event"), ServiceEvent::Idling);
    }

    #[tokio::test]
    async fn repeated_idle_does_not_reemit() {
        let service = service();
        let mut events = service.subscribe();
        service.set_idle(true);
        service.set_idle(true);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn teardown_poisons_credentials() {
        let service = service();
        let session = Session::new("v=2;k=abc".to_string(), service.clone());
        session.teardown();
        assert!(service.with_creds(|creds| creds.poisoned()));
    }
}
