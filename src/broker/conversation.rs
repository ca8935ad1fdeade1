//! A single in-flight login attempt.
//!
//! A conversation ties together the auth pipe, the driver-specific state
//! needed to finish the login, the most recent helper response, and at
//! most one outstanding completion. Both the pipe's event stream and the
//! HTTP request path hold references; whichever finishes last tears the
//! helper down.

use crate::broker::error::AuthError;
use crate::broker::pipe::{AuthPipe, PipeEvent};
use crate::broker::spawn::SpawnState;
use crate::broker::ssh::SshState;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Which driver started the login, plus everything it needs to finish it.
pub enum DriverState {
    Spawn(SpawnState),
    Ssh(SshState),
}

type Completion = oneshot::Sender<Result<(), AuthError>>;
type PurgeHook = Box<dyn FnOnce() + Send>;

struct ConvState {
    last_response: Option<Vec<u8>>,
    completion: Option<Completion>,
    /// Set once the pipe has closed; `Some(None)` is a clean close.
    closed: Option<Option<AuthError>>,
    purge: Option<PurgeHook>,
}

pub struct Conversation {
    id: String,
    pipe: AuthPipe,
    driver: StdMutex<DriverState>,
    state: StdMutex<ConvState>,
}

impl Conversation {
    /// Wrap a pipe and driver state, and start draining pipe events.
    pub fn new(pipe: AuthPipe, driver: DriverState) -> Arc<Self> {
        let events = pipe.take_events();
        let conversation = Arc::new(Self {
            id: pipe.id().to_string(),
            pipe,
            driver: StdMutex::new(driver),
            state: StdMutex::new(ConvState {
                last_response: None,
                completion: None,
                closed: None,
                purge: None,
            }),
        });

        if let Some(mut events) = events {
            let conv = Arc::clone(&conversation);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        PipeEvent::Message(payload) => conv.on_message(payload),
                        PipeEvent::Close(error) => {
                            conv.on_close(error);
                            break;
                        }
                    }
                }
            });
        }

        conversation
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pipe(&self) -> &AuthPipe {
        &self.pipe
    }

    pub fn with_driver<R>(&self, f: impl FnOnce(&mut DriverState) -> R) -> R {
        f(&mut self.driver.lock().expect("driver lock"))
    }

    /// Register the single outstanding completion and return its receiver.
    ///
    /// If the channel already closed, the completion fires immediately
    /// with the close verdict.
    pub fn begin_completion(&self) -> oneshot::Receiver<Result<(), AuthError>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().expect("state lock");
        if state.completion.is_some() {
            warn!("conversation {} already has a pending completion", self.id);
        }
        if let Some(closed) = &state.closed {
            let verdict = match closed {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            };
            let _ = tx.send(verdict);
        } else {
            state.completion = Some(tx);
        }
        rx
    }

    /// The most recent helper response, consumed by finalize.
    pub fn take_response(&self) -> Option<Vec<u8>> {
        self.state.lock().expect("state lock").last_response.take()
    }

    /// Run when the pipe closes while the conversation sits in the pending
    /// table; the broker uses it to purge the stale entry. Fires at once
    /// if the channel already closed.
    pub fn set_purge(&self, purge: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().expect("state lock");
        if state.closed.is_some() {
            drop(state);
            purge();
        } else {
            state.purge = Some(Box::new(purge));
        }
    }

    pub fn clear_purge(&self) {
        self.state.lock().expect("state lock").purge = None;
    }

    /// Send the client's answer into the helper.
    ///
    /// # Errors
    /// Returns `InternalFailure` if the channel is closed.
    pub async fn answer(&self, payload: &[u8]) -> Result<(), AuthError> {
        self.pipe.answer(payload).await
    }

    #[cfg(test)]
    pub(crate) fn completion_outstanding(&self) -> bool {
        self.state.lock().expect("state lock").completion.is_some()
    }

    pub fn complete(&self, verdict: Result<(), AuthError>) {
        let completion = self.state.lock().expect("state lock").completion.take();
        match (completion, verdict) {
            (Some(completion), verdict) => {
                let _ = completion.send(verdict);
            }
            (None, Err(error)) => {
                debug!(
                    "Dropped authentication error: {error} no pending request to respond to"
                );
            }
            (None, Ok(())) => {
                debug!("Dropped authentication result, no pending request to respond to");
            }
        }
    }

    fn on_message(&self, payload: Vec<u8>) {
        {
            let mut state = self.state.lock().expect("state lock");
            if state.last_response.is_some() {
                warn!("conversation {}: unexpected extra helper message", self.id);
                return;
            }
            state.last_response = Some(payload);
        }
        self.complete(Ok(()));
    }

    fn on_close(&self, error: Option<AuthError>) {
        let (purge, had_completion) = {
            let mut state = self.state.lock().expect("state lock");
            state.closed = Some(error.clone());
            (state.purge.take(), state.completion.is_some())
        };
        let is_spawn = self.with_driver(|driver| matches!(driver, DriverState::Spawn(_)));

        // A close error fails whatever is waiting. A clean close means the
        // spawned helper finished without a verdict and finalize decides;
        // for an SSH conversation the transport result is authoritative.
        match error {
            Some(error) => self.complete(Err(error)),
            None if is_spawn && had_completion => self.complete(Ok(())),
            None => {}
        }

        if let Some(purge) = purge {
            purge();
        }
    }
}
