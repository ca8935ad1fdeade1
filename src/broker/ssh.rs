//! Remote login over an SSH transport.
//!
//! Chosen for Basic authentication in loopback-SSH mode or when a scheme
//! is configured with the `remote-login-ssh` action. The transport itself
//! is a collaborator: the broker installs an [`SshConnector`] and only
//! consumes the handle's `result` event, its per-method outcomes, and the
//! auth channel it shares with the helper side.

use crate::broker::conversation::{Conversation, DriverState};
use crate::broker::creds::Credentials;
use crate::broker::error::AuthError;
use crate::broker::headers;
use crate::broker::pipe::AuthPipe;
use crate::broker::{BrokerInner, Finalize};
use axum::http::HeaderMap;
use secrecy::SecretString;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Everything a transport needs to open the connection and drive
/// interactive prompts through the auth channel.
pub struct SshRequest {
    pub host: String,
    pub port: u16,
    pub command: String,
    pub user: String,
    pub password: Option<SecretString>,
    /// The helper side of the auth channel; the transport writes prompt
    /// frames here and reads the client's answers back.
    pub auth_fd: OwnedFd,
}

type CloseFn = Box<dyn Fn(&str) + Send + Sync>;

/// Broker-facing handle to a live SSH connection attempt.
pub struct SshTransportHandle {
    result: StdMutex<Option<oneshot::Receiver<Option<String>>>>,
    methods: Arc<StdMutex<HashMap<String, String>>>,
    close: CloseFn,
}

impl SshTransportHandle {
    pub fn new(
        result: oneshot::Receiver<Option<String>>,
        methods: Arc<StdMutex<HashMap<String, String>>>,
        close: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            result: StdMutex::new(Some(result)),
            methods,
            close: Box::new(close),
        }
    }

    pub(crate) fn take_result(&self) -> Option<oneshot::Receiver<Option<String>>> {
        self.result.lock().expect("result lock").take()
    }

    /// Per-method authentication outcomes, meaningful once `result` has
    /// fired.
    #[must_use]
    pub fn auth_method_results(&self) -> HashMap<String, String> {
        self.methods.lock().expect("methods lock").clone()
    }

    /// Abort the connection with a problem code.
    pub fn close(&self, problem: &str) {
        (self.close)(problem);
    }
}

pub type SshConnector = Box<dyn Fn(SshRequest) -> SshTransportHandle + Send + Sync>;

#[derive(Default)]
pub struct SshState {
    pub(crate) creds: Option<Credentials>,
    pub(crate) transport: Option<SshTransportHandle>,
    pub(crate) has_transport_result: bool,
}

impl Drop for SshState {
    fn drop(&mut self) {
        // An abandoned attempt releases its connection; a successful login
        // moved the transport into the session first.
        if let Some(transport) = self.transport.take() {
            transport.close("disconnected");
        }
    }
}

/// Start a remote login attempt and return the conversation plus its
/// completion.
pub(crate) async fn begin(
    inner: &Arc<BrokerInner>,
    application: &str,
    scheme: &str,
    in_headers: &mut HeaderMap,
    remote_peer: Option<&str>,
) -> Result<(Arc<Conversation>, oneshot::Receiver<Result<(), AuthError>>), AuthError> {
    let input = headers::take_authorization(in_headers, true);

    let parsed = match (&input, scheme) {
        (Some(payload), "basic") => headers::parse_basic(payload),
        _ => None,
    };
    let Some((user, password)) = parsed else {
        return Err(AuthError::failed("Basic authentication required"));
    };

    let Some(connector) = &inner.ssh_connector else {
        return Err(AuthError::internal("SSH transport not configured"));
    };

    let creds = Credentials::new(user.clone(), application, inner.nonces.mint())
        .with_password(Some(SecretString::new(password.to_string())))
        .with_remote_peer(remote_peer.map(str::to_string));

    let host = inner.config.ssh_host().to_string();
    let pipe = AuthPipe::new(
        inner.nonces.mint(),
        format!("ssh ({host})"),
        Duration::from_secs(inner.config.auth_timeout(scheme)),
        Duration::from_secs(inner.config.response_timeout(scheme)),
    )
    .map_err(|err| AuthError::internal(format!("couldn't create auth channel: {err}")))?;

    let auth_fd = pipe
        .take_child_fd()
        .ok_or_else(|| AuthError::internal("couldn't create auth channel"))?;

    let transport = connector(SshRequest {
        host,
        port: inner.config.ssh_port(),
        command: inner.config.ssh_command().to_string(),
        user,
        password: creds.password().cloned(),
        auth_fd,
    });

    let result = transport.take_result();

    let conversation = Conversation::new(
        pipe,
        DriverState::Ssh(SshState {
            creds: Some(creds),
            transport: Some(transport),
            has_transport_result: false,
        }),
    );

    let completion = conversation.begin_completion();

    if let Some(result) = result {
        let conv = Arc::clone(&conversation);
        tokio::spawn(async move {
            let problem = match result.await {
                Ok(problem) => problem,
                Err(_) => Some("disconnected".to_string()),
            };
            let verdict = transport_verdict(&conv, problem.as_deref());
            conv.with_driver(|driver| {
                if let DriverState::Ssh(state) = driver {
                    state.has_transport_result = true;
                }
            });
            conv.complete(verdict);
        });
    }

    Ok((conversation, completion))
}

fn transport_verdict(
    conversation: &Arc<Conversation>,
    problem: Option<&str>,
) -> Result<(), AuthError> {
    let Some(problem) = problem else {
        return Ok(());
    };

    match problem {
        "authentication-failed" => {
            let methods = conversation.with_driver(|driver| match driver {
                DriverState::Ssh(state) => state
                    .transport
                    .as_ref()
                    .map(SshTransportHandle::auth_method_results)
                    .unwrap_or_default(),
                DriverState::Spawn(_) => HashMap::new(),
            });
            match methods.get("password").map(String::as_str) {
                None | Some("no-server-support") => Err(AuthError::failed(
                    "Authentication failed: authentication-not-supported",
                )),
                Some(_) => Err(AuthError::failed("Authentication failed")),
            }
        }
        "terminated" => Err(AuthError::failed("Authentication failed: terminated")),
        other => Err(AuthError::internal(format!(
            "Couldn't connect or authenticate: {other}"
        ))),
    }
}

/// Finish a remote login: either the transport settled, or the helper side
/// sent an interactive prompt first.
pub(crate) fn finalize(
    inner: &Arc<BrokerInner>,
    conversation: &Arc<Conversation>,
    headers: &mut HeaderMap,
) -> Result<Finalize, AuthError> {
    let settled = conversation.with_driver(|driver| match driver {
        DriverState::Ssh(state) => state.has_transport_result,
        DriverState::Spawn(_) => false,
    });

    if settled {
        let Some((creds, transport)) = conversation.with_driver(|driver| match driver {
            DriverState::Ssh(state) => state
                .creds
                .take()
                .map(|creds| (creds, state.transport.take())),
            DriverState::Spawn(_) => None,
        }) else {
            return Err(AuthError::internal("mismatched login driver"));
        };
        return Ok(Finalize::Credentials {
            creds,
            bridge: transport.map(crate::broker::session::Bridge::Ssh),
        });
    }

    match parse_prompt_results(conversation.take_response().as_deref()) {
        Ok(mut prompt_data) => {
            inner.prepare_login_reply(&mut prompt_data, headers, conversation)?;
            Ok(Finalize::Prompt(prompt_data))
        }
        Err(error) => {
            conversation.with_driver(|driver| {
                if let DriverState::Ssh(state) = driver {
                    if let Some(transport) = &state.transport {
                        transport.close("internal-error");
                    }
                }
            });
            Err(error)
        }
    }
}

fn parse_prompt_results(response: Option<&[u8]>) -> Result<serde_json::Value, AuthError> {
    let Some(response) = response else {
        return Err(AuthError::invalid("Authentication failed: no results"));
    };

    debug!("ssh auth says: {}", String::from_utf8_lossy(response));

    let Ok(text) = std::str::from_utf8(response) else {
        debug!("got non-utf8 data from ssh connection");
        return Err(AuthError::invalid("Data is not UTF8 encoded"));
    };

    let results: serde_json::Value = match serde_json::from_str(text) {
        Ok(results @ serde_json::Value::Object(_)) => results,
        _ => {
            debug!("couldn't parse ssh auth output");
            return Err(AuthError::invalid("Authentication failed: no results"));
        }
    };

    match results.get("prompt") {
        Some(serde_json::Value::String(_)) => Ok(results),
        Some(_) => Err(AuthError::invalid("Authentication failed: invalid results")),
        None => Err(AuthError::invalid("Authentication failed: missing prompt")),
    }
}
