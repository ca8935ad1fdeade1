//! Login by spawning a helper command.
//!
//! The helper inherits stdin/stdout (kept by the broker as the post-login
//! bridge), stderr, and the auth channel on fd 3. It receives the
//! authorization payload as the first frame and answers with one JSON
//! verdict per round.

use crate::broker::conversation::{Conversation, DriverState};
use crate::broker::creds::Credentials;
use crate::broker::error::AuthError;
use crate::broker::headers;
use crate::broker::pipe::AuthPipe;
use crate::broker::session::Bridge;
use crate::broker::{BrokerInner, Finalize};
use axum::http::HeaderMap;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use secrecy::SecretString;
use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub struct SpawnState {
    child: Option<Child>,
    authorization: Option<Zeroizing<Vec<u8>>>,
    scheme: String,
    application: String,
    remote_peer: Option<String>,
    command: String,
}

impl SpawnState {
    /// Stop an unwanted helper. The subprocess gets a `SIGTERM` and is
    /// reaped in the background; stdin/stdout close with the handle.
    pub(crate) fn abort(&mut self) {
        if let Some(child) = self.child.take() {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let mut child = child;
                handle.spawn(async move {
                    let _ = child.wait().await;
                });
            }
        }
    }
}

impl Drop for SpawnState {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
impl SpawnState {
    pub(crate) fn for_tests(scheme: &str) -> Self {
        Self {
            child: None,
            authorization: None,
            scheme: scheme.to_string(),
            application: "cockpit".to_string(),
            remote_peer: None,
            command: "test-helper".to_string(),
        }
    }
}

/// Start a spawned login attempt and return the conversation plus its
/// completion.
pub(crate) async fn begin(
    inner: &Arc<BrokerInner>,
    application: &str,
    scheme: &str,
    decode_header: bool,
    in_headers: &mut HeaderMap,
    remote_peer: Option<&str>,
) -> Result<(Arc<Conversation>, oneshot::Receiver<Result<(), AuthError>>), AuthError> {
    let command = inner.config.command(scheme).to_string();

    let mut input = headers::take_authorization(in_headers, decode_header);
    if input.is_none()
        && scheme == "negotiate"
        && !inner.gssapi_unavailable.load(Ordering::Relaxed)
    {
        // Let the helper start a GSSAPI handshake without a client token.
        input = Some(Zeroizing::new(Vec::new()));
    }
    let Some(input) = input else {
        return Err(AuthError::failed("Authentication required"));
    };

    let pipe = AuthPipe::new(
        inner.nonces.mint(),
        command.clone(),
        Duration::from_secs(inner.config.auth_timeout(scheme)),
        Duration::from_secs(inner.config.response_timeout(scheme)),
    )
    .map_err(|err| {
        warn!("couldn't create auth channel: {err}");
        AuthError::internal(format!("Internal error starting {command}"))
    })?;

    let child_fd = pipe
        .take_child_fd()
        .ok_or_else(|| AuthError::internal(format!("Internal error starting {command}")))?;

    debug!("spawning {command}");

    let mut cmd = Command::new(&command);
    cmd.arg(scheme)
        .arg(remote_peer.unwrap_or(""))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    // When running a spawned login command fd 3 is always the auth channel.
    // Every other descriptor the broker holds is close-on-exec already.
    let raw_fd = child_fd.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            if raw_fd == 3 {
                let flags = libc::fcntl(3, libc::F_GETFD);
                if flags < 0 || libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(raw_fd, 3) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|err| {
        warn!("failed to start {command}: {err}");
        AuthError::internal(format!("Internal error starting {command}"))
    })?;

    // Parent's copy of the child end closes here.
    drop(child_fd);

    let conversation = Conversation::new(
        pipe,
        DriverState::Spawn(SpawnState {
            child: Some(child),
            authorization: None,
            scheme: scheme.to_string(),
            application: application.to_string(),
            remote_peer: remote_peer.map(str::to_string),
            command,
        }),
    );

    let completion = conversation.begin_completion();
    let _ = conversation.answer(&input).await;
    conversation.with_driver(|driver| {
        if let DriverState::Spawn(state) = driver {
            state.authorization = Some(input);
        }
    });

    Ok((conversation, completion))
}

enum Verdict {
    User(String),
    Prompt,
    Fail(AuthError),
}

/// Turn the helper's last response into credentials, a prompt
/// registration, or a failure.
pub(crate) fn finalize(
    inner: &Arc<BrokerInner>,
    conversation: &Arc<Conversation>,
    headers: &mut HeaderMap,
) -> Result<Finalize, AuthError> {
    let response = conversation.take_response();
    let Some((scheme, command)) = conversation.with_driver(|driver| match driver {
        DriverState::Spawn(state) => Some((state.scheme.clone(), state.command.clone())),
        DriverState::Ssh(_) => None,
    }) else {
        return Err(AuthError::internal("mismatched login driver"));
    };

    let Some(response) = response else {
        warn!("couldn't parse {command} auth output: no data");
        return Err(AuthError::invalid("Authentication failed: no results"));
    };

    debug!("{command} says: {}", String::from_utf8_lossy(&response));

    let Ok(text) = std::str::from_utf8(&response) else {
        debug!("got non-utf8 user name from {command}");
        return Err(AuthError::invalid("Login user name is not UTF8 encoded"));
    };

    let results: serde_json::Value = match serde_json::from_str(text) {
        Ok(results @ serde_json::Value::Object(_)) => results,
        Ok(_) => {
            warn!("couldn't parse {command} auth output: not an object");
            return Err(AuthError::invalid("Authentication failed: no results"));
        }
        Err(err) => {
            warn!("couldn't parse {command} auth output: {err}");
            return Err(AuthError::invalid("Authentication failed: no results"));
        }
    };

    let verdict = decide(inner, &scheme, &command, &results);

    // Echo any GSSAPI output before the prompt challenge can take the
    // WWW-Authenticate slot.
    headers::build_gssapi_challenge(headers, Some(&results));

    match verdict {
        Verdict::Prompt => {
            let mut prompt_data = results;
            inner.prepare_login_reply(&mut prompt_data, headers, conversation)?;
            Ok(Finalize::Prompt(prompt_data))
        }
        Verdict::User(user) => {
            debug!("user authenticated as {user}");
            let Some((creds, bridge)) = conversation.with_driver(|driver| match driver {
                DriverState::Spawn(state) => {
                    Some(build_credentials(inner, &user, state, &results))
                }
                DriverState::Ssh(_) => None,
            }) else {
                return Err(AuthError::internal("mismatched login driver"));
            };
            Ok(Finalize::Credentials { creds, bridge })
        }
        Verdict::Fail(error) => Err(error),
    }
}

fn decide(
    inner: &Arc<BrokerInner>,
    scheme: &str,
    command: &str,
    results: &serde_json::Value,
) -> Verdict {
    let Ok(error_str) = optional_string(results, "error") else {
        return Verdict::Fail(AuthError::invalid("Authentication failed: invalid results"));
    };
    let Ok(message) = optional_string(results, "message") else {
        return Verdict::Fail(AuthError::invalid("Authentication failed: invalid results"));
    };
    let Ok(prompt) = optional_string(results, "prompt") else {
        return Verdict::Fail(AuthError::invalid("Authentication failed: invalid results"));
    };

    if prompt.is_some() {
        return Verdict::Prompt;
    }

    if let Some(error_str) = error_str {
        let message = message.unwrap_or("");
        return Verdict::Fail(match error_str {
            "authentication-unavailable" if scheme == "negotiate" => {
                inner.gssapi_unavailable.store(true, Ordering::Relaxed);
                debug!("negotiate auth is not available, disabling");
                AuthError::failed("Negotiate authentication not available")
            }
            "authentication-failed" | "authentication-unavailable" => {
                debug!("{error_str} {message}");
                AuthError::failed("Authentication failed")
            }
            "permission-denied" => {
                debug!("permission denied {message}");
                AuthError::PermissionDenied
            }
            other => {
                debug!("error from {command}: {other}: {message}");
                AuthError::internal(format!("Authentication failed: {other}: {message}"))
            }
        });
    }

    match optional_string(results, "user") {
        Ok(Some(user)) if !user.is_empty() => Verdict::User(user.to_string()),
        _ => Verdict::Fail(AuthError::invalid("Authentication failed: missing user")),
    }
}

fn build_credentials(
    inner: &Arc<BrokerInner>,
    user: &str,
    state: &mut SpawnState,
    results: &serde_json::Value,
) -> (Credentials, Option<Bridge>) {
    // Dig the password out of the authorization payload rather than
    // passing it back and forth through the helper.
    let password = if state.scheme == "basic" {
        state
            .authorization
            .as_ref()
            .and_then(|payload| headers::parse_basic(payload))
            .map(|(_, password)| SecretString::new(password.to_string()))
    } else {
        None
    };

    let gssapi = match optional_string(results, "gssapi-creds") {
        Ok(value) => value.map(str::to_string),
        Err(()) => {
            warn!("received bad gssapi-creds from {}", state.command);
            None
        }
    };

    let creds = Credentials::new(user, state.application.clone(), inner.nonces.mint())
        .with_password(password)
        .with_gssapi(gssapi)
        .with_remote_peer(state.remote_peer.clone())
        .with_login_data(Some(results.clone()));

    // The helper becomes the session's bridge; it is no longer ours to
    // kill.
    let bridge = state.child.take().map(Bridge::Pipe);

    (creds, bridge)
}

/// An optional string member: `Ok(None)` when absent, `Err` when present
/// with the wrong type.
fn optional_string<'a>(results: &'a serde_json::Value, member: &str) -> Result<Option<&'a str>, ()> {
    match results.get(member) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(()),
    }
}
