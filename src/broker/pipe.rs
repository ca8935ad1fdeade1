//! Framed side-channel between the broker and an authentication helper.
//!
//! One end of a socket pair goes to the helper (inherited on fd 3, or
//! driven in-process by an SSH transport); the broker keeps the other and
//! exchanges length-prefixed frames: ASCII decimal byte count, `\n`,
//! payload. Two timers bound the conversation — a wall-clock limit from
//! creation, and an idle limit between helper messages.

use crate::broker::error::AuthError;
use std::io::ErrorKind;
use std::os::fd::OwnedFd;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::debug;

/// Helpers speak one JSON object per frame; anything bigger than this is a
/// protocol violation.
const MAX_FRAME: usize = 64 * 1024;

pub enum PipeEvent {
    /// One complete frame received from the helper.
    Message(Vec<u8>),
    /// Channel closed; carries the reason when the close was not clean.
    Close(Option<AuthError>),
}

pub struct AuthPipe {
    id: String,
    logname: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    child_fd: StdMutex<Option<OwnedFd>>,
    events: StdMutex<Option<mpsc::UnboundedReceiver<PipeEvent>>>,
}

impl AuthPipe {
    /// Create the channel and start the reader with its two timeouts.
    ///
    /// # Errors
    /// Returns an error if the socket pair cannot be created.
    pub fn new(
        id: impl Into<String>,
        logname: impl Into<String>,
        conversation_timeout: Duration,
        idle_timeout: Duration,
    ) -> std::io::Result<Self> {
        let id = id.into();
        let logname = logname.into();

        let (parent, child) = std::os::unix::net::UnixStream::pair()?;
        parent.set_nonblocking(true)?;
        let parent = UnixStream::from_std(parent)?;
        let (read_half, write_half) = parent.into_split();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_reader(
            logname.clone(),
            read_half,
            conversation_timeout,
            idle_timeout,
            events_tx,
        ));

        Ok(Self {
            id,
            logname,
            writer: Mutex::new(Some(write_half)),
            child_fd: StdMutex::new(Some(OwnedFd::from(child))),
            events: StdMutex::new(Some(events_rx)),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The helper's end of the channel, for fd-3 inheritance. Yields once.
    pub fn take_child_fd(&self) -> Option<OwnedFd> {
        self.child_fd.lock().expect("child fd lock").take()
    }

    /// The event stream for this channel. Yields once; the conversation
    /// drains it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PipeEvent>> {
        self.events.lock().expect("events lock").take()
    }

    /// Send a single frame to the helper.
    ///
    /// # Errors
    /// Returns `InternalFailure` if the channel is already closed or the
    /// write fails.
    pub async fn answer(&self, payload: &[u8]) -> Result<(), AuthError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| AuthError::internal("authentication channel closed"))?;

        let header = format!("{}\n", payload.len());
        let result = async {
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(payload).await?;
            writer.flush().await
        }
        .await;

        if let Err(err) = result {
            debug!("{}: couldn't write to auth channel: {err}", self.logname);
            *guard = None;
            return Err(AuthError::internal("authentication channel closed"));
        }
        Ok(())
    }
}

async fn run_reader(
    logname: String,
    read_half: OwnedReadHalf,
    conversation_timeout: Duration,
    idle_timeout: Duration,
    events: mpsc::UnboundedSender<PipeEvent>,
) {
    let mut reader = BufReader::new(read_half);
    let deadline = Instant::now() + conversation_timeout;

    let close = loop {
        let frame = tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                debug!("{logname}: authentication timed out");
                break Some(AuthError::failed("Authentication failed: timeout"));
            }
            frame = tokio::time::timeout(idle_timeout, read_frame(&mut reader)) => frame,
        };

        match frame {
            Err(_) => {
                debug!("{logname}: helper went silent, closing");
                break Some(AuthError::failed("Authentication failed: timeout"));
            }
            Ok(Ok(Some(payload))) => {
                if events.send(PipeEvent::Message(payload)).is_err() {
                    return;
                }
            }
            Ok(Ok(None)) => break None,
            Ok(Err(err)) => {
                debug!("{logname}: couldn't read from auth channel: {err}");
                break Some(AuthError::internal("internal error in login process"));
            }
        }
    };

    let _ = events.send(PipeEvent::Close(close));
}

/// Read one frame; `Ok(None)` is a clean EOF at a frame boundary.
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<Vec<u8>>> {
    let mut length: usize = 0;
    let mut seen_digit = false;

    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof && !seen_digit => return Ok(None),
            Err(err) => return Err(err),
        };
        match byte {
            b'\n' if seen_digit => break,
            b'0'..=b'9' => {
                length = length * 10 + usize::from(byte - b'0');
                seen_digit = true;
                if length > MAX_FRAME {
                    return Err(std::io::Error::new(
                        ErrorKind::InvalidData,
                        "oversized frame",
                    ));
                }
            }
            _ => {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidData,
                    "malformed frame length",
                ));
            }
        }
    }

    let mut payload = vec![0; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn pipe_with_timeouts(secs: u64) -> (AuthPipe, std::os::unix::net::UnixStream) {
        let pipe = AuthPipe::new(
            "test-id",
            "test-helper",
            Duration::from_secs(secs),
            Duration::from_secs(secs),
        )
        .expect("pipe");
        let fd = pipe.take_child_fd().expect("child fd");
        (pipe, std::os::unix::net::UnixStream::from(fd))
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (pipe, mut helper) = pipe_with_timeouts(5);
        let mut events = pipe.take_events().expect("events");

        pipe.answer(b"alice:secret").await.expect("answer");

        let mut buf = [0u8; 15];
        helper.read_exact(&mut buf).expect("read");
        assert_eq!(&buf[..], b"12\nalice:secret");

        helper.write_all(b"16\n{\"user\":\"alice\"}").expect("write");
        match events.recv().await {
            Some(PipeEvent::Message(payload)) => assert_eq!(payload, b"{\"user\":\"alice\"}"),
            _ => panic!("expected a message event"),
        }
    }

    #[tokio::test]
    async fn clean_eof_closes_without_error() {
        let (pipe, helper) = pipe_with_timeouts(5);
        let mut events = pipe.take_events().expect("events");
        drop(helper);
        match events.recv().await {
            Some(PipeEvent::Close(None)) => {}
            _ => panic!("expected a clean close"),
        }
    }

    #[tokio::test]
    async fn malformed_length_closes_with_error() {
        let (pipe, mut helper) = pipe_with_timeouts(5);
        let mut events = pipe.take_events().expect("events");
        helper.write_all(b"bogus\n").expect("write");
        match events.recv().await {
            Some(PipeEvent::Close(Some(AuthError::InternalFailure(_)))) => {}
            _ => panic!("expected an error close"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_closes_the_channel() {
        let (pipe, helper) = pipe_with_timeouts(1);
        let mut events = pipe.take_events().expect("events");
        // Keep the helper end open but silent; only the timer can fire.
        match events.recv().await {
            Some(PipeEvent::Close(Some(AuthError::AuthenticationFailed(message)))) => {
                assert!(message.contains("timeout"));
            }
            _ => panic!("expected a timeout close"),
        }
        drop(helper);
    }

    #[tokio::test]
    async fn answer_after_close_fails() {
        let (pipe, helper) = pipe_with_timeouts(5);
        drop(helper);
        // First write may still succeed into the socket buffer; keep writing
        // until the peer reset surfaces.
        let mut failed = false;
        for _ in 0..64 {
            if pipe.answer(b"data").await.is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }
}
