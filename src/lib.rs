//! # Enirejo
//!
//! Authentication broker for a web-based system-administration gateway.
//!
//! The broker consumes HTTP `Authorization` headers (Basic,
//! Negotiate/GSSAPI, and the interactive `X-Login-Reply` scheme), drives
//! an external helper — a spawned login subprocess or an SSH transport —
//! through a framed side-channel on fd 3, and on success mints a session
//! cookie bound to an in-memory session. Sessions are reaped by a
//! two-level idle regime: a per-session timer, and a process-wide timer
//! that signals `idling` once nothing is left.
//!
//! Credential verification itself lives in the helper; this crate
//! orchestrates the conversation, enforces admission control, and keeps
//! secrets scrubbed.

pub mod api;
pub mod broker;
pub mod cli;
pub mod config;
