//! Header codec for the login pipeline.
//!
//! Parses `Authorization` into `(scheme, payload)`, derives the
//! application namespace from the request path, and formats the
//! `WWW-Authenticate` challenges. Payload buffers can carry passwords, so
//! every decoded copy lives in a [`Zeroizing`] buffer that is scrubbed on
//! drop.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, COOKIE, WWW_AUTHENTICATE},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const DEFAULT_APPLICATION: &str = "cockpit";
const APPLICATION_PREFIX: &str = "cockpit+";

/// Returns the `Authorization` scheme, lowercased.
///
/// Does not consume the header; the payload stays in place for
/// [`take_authorization`].
pub fn parse_authorization_scheme(headers: &HeaderMap) -> Option<String> {
    let line = headers.get(AUTHORIZATION)?.as_bytes();
    let line = skip_spaces(line);
    let boundary = line.iter().position(|&b| b == b' ')?;
    Some(String::from_utf8_lossy(&line[..boundary]).to_lowercase())
}

/// Removes `Authorization` from the headers and returns its payload.
///
/// The header is removed even when malformed, to limit how long secrets
/// sit in the header table. With `base64_decode` the payload is decoded;
/// either way the returned buffer is zeroed on drop.
pub fn take_authorization(headers: &mut HeaderMap, base64_decode: bool) -> Option<Zeroizing<Vec<u8>>> {
    let line = headers.remove(AUTHORIZATION)?;
    let line = skip_spaces(line.as_bytes());
    let boundary = line.iter().position(|&b| b == b' ')?;
    let contents = skip_spaces(&line[boundary..]);

    if base64_decode {
        match STANDARD.decode(contents) {
            Ok(decoded) => Some(Zeroizing::new(decoded)),
            Err(_) => None,
        }
    } else {
        Some(Zeroizing::new(contents.to_vec()))
    }
}

/// Splits a decoded Basic payload on the first `:`.
///
/// The password is returned in its own zeroing buffer; the user name is
/// not treated as secret. Returns `None` when no separator is present.
pub fn parse_basic(payload: &[u8]) -> Option<(String, Zeroizing<String>)> {
    let colon = payload.iter().position(|&b| b == b':')?;
    let user = String::from_utf8_lossy(&payload[..colon]).into_owned();
    let password = String::from_utf8_lossy(&payload[colon + 1..]).into_owned();
    Some((user, Zeroizing::new(password)))
}

/// Derive the application namespace from a request path.
///
/// `/cockpit+foo/...` is an embedded application `cockpit+foo`; everything
/// else belongs to the default application.
pub fn parse_application(path: &str) -> String {
    let Some(stripped) = path.strip_prefix('/') else {
        return DEFAULT_APPLICATION.to_string();
    };

    if let Some(suffix) = stripped.strip_prefix(APPLICATION_PREFIX) {
        if !suffix.is_empty() {
            let end = stripped.find('/').unwrap_or(stripped.len());
            return stripped[..end].to_string();
        }
    }

    DEFAULT_APPLICATION.to_string()
}

/// The application doubles as a cookie name, so it must stay inside the
/// cookie-name charset.
pub fn valid_application(application: &str) -> bool {
    !application.is_empty()
        && application
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'_' | b'-'))
}

/// Echo a helper's `gssapi-output` back to the client as a `Negotiate`
/// challenge. Empty output emits a bare `Negotiate`.
pub fn build_gssapi_challenge(headers: &mut HeaderMap, results: Option<&serde_json::Value>) {
    let output = match results.map(|r| r.get("gssapi-output")) {
        Some(Some(serde_json::Value::String(output))) => output,
        Some(Some(_)) => {
            warn!("received invalid gssapi-output field");
            return;
        }
        _ => return,
    };

    let Ok(data) = hex::decode(output) else {
        warn!("received invalid gssapi-output field");
        return;
    };

    let value = if data.is_empty() {
        "Negotiate".to_string()
    } else {
        format!("Negotiate {}", STANDARD.encode(&data))
    };

    debug!("gssapi: WWW-Authenticate: {value}");
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(WWW_AUTHENTICATE, value);
    }
}

/// Challenge the client to continue an interactive conversation.
pub fn build_prompt_challenge(headers: &mut HeaderMap, conversation_id: &str, prompt: &str) {
    let value = format!("X-Login-Reply {conversation_id} {}", STANDARD.encode(prompt));
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(WWW_AUTHENTICATE, value);
    }
}

/// Look up a cookie by name across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let value = header.to_str().ok()?;
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next()?.trim();
            let val = parts.next()?.trim();
            if key == name {
                return Some(val.to_string());
            }
        }
    }
    None
}

fn skip_spaces(mut bytes: &[u8]) -> &[u8] {
    while let [b' ', rest @ ..] = bytes {
        bytes = rest;
    }
    bytes
}
