//! End-to-end login flows against shell helpers speaking the fd-3 frame
//! protocol.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, COOKIE, SET_COOKIE, WWW_AUTHENTICATE},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use enirejo::broker::{AuthError, Broker, LoginOutcome};
use enirejo::config::Config;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;

/// Write an executable helper script. A `reply` function that emits one
/// length-prefixed frame on fd 3 is prepended for convenience.
fn write_helper(dir: &TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    let script = format!(
        "#!/bin/sh\n\
         reply() {{\n\
         \tprintf '%s\\n' \"${{#1}}\" >&3\n\
         \tprintf '%s' \"$1\" >&3\n\
         }}\n\
         {body}\n"
    );
    std::fs::write(&path, script).expect("write helper");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path.to_string_lossy().into_owned()
}

fn broker_for(command: &str, scheme_extra: &str) -> Broker {
    let raw = format!(
        r#"
[basic]
command = "{command}"
{scheme_extra}

[negotiate]
command = "{command}"
"#
    );
    let config = Config::parse(&raw).expect("config");
    Broker::builder(config).build().expect("broker")
}

fn basic_headers(payload: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(payload))).expect("header"),
    );
    headers
}

#[tokio::test]
async fn basic_login_succeeds_and_keeps_the_helper_as_bridge() {
    let dir = TempDir::new().expect("tempdir");
    let helper = write_helper(
        &dir,
        "echo-user",
        "read -r len <&3\n\
         head -c \"$len\" <&3 > /dev/null\n\
         reply '{\"user\":\"alice\"}'\n\
         cat > /dev/null",
    );
    let broker = broker_for(&helper, "");

    let mut in_headers = basic_headers("alice:secret");
    let mut out_headers = HeaderMap::new();
    let outcome = broker
        .login("/login", &mut in_headers, Some("1.2.3.4"), &mut out_headers)
        .await
        .expect("login");

    let LoginOutcome::Authenticated { user, body } = outcome else {
        panic!("expected authentication");
    };
    assert_eq!(user, "alice");
    assert_eq!(body["login-data"]["user"], "alice");

    let cookie = out_headers
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .expect("set-cookie");
    assert!(cookie.starts_with("cockpit="));
    assert!(cookie.ends_with("; Path=/; Secure; HttpOnly"));

    let encoded = cookie
        .trim_start_matches("cockpit=")
        .split(';')
        .next()
        .expect("value");
    let decoded = String::from_utf8(STANDARD.decode(encoded).expect("base64")).expect("utf8");
    assert!(decoded.starts_with("v=2;k="));

    let mut cookie_headers = HeaderMap::new();
    cookie_headers.insert(
        COOKIE,
        HeaderValue::from_str(&format!("cockpit={encoded}")).expect("header"),
    );
    let service = broker
        .check_cookie("/system", &cookie_headers)
        .expect("session resolves");
    assert_eq!(service.user(), "alice");

    assert_eq!(broker.in_flight_logins(), 0);
}

#[tokio::test]
async fn empty_basic_payload_still_reaches_the_helper() {
    let dir = TempDir::new().expect("tempdir");
    let helper = write_helper(
        &dir,
        "echo-user",
        "read -r len <&3\n\
         head -c \"$len\" <&3 > /dev/null\n\
         reply '{\"user\":\"alice\"}'",
    );
    let broker = broker_for(&helper, "");

    let mut in_headers = HeaderMap::new();
    in_headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic "));
    let mut out_headers = HeaderMap::new();
    let outcome = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect("login");
    assert!(matches!(outcome, LoginOutcome::Authenticated { .. }));

    let cookie = out_headers
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .expect("set-cookie");
    let encoded = cookie
        .trim_start_matches("cockpit=")
        .split(';')
        .next()
        .expect("value");
    let decoded = String::from_utf8(STANDARD.decode(encoded).expect("base64")).expect("utf8");
    assert!(decoded.starts_with("v=2;k="));
}

#[tokio::test]
async fn interactive_prompt_round_trips_through_the_helper() {
    let dir = TempDir::new().expect("tempdir");
    let helper = write_helper(
        &dir,
        "ask-pin",
        "read -r len <&3\n\
         head -c \"$len\" <&3 > /dev/null\n\
         reply '{\"prompt\":\"PIN?\"}'\n\
         read -r len <&3\n\
         answer=$(head -c \"$len\" <&3)\n\
         if [ \"$answer\" = \"1234\" ]; then\n\
         \treply '{\"user\":\"alice\"}'\n\
         else\n\
         \treply '{\"error\":\"authentication-failed\",\"message\":\"bad pin\"}'\n\
         fi",
    );
    let broker = broker_for(&helper, "");

    let mut in_headers = basic_headers("alice:secret");
    let mut out_headers = HeaderMap::new();
    let outcome = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect("first round");
    let LoginOutcome::Challenge { body } = outcome else {
        panic!("expected a challenge");
    };
    assert!(body.get("prompt").is_none());
    assert_eq!(broker.pending_count(), 1);

    let challenge = out_headers
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .expect("challenge");
    let mut parts = challenge.split(' ');
    assert_eq!(parts.next(), Some("X-Login-Reply"));
    let id = parts.next().expect("id");
    assert_eq!(parts.next(), Some(STANDARD.encode("PIN?")).as_deref());

    let mut in_headers = HeaderMap::new();
    in_headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("X-Login-Reply {id} {}", STANDARD.encode("1234")))
            .expect("header"),
    );
    let mut out_headers = HeaderMap::new();
    let outcome = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect("resume");
    assert!(matches!(outcome, LoginOutcome::Authenticated { .. }));
    assert_eq!(broker.pending_count(), 0);
    assert_eq!(broker.in_flight_logins(), 0);
}

#[tokio::test]
async fn gssapi_unavailable_disables_negotiate() {
    let dir = TempDir::new().expect("tempdir");
    let marker = dir.path().join("spawned");
    let helper = write_helper(
        &dir,
        "unavailable",
        &format!(
            "echo run >> '{}'\n\
             read -r len <&3\n\
             head -c \"$len\" <&3 > /dev/null\n\
             reply '{{\"error\":\"authentication-unavailable\"}}'",
            marker.display()
        ),
    );
    let broker = broker_for(&helper, "");

    // No Authorization header at all dispatches as negotiate.
    let mut in_headers = HeaderMap::new();
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("unavailable");
    assert_eq!(error.to_string(), "Negotiate authentication not available");
    assert_eq!(
        std::fs::read_to_string(&marker).expect("marker").lines().count(),
        1
    );

    // The broker now skips GSSAPI without spawning anything.
    let mut in_headers = HeaderMap::new();
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("skipped");
    assert_eq!(error.to_string(), "Authentication required");
    assert_eq!(
        std::fs::read_to_string(&marker).expect("marker").lines().count(),
        1
    );
}

#[tokio::test]
async fn helper_error_verdicts_map_to_the_taxonomy() {
    let dir = TempDir::new().expect("tempdir");

    let denied = write_helper(
        &dir,
        "denied",
        "read -r len <&3\n\
         head -c \"$len\" <&3 > /dev/null\n\
         reply '{\"error\":\"permission-denied\",\"message\":\"not wheel\"}'",
    );
    let broker = broker_for(&denied, "");
    let mut in_headers = basic_headers("alice:secret");
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("denied");
    assert!(matches!(error, AuthError::PermissionDenied));

    let failed = write_helper(
        &dir,
        "failed",
        "read -r len <&3\n\
         head -c \"$len\" <&3 > /dev/null\n\
         reply '{\"error\":\"authentication-failed\",\"message\":\"bad password\"}'",
    );
    let broker = broker_for(&failed, "");
    let mut in_headers = basic_headers("alice:wrong");
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("failed");
    assert_eq!(error.to_string(), "Authentication failed");

    let garbage = write_helper(
        &dir,
        "garbage",
        "read -r len <&3\n\
         head -c \"$len\" <&3 > /dev/null\n\
         reply 'not json at all'",
    );
    let broker = broker_for(&garbage, "");
    let mut in_headers = basic_headers("alice:secret");
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("garbage");
    assert!(matches!(error, AuthError::InvalidData(_)));

    let missing_user = write_helper(
        &dir,
        "missing-user",
        "read -r len <&3\n\
         head -c \"$len\" <&3 > /dev/null\n\
         reply '{}'",
    );
    let broker = broker_for(&missing_user, "");
    let mut in_headers = basic_headers("alice:secret");
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("missing user");
    assert_eq!(error.to_string(), "Authentication failed: missing user");
}

#[tokio::test]
async fn unspawnable_helper_is_an_internal_failure() {
    let broker = broker_for("/nonexistent/enirejo-helper", "");
    let mut in_headers = basic_headers("alice:secret");
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("spawn failure");
    assert!(matches!(error, AuthError::InternalFailure(_)));
    assert_eq!(broker.in_flight_logins(), 0);
}

#[tokio::test]
async fn silent_helper_times_out() {
    let dir = TempDir::new().expect("tempdir");
    let helper = write_helper(&dir, "silent", "sleep 30");
    let broker = broker_for(&helper, "timeout = \"1\"\nresponse-timeout = \"1\"");

    let mut in_headers = basic_headers("alice:secret");
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("timeout");
    assert!(error.to_string().contains("timeout"));
    assert_eq!(broker.in_flight_logins(), 0);
}

#[tokio::test]
async fn gssapi_output_is_echoed_as_a_negotiate_challenge() {
    let dir = TempDir::new().expect("tempdir");
    let output = hex::encode(b"server-token");
    let helper = write_helper(
        &dir,
        "gssapi-echo",
        &format!(
            "read -r len <&3\n\
             head -c \"$len\" <&3 > /dev/null\n\
             reply '{{\"error\":\"authentication-failed\",\"gssapi-output\":\"{output}\"}}'"
        ),
    );
    let broker = broker_for(&helper, "");

    let mut in_headers = HeaderMap::new();
    in_headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Negotiate {}", STANDARD.encode("client-token")))
            .expect("header"),
    );
    let mut out_headers = HeaderMap::new();
    let error = broker
        .login("/login", &mut in_headers, None, &mut out_headers)
        .await
        .expect_err("failed");
    assert_eq!(error.to_string(), "Authentication failed");

    let challenge = out_headers
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .expect("negotiate echo");
    assert_eq!(
        challenge,
        format!("Negotiate {}", STANDARD.encode(b"server-token"))
    );
}
