//! Credentials minted by a successful (or in-flight) login.
//!
//! One session owns one `Credentials` at a time. Secret fields zero
//! themselves on drop, and [`Credentials::poison`] scrubs them early when
//! a session is torn down.

use secrecy::SecretString;
use zeroize::Zeroizing;

pub struct Credentials {
    user: String,
    application: String,
    password: Option<SecretString>,
    gssapi: Option<Zeroizing<String>>,
    remote_peer: Option<String>,
    csrf_token: String,
    login_data: Option<serde_json::Value>,
}

impl Credentials {
    pub fn new(
        user: impl Into<String>,
        application: impl Into<String>,
        csrf_token: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            application: application.into(),
            password: None,
            gssapi: None,
            remote_peer: None,
            csrf_token: csrf_token.into(),
            login_data: None,
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: Option<SecretString>) -> Self {
        self.password = password;
        self
    }

    #[must_use]
    pub fn with_gssapi(mut self, gssapi: Option<String>) -> Self {
        self.gssapi = gssapi.map(Zeroizing::new);
        self
    }

    #[must_use]
    pub fn with_remote_peer(mut self, remote_peer: Option<String>) -> Self {
        self.remote_peer = remote_peer;
        self
    }

    #[must_use]
    pub fn with_login_data(mut self, login_data: Option<serde_json::Value>) -> Self {
        self.login_data = login_data;
        self
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn application(&self) -> &str {
        &self.application
    }

    #[must_use]
    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    #[must_use]
    pub fn remote_peer(&self) -> Option<&str> {
        self.remote_peer.as_deref()
    }

    pub fn password(&self) -> Option<&SecretString> {
        self.password.as_ref()
    }

    #[must_use]
    pub fn poisoned(&self) -> bool {
        self.password.is_none() && self.gssapi.is_none() && self.login_data.is_none()
    }

    /// Scrub every secret field in place. Dropping the taken values zeroes
    /// their backing storage before the call returns.
    pub fn poison(&mut self) {
        drop(self.password.take());
        drop(self.gssapi.take());
        self.login_data = None;
    }

    /// The document handed to the web client after login. Secrets are
    /// deliberately absent.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "user": self.user,
            "csrf-token": self.csrf_token,
        });
        if let Some(login_data) = &self.login_data {
            body["login-data"] = login_data.clone();
        }
        body
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("application", &self.application)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("gssapi", &self.gssapi.as_ref().map(|_| "***"))
            .field("remote_peer", &self.remote_peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Credentials {
        Credentials::new("alice", "cockpit", "token123")
            .with_password(Some(SecretString::new("secret".to_string())))
            .with_gssapi(Some("abcd".to_string()))
            .with_login_data(Some(serde_json::json!({ "user": "alice" })))
    }

    #[test]
    fn poison_clears_secrets() {
        let mut creds = sample();
        assert!(!creds.poisoned());
        creds.poison();
        assert!(creds.poisoned());
        assert!(creds.password().is_none());
    }

    #[test]
    fn json_body_has_no_secrets() {
        let creds = sample();
        let body = creds.to_json();
        assert_eq!(body["user"], "alice");
        assert_eq!(body["csrf-token"], "token123");
        assert_eq!(body["login-data"]["user"], "alice");
        assert!(body.to_string().find("secret").is_none());
    }

    #[test]
    fn debug_redacts_password() {
        let creds = sample();
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("***"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn password_is_readable_until_poisoned() {
        use secrecy::ExposeSecret;
        let creds = sample();
        assert_eq!(
            creds.password().map(|password| password.expose_secret().as_str()),
            Some("secret")
        );
    }
}
