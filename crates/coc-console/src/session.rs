//! Console login and per-account key management
//!
//! The console authenticates with a session cookie set by `/login`. Every
//! login builds its own `reqwest::Client` with a fresh cookie jar, so two
//! accounts never share authentication state even when provisioned back to
//! back. All calls are POSTs with JSON bodies and carry the client timeout.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::constants::{
    CREATE_KEY_PATH, LIST_KEYS_PATH, LOGIN_PATH, REVOKE_KEY_PATH, TOO_MANY_KEYS,
};
use crate::error::{Error, Result};
use crate::keys::{CreateKeyRequest, CreateKeyResponse, KeyListResponse, RemoteKey};

/// Entry point to the developer console.
#[derive(Debug, Clone)]
pub struct ConsoleClient {
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "temporaryAPIToken", alias = "temporaryToken")]
    temporary_token: String,
}

impl ConsoleClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Log in as an operator account and open a session.
    ///
    /// A 403 means the console rejected the email/password pair and maps to
    /// `InvalidCredentials`; callers must not retry it.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Http(format!("building console client: {e}")))?;

        let response = http
            .post(format!("{}{LOGIN_PATH}", self.base_url))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::InvalidCredentials(email.to_owned()));
        }
        if !status.is_success() {
            return Err(status_error(response).await);
        }

        let login = response
            .json::<LoginResponse>()
            .await
            .map_err(|e| Error::MalformedResponse(format!("login response: {e}")))?;

        debug!(email, "console login succeeded");
        Ok(Session {
            http,
            base_url: self.base_url.clone(),
            email: email.to_owned(),
            temporary_token: login.temporary_token,
        })
    }
}

/// An authenticated console session for one operator account.
pub struct Session {
    http: reqwest::Client,
    base_url: String,
    email: String,
    temporary_token: String,
}

impl Session {
    pub fn email(&self) -> &str {
        &self.email
    }

    /// The signed token returned by login. Its claims carry the address the
    /// console saw the login come from.
    pub fn temporary_token(&self) -> &str {
        &self.temporary_token
    }

    /// List every key owned by the account, in console order.
    pub async fn list_keys(&self) -> Result<Vec<RemoteKey>> {
        let response = self
            .http
            .post(self.url(LIST_KEYS_PATH))
            .send()
            .await
            .map_err(|e| Error::Http(format!("list request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let listing = response
            .json::<KeyListResponse>()
            .await
            .map_err(|e| Error::MalformedResponse(format!("key listing: {e}")))?;
        Ok(listing.keys)
    }

    /// Revoke the key with the given console id.
    pub async fn revoke_key(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(REVOKE_KEY_PATH))
            .json(&serde_json::json!({ "id": id }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("revoke request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        debug!(email = %self.email, key_id = id, "revoked key");
        Ok(())
    }

    /// Create a key and return its secret.
    ///
    /// The console answers with either `{"key": {"key": "<secret>"}}` or an
    /// error payload. `too-many-keys` becomes `TooManyKeys`; a body without a
    /// secret is `MalformedResponse` even on a 200.
    pub async fn create_key(&self, request: &CreateKeyRequest) -> Result<String> {
        let response = self
            .http
            .post(self.url(CREATE_KEY_PATH))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(format!("create request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading create response: {e}")))?;

        let parsed = serde_json::from_str::<CreateKeyResponse>(&body);
        if let Ok(CreateKeyResponse {
            error: Some(code),
            description,
            ..
        }) = &parsed
            && code == TOO_MANY_KEYS
        {
            return Err(Error::TooManyKeys(
                description.clone().unwrap_or_else(|| code.clone()),
            ));
        }

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed =
            parsed.map_err(|e| Error::MalformedResponse(format!("create response: {e}")))?;
        parsed
            .key
            .and_then(|k| k.key)
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| {
                Error::MalformedResponse(match parsed.error {
                    Some(code) => format!("create failed: {code}"),
                    None => "create response has no key secret".into(),
                })
            })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn status_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    Error::Status { status, body }
}
