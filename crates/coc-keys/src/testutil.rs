//! Mock developer console helpers shared by the provisioning tests.
//!
//! Each account's session is identified by the cookie its login sets, so one
//! `MockServer` can stand in for the console across several accounts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::account::OperatorAccount;
use crate::provision::RetryPolicy;
use crate::resolver::TargetAddress;

pub const TARGET: &str = "203.0.113.7";
pub const KEY_NAME: &str = "coc-proxy";

pub fn account(email: &str) -> OperatorAccount {
    OperatorAccount::new(email, "pw")
}

pub fn target() -> TargetAddress {
    TargetAddress::from(TARGET.parse::<std::net::IpAddr>().unwrap())
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        ..RetryPolicy::default()
    }
}

fn session_cookie(session: &str) -> String {
    format!("session={session}")
}

fn login_token(address: &str) -> String {
    let claims = serde_json::json!({
        "limits": [
            {"tier": "developer/silver", "type": "throttling"},
            {"cidrs": [format!("{address}/32")], "type": "client"}
        ]
    });
    format!("hdr.{}.sig", URL_SAFE_NO_PAD.encode(claims.to_string()))
}

/// Login for `email` succeeds once per call site and sets the session cookie.
pub async fn mount_login(server: &MockServer, email: &str, session: &str) {
    mount_login_with_address(server, email, session, TARGET).await;
}

pub async fn mount_login_with_address(
    server: &MockServer,
    email: &str,
    session: &str,
    address: &str,
) {
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(serde_json::json!({"email": email})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "set-cookie",
                    format!("{}; Path=/", session_cookie(session)).as_str(),
                )
                .set_body_json(serde_json::json!({"temporaryAPIToken": login_token(address)})),
        )
        .mount(server)
        .await;
}

/// Listing for `session` returns `keys`; expects exactly `calls` requests.
pub async fn mount_listing(
    server: &MockServer,
    session: &str,
    keys: serde_json::Value,
    calls: u64,
) {
    Mock::given(method("POST"))
        .and(path("/apikey/list"))
        .and(header("cookie", session_cookie(session).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"keys": keys})))
        .expect(calls)
        .mount(server)
        .await;
}

/// Create endpoint for `session` minting `<prefix>-1`, `<prefix>-2`, ...
pub async fn mount_create(server: &MockServer, session: &str, prefix: &str, calls: u64) {
    Mock::given(method("POST"))
        .and(path("/apikey/create"))
        .and(header("cookie", session_cookie(session).as_str()))
        .and(body_partial_json(serde_json::json!({
            "name": KEY_NAME,
            "cidrRanges": [TARGET],
            "scopes": ["clash"]
        })))
        .respond_with(SequentialKeys::new(prefix))
        .expect(calls)
        .mount(server)
        .await;
}

/// Revoke must not be called at all.
pub async fn forbid_revoke(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/apikey/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(server)
        .await;
}

/// External address lookup at `/ip`.
pub async fn mount_lookup(server: &MockServer, address: &str) {
    Mock::given(method("GET"))
        .and(path("/ip"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ip": address})))
        .mount(server)
        .await;
}

/// A listed key in console JSON form.
pub fn remote_key(id: &str, name: &str, address: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "key": format!("secret-{id}"),
        "cidrRanges": [address]
    })
}

/// Responds to create calls with a fresh, numbered secret each time.
pub struct SequentialKeys {
    prefix: String,
    issued: AtomicUsize,
}

impl SequentialKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
            issued: AtomicUsize::new(0),
        }
    }
}

impl Respond for SequentialKeys {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "key": {"key": format!("{}-{n}", self.prefix)}
        }))
    }
}
