//! Outbound address derivation
//!
//! Keys only work from the IP they are bound to, so provisioning needs the
//! address the game API will see. Two sources:
//!
//! - the login token: its claims carry a `limits` entry of type `client`
//!   whose first CIDR is the address the console saw the login come from
//! - an external "what is my IP" service answering `{"ip": "..."}`

use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct SessionClaims {
    #[serde(default)]
    limits: Vec<Limit>,
}

#[derive(Debug, Deserialize)]
struct Limit {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    cidrs: Vec<String>,
}

/// Extract the client address from a console login token.
///
/// The token is `header.claims.signature`; the claims segment is base64 of a
/// JSON document. Both the standard and URL-safe alphabets are accepted, with
/// or without padding. The signature is not verified.
pub fn address_from_session_token(token: &str) -> Result<IpAddr> {
    let segment = token
        .split('.')
        .nth(1)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::AddressUnavailable("session token has no claims segment".into()))?;

    let normalized: String = segment
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let decoded = URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::AddressUnavailable(format!("decoding session claims: {e}")))?;

    let claims: SessionClaims = serde_json::from_slice(&decoded)
        .map_err(|e| Error::AddressUnavailable(format!("parsing session claims: {e}")))?;

    let cidr = claims
        .limits
        .iter()
        .find(|limit| limit.kind == "client")
        .ok_or_else(|| Error::AddressUnavailable("no client limit in session claims".into()))?
        .cidrs
        .first()
        .ok_or_else(|| Error::AddressUnavailable("client limit has no CIDR ranges".into()))?;

    parse_address(cidr.split('/').next().unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    ip: String,
}

/// Ask an external lookup service for this host's public address.
pub async fn lookup_public_address(client: &reqwest::Client, url: &str) -> Result<IpAddr> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::AddressUnavailable(format!("address lookup failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::AddressUnavailable(format!(
            "address lookup returned {status}"
        )));
    }

    let body = response
        .json::<LookupResponse>()
        .await
        .map_err(|e| Error::AddressUnavailable(format!("invalid lookup response: {e}")))?;
    parse_address(&body.ip)
}

fn parse_address(raw: &str) -> Result<IpAddr> {
    raw.trim()
        .parse::<IpAddr>()
        .map_err(|e| Error::AddressUnavailable(format!("{raw:?} is not an IP address: {e}")))
}
