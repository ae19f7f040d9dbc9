//! Wire types for the console's key endpoints
//!
//! The console speaks camelCase JSON. Listing responses carry a lot of fields
//! we never use (tier, origins, validUntil); only the ones the provisioner
//! needs are modelled, everything else is ignored on deserialisation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::KEY_SCOPES;

/// A key as the console knows it, whether or not we want to keep it.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteKey {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// The bearer secret sent to the game API
    pub key: String,
    #[serde(default)]
    pub cidr_ranges: Vec<String>,
}

impl RemoteKey {
    /// Whether this key is bound to `address` (exact entry match).
    pub fn is_bound_to(&self, address: &str) -> bool {
        self.cidr_ranges.iter().any(|range| range == address)
    }
}

impl fmt::Debug for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("key", &"[REDACTED]")
            .field("cidr_ranges", &self.cidr_ranges)
            .finish()
    }
}

/// Body of `POST /apikey/list`.
#[derive(Debug, Deserialize)]
pub(crate) struct KeyListResponse {
    #[serde(default)]
    pub keys: Vec<RemoteKey>,
}

/// Body sent to `POST /apikey/create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub name: String,
    pub description: String,
    pub cidr_ranges: Vec<String>,
    pub scopes: Vec<String>,
}

impl CreateKeyRequest {
    /// Request for a key named `name` bound to the single `address`.
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_owned(),
            description: format!("Created on {}", chrono::Utc::now().to_rfc3339()),
            cidr_ranges: vec![address.to_owned()],
            scopes: KEY_SCOPES.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

/// Body of `POST /apikey/create`. Either `key.key` or `error` is present.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct CreateKeyResponse {
    #[serde(default)]
    pub key: Option<CreatedKey>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CreatedKey {
    #[serde(default)]
    pub key: Option<String>,
}
