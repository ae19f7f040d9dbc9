//! Developer console endpoints and limits

/// Base URL of the developer console API.
pub const DEFAULT_CONSOLE_URL: &str = "https://developer.clashofclans.com/api";

/// Public address lookup service returning `{"ip": "..."}`.
pub const DEFAULT_LOOKUP_URL: &str = "https://api.ipify.org?format=json";

pub const LOGIN_PATH: &str = "/login";
pub const LIST_KEYS_PATH: &str = "/apikey/list";
pub const REVOKE_KEY_PATH: &str = "/apikey/revoke";
pub const CREATE_KEY_PATH: &str = "/apikey/create";

/// Scopes granted to every key this service creates.
pub const KEY_SCOPES: &[&str] = &["clash"];

/// Hard per-account key limit enforced by the console.
pub const MAX_KEYS_PER_ACCOUNT: usize = 10;

/// Error code the console returns when an account is at its key limit.
pub const TOO_MANY_KEYS: &str = "too-many-keys";
