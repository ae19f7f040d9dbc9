//! Clash of Clans developer console client
//!
//! Typed access to the console endpoints used to manage API keys, plus the
//! helpers that work out which IP address new keys must be bound to. This
//! crate knows nothing about pools or rotation; it is the wire layer the
//! provisioner in `coc-keys` drives.
//!
//! Console flow for one operator account:
//! 1. `ConsoleClient::login()` opens a cookie-backed `Session`
//! 2. `Session::list_keys()` returns every key the account owns
//! 3. `Session::revoke_key()` removes keys bound elsewhere
//! 4. `Session::create_key()` mints new keys bound to the target address

pub mod address;
pub mod constants;
pub mod error;
pub mod keys;
pub mod session;

pub use address::{address_from_session_token, lookup_public_address};
pub use constants::*;
pub use error::{Error, Result};
pub use keys::{CreateKeyRequest, RemoteKey};
pub use session::{ConsoleClient, Session};
