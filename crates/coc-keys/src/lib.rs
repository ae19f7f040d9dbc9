//! API key provisioning and rotation
//!
//! Builds a pool of game API keys from one or more developer console
//! accounts and hands them out round-robin so no single key burns through
//! its rate limit.
//!
//! Startup flow:
//! 1. `AddressResolver` works out the outbound IP every key must be bound to
//! 2. `AccountProvisioner` reconciles one account: keeps matching keys,
//!    revokes the rest, creates new ones up to the requested count
//! 3. `PoolProvisioner` runs that for every account and concatenates the
//!    results into a `TokenPool`
//! 4. `TokenRotator` serves the pool, either from process memory or from a
//!    shared state directory that worker processes attach to

pub mod account;
pub mod error;
pub mod pool;
pub mod provision;
pub mod resolver;
pub mod rotator;

#[cfg(test)]
mod testutil;

pub use account::{OperatorAccount, generate_accounts};
pub use error::{Error, Result};
pub use pool::{PoolProvisioner, TokenPool};
pub use provision::{AccountKeys, AccountProvisioner, RetryPolicy};
pub use resolver::{AddressResolver, TargetAddress};
pub use rotator::{RotatorState, TokenRotator, remove_shared_state};
