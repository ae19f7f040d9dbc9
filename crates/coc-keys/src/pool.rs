//! Pool assembly across accounts

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::account::OperatorAccount;
use crate::error::{Error, Result};
use crate::provision::AccountProvisioner;
use crate::resolver::AddressResolver;

/// Ordered key secrets: account order, then existing-then-created within an
/// account. Never mutated once built; re-provisioning makes a new pool.
///
/// Serialises as a plain JSON array of strings.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenPool(Vec<String>);

impl TokenPool {
    pub fn new(keys: Vec<String>) -> Self {
        Self(keys)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for TokenPool {
    fn from(keys: Vec<String>) -> Self {
        Self(keys)
    }
}

// Secrets never reach logs.
impl fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPool").field("len", &self.0.len()).finish()
    }
}

/// Builds a `TokenPool` from every configured account.
///
/// There is no retry in here. Any account-level failure aborts the run and
/// startup decides whether to try again.
#[derive(Debug, Clone)]
pub struct PoolProvisioner {
    resolver: AddressResolver,
    accounts: AccountProvisioner,
    account_delay: Duration,
}

impl PoolProvisioner {
    pub fn new(
        resolver: AddressResolver,
        accounts: AccountProvisioner,
        account_delay: Duration,
    ) -> Self {
        Self {
            resolver,
            accounts,
            account_delay,
        }
    }

    /// Resolve the target address once, then reconcile each account in order
    /// and concatenate their keys.
    pub async fn provision_all(
        &self,
        accounts: &[OperatorAccount],
        name: &str,
        count_per_account: usize,
    ) -> Result<TokenPool> {
        let Some(probe) = accounts.first() else {
            return Err(Error::NoTokensAvailable);
        };

        let target = self.resolver.resolve(self.accounts.console(), probe).await?;
        info!(
            address = %target,
            accounts = accounts.len(),
            per_account = count_per_account,
            "provisioning key pool"
        );

        let mut keys = Vec::with_capacity(accounts.len() * count_per_account);
        let mut degraded = 0;
        for (i, account) in accounts.iter().enumerate() {
            if i > 0 && !self.account_delay.is_zero() {
                tokio::time::sleep(self.account_delay).await;
            }
            let result = self
                .accounts
                .provision(account, &target, name, count_per_account)
                .await?;
            if result.is_degraded() {
                degraded += 1;
            }
            keys.extend(result.keys);
        }

        if keys.is_empty() {
            return Err(Error::NoTokensAvailable);
        }
        if degraded > 0 {
            warn!(
                degraded,
                pool_size = keys.len(),
                requested = accounts.len() * count_per_account,
                "key pool is smaller than requested"
            );
        }
        info!(pool_size = keys.len(), "key pool ready");
        Ok(TokenPool::new(keys))
    }
}
