//! Per-account key reconciliation
//!
//! One account at a time: log in, keep the keys that already carry the right
//! name and address, revoke everything else, then create keys until the
//! requested count is reached or the console's per-account cap stops us.
//!
//! Create failures that look transient (transport error, non-2xx, a body with
//! no secret) are retried with linear backoff. There is no attempt ceiling;
//! after each failure the account is re-listed and the loop stops once the
//! account holds as many keys as the console allows. The re-listing also
//! picks up keys whose create went through but whose answer was lost.

use std::time::Duration;

use coc_console::{ConsoleClient, CreateKeyRequest, MAX_KEYS_PER_ACCOUNT, RemoteKey};
use tracing::{debug, info, warn};

use crate::account::OperatorAccount;
use crate::error::{Error, Result};
use crate::resolver::TargetAddress;

/// Backoff and cap settings for the create loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt `n` waits `n * base_delay` before retrying.
    pub base_delay: Duration,
    /// Consecutive failures after which each retry is logged as a warning.
    pub warn_after: u32,
    /// Keys the console lets one account hold.
    pub key_cap: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            warn_after: 2,
            key_cap: MAX_KEYS_PER_ACCOUNT,
        }
    }
}

/// Outcome of reconciling one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKeys {
    pub email: String,
    /// Secrets in existing-then-created order.
    pub keys: Vec<String>,
    pub requested: usize,
    pub revoked: usize,
    pub created: usize,
}

impl AccountKeys {
    /// Fewer keys than requested, but at least one.
    pub fn is_degraded(&self) -> bool {
        !self.keys.is_empty() && self.keys.len() < self.requested
    }
}

/// Drives the console for a single account.
#[derive(Debug, Clone)]
pub struct AccountProvisioner {
    console: ConsoleClient,
    policy: RetryPolicy,
}

impl AccountProvisioner {
    pub fn new(console: ConsoleClient, policy: RetryPolicy) -> Self {
        Self { console, policy }
    }

    pub fn console(&self) -> &ConsoleClient {
        &self.console
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Reconcile `account` so it holds `count` keys named `name` bound to
    /// `target`.
    ///
    /// Returns the usable secrets. A result with fewer than `count` keys is a
    /// success and is logged as degraded; an empty one is
    /// `ProvisioningExhausted`.
    pub async fn provision(
        &self,
        account: &OperatorAccount,
        target: &TargetAddress,
        name: &str,
        count: usize,
    ) -> Result<AccountKeys> {
        let email = account.email.as_str();
        let session = self
            .console
            .login(email, account.password.expose())
            .await?;

        let wanted = |key: &RemoteKey| key.name == name && key.is_bound_to(target.as_str());

        let listed = session.list_keys().await?;
        let (keep, stale): (Vec<RemoteKey>, Vec<RemoteKey>) = listed.into_iter().partition(wanted);
        debug!(
            email,
            matching = keep.len(),
            stale = stale.len(),
            "listed existing keys"
        );

        let surplus = keep.len().saturating_sub(count);
        if surplus > 0 {
            debug!(email, surplus, "ignoring surplus matching keys");
        }
        let mut held = keep.len() + stale.len();
        let mut keys: Vec<String> = keep.into_iter().take(count).map(|key| key.key).collect();

        let mut revoked = 0;
        for key in &stale {
            match session.revoke_key(&key.id).await {
                Ok(()) => {
                    revoked += 1;
                    held -= 1;
                }
                Err(e) => {
                    warn!(email, key_id = %key.id, error = %e, "failed to revoke stale key, leaving it");
                }
            }
        }

        let mut created = 0;
        let mut failures: u32 = 0;
        while keys.len() < count {
            let request = CreateKeyRequest::new(name, target.as_str());
            match session.create_key(&request).await {
                Ok(secret) => {
                    keys.push(secret);
                    created += 1;
                    held += 1;
                    failures = 0;
                }
                Err(coc_console::Error::TooManyKeys(detail)) => {
                    warn!(email, detail = %detail, "console refused more keys for account");
                    break;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= self.policy.warn_after {
                        warn!(email, failures, error = %e, "key creation keeps failing, retrying");
                    } else {
                        debug!(email, failures, error = %e, "key creation failed, retrying");
                    }

                    match session.list_keys().await {
                        Ok(listed) => {
                            held = listed.len();
                            for key in listed {
                                if keys.len() < count && wanted(&key) && !keys.contains(&key.key) {
                                    debug!(email, key_id = %key.id, "found key from an unanswered create");
                                    keys.push(key.key);
                                    created += 1;
                                }
                            }
                        }
                        Err(list_err) if list_err.is_transient() => {
                            warn!(email, error = %list_err, "re-listing keys failed, keeping previous count");
                        }
                        Err(list_err) => return Err(list_err.into()),
                    }
                    if keys.len() >= count {
                        break;
                    }
                    if held >= self.policy.key_cap {
                        warn!(email, held, cap = self.policy.key_cap, "account is at its key cap");
                        break;
                    }
                    tokio::time::sleep(self.policy.base_delay * failures).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if keys.is_empty() {
            return Err(Error::ProvisioningExhausted {
                email: email.to_owned(),
                held,
            });
        }

        let result = AccountKeys {
            email: email.to_owned(),
            keys,
            requested: count,
            revoked,
            created,
        };
        if result.is_degraded() {
            warn!(
                email,
                requested = count,
                obtained = result.keys.len(),
                "account provisioned with fewer keys than requested"
            );
        } else {
            info!(email, keys = result.keys.len(), created, revoked, "account provisioned");
        }
        Ok(result)
    }
}
