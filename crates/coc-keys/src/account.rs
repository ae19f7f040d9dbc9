//! Operator accounts used to log in to the developer console

use std::fmt;
use std::ops::RangeInclusive;

use common::Secret;

/// Placeholder replaced by the account index in an email template.
pub const INDEX_PLACEHOLDER: &str = "{x}";

/// A developer console login. Never changes after startup.
#[derive(Clone)]
pub struct OperatorAccount {
    pub email: String,
    pub password: Secret<String>,
}

impl OperatorAccount {
    pub fn new(email: impl Into<String>, password: impl Into<Secret<String>>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for OperatorAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorAccount")
            .field("email", &self.email)
            .field("password", &self.password)
            .finish()
    }
}

/// Expand an email template over an inclusive index range.
///
/// Every `{x}` in `template` is replaced by the index; all accounts share
/// `password`. Accounts come back in ascending index order.
pub fn generate_accounts(
    template: &str,
    indices: RangeInclusive<u32>,
    password: &Secret<String>,
) -> Vec<OperatorAccount> {
    indices
        .map(|i| OperatorAccount {
            email: template.replace(INDEX_PLACEHOLDER, &i.to_string()),
            password: password.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_template_in_index_order() {
        let password = Secret::from("pw");
        let accounts = generate_accounts("ops+{x}@example.com", 3..=5, &password);
        let emails: Vec<_> = accounts.iter().map(|a| a.email.as_str()).collect();
        assert_eq!(
            emails,
            ["ops+3@example.com", "ops+4@example.com", "ops+5@example.com"]
        );
        assert!(accounts.iter().all(|a| a.password.expose() == "pw"));
    }

    #[test]
    fn single_index_range_yields_one_account() {
        let accounts = generate_accounts("a{x}@example.com", 7..=7, &Secret::from("pw"));
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].email, "a7@example.com");
    }

    #[test]
    fn debug_hides_password() {
        let account = OperatorAccount::new("ops@example.com", "hunter2");
        let debug = format!("{account:?}");
        assert!(debug.contains("ops@example.com"));
        assert!(!debug.contains("hunter2"));
    }
}
