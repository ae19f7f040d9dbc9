//! Target address resolution
//!
//! Every key in one provisioning run is bound to the same address. It is
//! worked out once per run, either from the console's own view of the login
//! (session token claims) or from an external lookup service.

use std::fmt;
use std::net::IpAddr;

use coc_console::ConsoleClient;
use tracing::debug;

use crate::account::OperatorAccount;
use crate::error::{Error, Result};

/// The address keys are bound to, in the textual form the console lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress(String);

impl TargetAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for TargetAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the target address comes from. One strategy per provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressResolver {
    /// Log in as the probe account and read the client CIDR from the token.
    SessionToken,
    /// Query an external service answering `{"ip": "..."}`.
    Lookup { url: String },
}

impl AddressResolver {
    /// Resolve the target address.
    ///
    /// `probe` is only used by `SessionToken`. A rejected probe login is
    /// `InvalidCredentials`; anything else that goes wrong is
    /// `AddressUnavailable`.
    pub async fn resolve(
        &self,
        console: &ConsoleClient,
        probe: &OperatorAccount,
    ) -> Result<TargetAddress> {
        let ip = match self {
            AddressResolver::SessionToken => {
                let session = console
                    .login(&probe.email, probe.password.expose())
                    .await
                    .map_err(|e| match e {
                        coc_console::Error::InvalidCredentials(email) => {
                            Error::InvalidCredentials(email)
                        }
                        other => Error::AddressUnavailable(format!("probe login failed: {other}")),
                    })?;
                coc_console::address_from_session_token(session.temporary_token())?
            }
            AddressResolver::Lookup { url } => {
                let client = reqwest::Client::builder()
                    .timeout(console.timeout())
                    .build()
                    .map_err(|e| Error::AddressUnavailable(format!("building lookup client: {e}")))?;
                coc_console::lookup_public_address(&client, url).await?
            }
        };
        debug!(address = %ip, strategy = self.label(), "resolved target address");
        Ok(ip.into())
    }

    pub fn label(&self) -> &'static str {
        match self {
            AddressResolver::SessionToken => "session_token",
            AddressResolver::Lookup { .. } => "lookup",
        }
    }
}
