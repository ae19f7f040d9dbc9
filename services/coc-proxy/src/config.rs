//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The shared account password is loaded from the API_PASSWORD env var or
//! `accounts.password_file`, never stored in the TOML directly. The process
//! role comes from WORKER_ID: `0` provisions, anything else attaches to the
//! shared rotator state.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coc_keys::{AddressResolver, OperatorAccount, RetryPolicy, TokenRotator};
use common::Secret;
use serde::Deserialize;

use crate::service::Role;

const PASSWORD_ENV: &str = "API_PASSWORD";
const WORKER_ID_ENV: &str = "WORKER_ID";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub console: ConsoleConfig,
    pub accounts: AccountsConfig,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub rotator: RotatorConfig,
    /// From WORKER_ID; 0 is the initializer
    #[serde(skip)]
    pub worker_id: u32,
}

/// Developer console and provisioning settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Name every managed key carries
    pub key_name: String,
    pub keys_per_account: usize,
    /// Pause between accounts during provisioning
    pub account_delay_ms: u64,
    pub retry_base_delay_ms: u64,
    pub address_source: AddressSource,
    pub lookup_url: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            base_url: coc_console::DEFAULT_CONSOLE_URL.to_owned(),
            timeout_secs: 30,
            key_name: "coc-proxy".to_owned(),
            keys_per_account: coc_console::MAX_KEYS_PER_ACCOUNT,
            account_delay_ms: 1500,
            retry_base_delay_ms: 500,
            address_source: AddressSource::Session,
            lookup_url: coc_console::DEFAULT_LOOKUP_URL.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    /// Read the address from the login token claims
    Session,
    /// Ask `lookup_url`
    Lookup,
}

/// Operator account generation
#[derive(Debug, Deserialize)]
pub struct AccountsConfig {
    /// Email pattern with `{x}` standing for the index
    pub email_template: String,
    pub min_index: u32,
    pub max_index: u32,
    /// Path to a file containing the shared password (alternative to API_PASSWORD)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RotatorConfig {
    pub mode: RotatorMode,
    pub state_dir: PathBuf,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            mode: RotatorMode::Memory,
            state_dir: std::env::temp_dir().join("coc-key-proxy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotatorMode {
    Memory,
    Shared,
}

fn default_upstream_url() -> String {
    "https://api.clashofclans.com".to_owned()
}

fn default_timeout() -> u64 {
    15
}

fn default_max_connections() -> usize {
    1000
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order:
    /// 1. API_PASSWORD env var
    /// 2. accounts.password_file path from config
    ///
    /// The password is only required in processes that provision.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.worker_id = match std::env::var(WORKER_ID_ENV) {
            Ok(raw) => raw.trim().parse().map_err(|e| {
                common::Error::Config(format!("{WORKER_ID_ENV} must be a non-negative integer: {e}"))
            })?,
            Err(_) => 0,
        };

        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            config.accounts.password = Some(Secret::new(password));
        } else if let Some(ref file) = config.accounts.password_file {
            let password = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read password_file {}: {e}",
                    file.display()
                ))
            })?;
            let password = password.trim().to_owned();
            if !password.is_empty() {
                config.accounts.password = Some(Secret::new(password));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("proxy.upstream_url", &self.proxy.upstream_url)?;
        require_http_url("console.base_url", &self.console.base_url)?;
        if self.console.address_source == AddressSource::Lookup {
            require_http_url("console.lookup_url", &self.console.lookup_url)?;
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "proxy.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.console.timeout_secs == 0 {
            return Err(common::Error::Config(
                "console.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let cap = coc_console::MAX_KEYS_PER_ACCOUNT;
        if !(1..=cap).contains(&self.console.keys_per_account) {
            return Err(common::Error::Config(format!(
                "keys_per_account must be between 1 and {cap}, got {}",
                self.console.keys_per_account
            )));
        }
        if self.console.key_name.trim().is_empty() {
            return Err(common::Error::Config("key_name must not be empty".into()));
        }

        if !self
            .accounts
            .email_template
            .contains(coc_keys::account::INDEX_PLACEHOLDER)
        {
            return Err(common::Error::Config(format!(
                "email_template must contain {}, got: {}",
                coc_keys::account::INDEX_PLACEHOLDER,
                self.accounts.email_template
            )));
        }
        if self.accounts.min_index > self.accounts.max_index {
            return Err(common::Error::Config(format!(
                "min_index ({}) must not exceed max_index ({})",
                self.accounts.min_index, self.accounts.max_index
            )));
        }

        if !self.is_initializer() && self.rotator.mode != RotatorMode::Shared {
            return Err(common::Error::Config(format!(
                "{WORKER_ID_ENV}={} requires rotator.mode = \"shared\"",
                self.worker_id
            )));
        }
        if self.is_initializer() && self.accounts.password.is_none() {
            return Err(common::Error::Missing(
                "account password (API_PASSWORD or accounts.password_file)",
            ));
        }
        Ok(())
    }

    /// Whether this process provisions the pool.
    pub fn is_initializer(&self) -> bool {
        self.worker_id == 0
    }

    pub fn role(&self) -> Role {
        if self.is_initializer() {
            Role::Initializer
        } else {
            Role::Worker
        }
    }

    /// Number of operator accounts the index range covers.
    pub fn account_count(&self) -> u64 {
        u64::from(self.accounts.max_index) - u64::from(self.accounts.min_index) + 1
    }

    /// Expand the account template into concrete logins.
    pub fn operator_accounts(&self) -> common::Result<Vec<OperatorAccount>> {
        let password = self.accounts.password.as_ref().ok_or(common::Error::Missing(
            "account password (API_PASSWORD or accounts.password_file)",
        ))?;
        Ok(coc_keys::generate_accounts(
            &self.accounts.email_template,
            self.accounts.min_index..=self.accounts.max_index,
            password,
        ))
    }

    pub fn address_resolver(&self) -> AddressResolver {
        match self.console.address_source {
            AddressSource::Session => AddressResolver::SessionToken,
            AddressSource::Lookup => AddressResolver::Lookup {
                url: self.console.lookup_url.clone(),
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.console.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn build_rotator(&self) -> TokenRotator {
        match self.rotator.mode {
            RotatorMode::Memory => TokenRotator::in_memory(),
            RotatorMode::Shared => TokenRotator::shared(self.rotator.state_dir.clone()),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("coc-key-proxy.toml")
    }
}
