//! Engine configuration.
//!
//! A single value passed to constructors instead of process-wide globals.

use crate::error::Result;
use crate::types::Network;
use serde::{Deserialize, Serialize};

const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ALTERNATIVE_TRANSACTIONS: usize = 10;

/// Configuration shared by the preparer, the signer and the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Network all keys and addresses belong to.
    pub network: Network,
    /// Base URL of the backend.
    pub api_url: String,
    /// Currency amounts are displayed in, besides the input currency.
    #[serde(default = "default_primary_currency")]
    pub primary_currency: String,
    /// Confirmation target used to pick the fee rate.
    ///
    /// `None` means the fee window's fast target.
    #[serde(default)]
    pub confirmation_target: Option<u32>,
    /// How long to wait for the push step before reporting a slow push.
    #[serde(default = "default_push_timeout_secs")]
    pub push_timeout_secs: u64,
    /// Upper bound on alternative nonce sets requested per submission.
    #[serde(default = "default_max_alternative_transactions")]
    pub max_alternative_transactions: usize,
}

fn default_primary_currency() -> String {
    "BTC".to_string()
}

fn default_push_timeout_secs() -> u64 {
    DEFAULT_PUSH_TIMEOUT_SECS
}

fn default_max_alternative_transactions() -> usize {
    DEFAULT_MAX_ALTERNATIVE_TRANSACTIONS
}

impl EngineConfig {
    /// Create a configuration with defaults for everything but network and URL.
    pub fn new(network: Network, api_url: impl Into<String>) -> Self {
        Self {
            network,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            primary_currency: default_primary_currency(),
            confirmation_target: None,
            push_timeout_secs: DEFAULT_PUSH_TIMEOUT_SECS,
            max_alternative_transactions: DEFAULT_MAX_ALTERNATIVE_TRANSACTIONS,
        }
    }

    /// Parse a JSON configuration, filling in defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: EngineConfig = serde_json::from_str(json)?;
        config.api_url = config.api_url.trim_end_matches('/').to_string();
        Ok(config)
    }

    pub fn with_confirmation_target(mut self, target: u32) -> Self {
        self.confirmation_target = Some(target);
        self
    }

    pub fn with_primary_currency(mut self, currency: impl Into<String>) -> Self {
        self.primary_currency = currency.into();
        self
    }
}
