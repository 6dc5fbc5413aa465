//! Environment configuration.
//!
//! Required env vars (from .env):
//!   RPC_URL                   - JSON-RPC endpoint
//!   PRIVATE_KEY               - Funded wallet private key (signs deposits/withdrawals)
//!   MIXER_ADDRESS             - Deployed mixer contract
//!   STORE_KEY                 - 32-byte hex key sealing secrets at rest
//!
//! Optional env vars:
//!   DEPLOY_BLOCK              - Block the mixer was deployed at (default: 0)
//!   STORE_PATH                - Record store directory (default: fixtures/mixer-db)
//!   POLL_INTERVAL_MS          - Receipt/event polling period (default: 2000)
//!   CONFIRMATION_TIMEOUT_SECS - Give up waiting on a receipt after this (default: 120)
//!   DEPOSIT_UNIT              - Amount assumed for deposits seen from elsewhere (default: 1.0)
//!   COMMAND_BUFFER            - Engine channel capacity (default: 256)

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{ensure, Context, Result};
use mixer_lib::Amount;

use crate::engine::EngineConfig;
use crate::store::StoreKey;

#[derive(Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub private_key: String,
    pub mixer_address: Address,
    pub deploy_block: u64,
    pub poll_interval: Duration,
    pub confirmation_timeout: Duration,
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("rpc_url", &self.rpc_url)
            .field("private_key", &"..")
            .field("mixer_address", &self.mixer_address)
            .field("deploy_block", &self.deploy_block)
            .field("poll_interval", &self.poll_interval)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MixerConfig {
    pub chain: ChainConfig,
    pub store_path: PathBuf,
    pub store_key: StoreKey,
    pub engine: EngineConfig,
}

impl MixerConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| lookup(key).with_context(|| format!("{key} not set"));
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let rpc_url = required("RPC_URL")?;
        let private_key = required("PRIVATE_KEY")?;
        let mixer_address: Address = required("MIXER_ADDRESS")?
            .parse()
            .context("MIXER_ADDRESS is not an address")?;
        let store_key: StoreKey = required("STORE_KEY")?
            .parse()
            .context("STORE_KEY must be 32 bytes of hex")?;

        let deploy_block: u64 = or_default("DEPLOY_BLOCK", "0")
            .parse()
            .context("DEPLOY_BLOCK must be a number")?;
        let poll_interval_ms: u64 = or_default("POLL_INTERVAL_MS", "2000")
            .parse()
            .context("POLL_INTERVAL_MS must be a number")?;
        let timeout_secs: u64 = or_default("CONFIRMATION_TIMEOUT_SECS", "120")
            .parse()
            .context("CONFIRMATION_TIMEOUT_SECS must be a number")?;
        let deposit_unit = Amount::parse_positive(&or_default("DEPOSIT_UNIT", "1.0"))
            .context("DEPOSIT_UNIT must be a positive amount")?;
        let command_buffer: usize = or_default("COMMAND_BUFFER", "256")
            .parse()
            .context("COMMAND_BUFFER must be a number")?;

        ensure!(poll_interval_ms > 0, "POLL_INTERVAL_MS must be positive");
        ensure!(command_buffer > 0, "COMMAND_BUFFER must be positive");

        Ok(Self {
            chain: ChainConfig {
                rpc_url,
                private_key,
                mixer_address,
                deploy_block,
                poll_interval: Duration::from_millis(poll_interval_ms),
                confirmation_timeout: Duration::from_secs(timeout_secs),
            },
            store_path: PathBuf::from(or_default("STORE_PATH", "fixtures/mixer-db")),
            store_key,
            engine: EngineConfig {
                deposit_unit,
                command_buffer,
            },
        })
    }
}
