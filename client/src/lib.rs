//! Mixer client: record store, ledger adapters and the reconciliation engine
//! that keeps local deposit and withdrawal records in step with the ledger.

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod logging;
pub mod store;

pub use aggregate::{DepositView, LedgerSnapshot, WithdrawalView};
pub use config::{ChainConfig, MixerConfig};
pub use engine::{EngineConfig, Mixer};
pub use ledger::{
    AlloyLedger, Confirmation, LedgerClient, LedgerEvent, MemoryLedger, SubscriptionId, TxHandle,
};
pub use store::{RecordStore, StoreKey};
