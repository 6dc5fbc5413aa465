//! Call surface to the external mixer ledger.
//!
//! `LedgerClient` is the seam the engine talks through: submissions return a
//! transaction handle as soon as the ledger accepts them, confirmation is a
//! separate wait, and confirmed events are pushed into a channel.

use std::time::Duration;

use async_trait::async_trait;
use mixer_lib::{Amount, Digest, Recipient, Result};
use tokio::sync::mpsc;

mod chain;
mod memory;

pub use chain::AlloyLedger;
pub use memory::MemoryLedger;

/// Transaction hash of an accepted submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxHandle(pub [u8; 32]);

impl From<Digest> for TxHandle {
    fn from(hash: Digest) -> Self {
        TxHandle(hash.0)
    }
}

impl From<TxHandle> for Digest {
    fn from(handle: TxHandle) -> Self {
        Digest(handle.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Outcome of waiting on a submitted transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// Included; `block_timestamp` in unix seconds.
    Confirmed { block_timestamp: u64 },
    /// Included but reverted, or dropped.
    Failed { reason: String },
}

/// A confirmation observed on the ledger. Delivery is at-least-once and
/// unordered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    DepositConfirmed {
        commitment: Digest,
        block_timestamp: u64,
    },
    WithdrawalConfirmed {
        nullifier: Digest,
        recipient: Recipient,
        block_timestamp: u64,
    },
}

#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    async fn submit_deposit(&self, commitment: Digest, amount: Amount) -> Result<TxHandle>;

    async fn submit_withdraw(&self, nullifier: Digest, recipient: Recipient) -> Result<TxHandle>;

    /// Wait until the transaction is included. Gives up with
    /// `ConfirmationTimeout` after the client's own bound.
    async fn await_confirmation(&self, handle: TxHandle) -> Result<Confirmation>;

    /// Start delivering confirmed events into `events`.
    async fn subscribe(&self, events: mpsc::Sender<LedgerEvent>) -> Result<SubscriptionId>;

    /// Stop a subscription. Unknown or already-released ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);
}

/// Whole milliseconds in `bound`, saturating.
fn millis(bound: Duration) -> u64 {
    u64::try_from(bound.as_millis()).unwrap_or(u64::MAX)
}
