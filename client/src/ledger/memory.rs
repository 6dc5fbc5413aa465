//! In-process ledger simulation.
//!
//! Behaves like the mixer contract from the client's point of view: accepts
//! deposits, refuses a nullifier it has already seen, mines submissions into
//! blocks and pushes `Deposit` / `Withdrawal` events to subscribers. Knobs
//! let tests reject submissions, revert them, hold them unmined or deliver
//! every event twice.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use mixer_lib::{Amount, Digest, MixerError, Recipient, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use super::{Confirmation, LedgerClient, LedgerEvent, SubscriptionId, TxHandle};

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const BLOCK_TIME_SECS: u64 = 12;

#[derive(Clone, Debug)]
enum Call {
    Deposit { commitment: Digest },
    Withdraw { nullifier: Digest, recipient: Recipient },
}

#[derive(Clone, Debug)]
struct Tx {
    call: Call,
    outcome: Option<Confirmation>,
}

#[derive(Default)]
struct Inner {
    next_tx: u64,
    next_subscription: u64,
    block_timestamp: u64,
    txs: HashMap<TxHandle, Tx>,
    subscribers: HashMap<SubscriptionId, mpsc::Sender<LedgerEvent>>,
    nullifiers: HashSet<Digest>,
    deposits: Vec<(Digest, Amount)>,
    withdrawals: Vec<(Digest, Recipient)>,
    reject_submissions: bool,
    revert_transactions: bool,
    duplicate_delivery: bool,
}

pub struct MemoryLedger {
    inner: Mutex<Inner>,
    auto_mine: bool,
    confirmation_timeout: Duration,
    blocks: watch::Sender<u64>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    /// Every awaited transaction is mined on the spot.
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Transactions stay pending until [`MemoryLedger::mine_pending`].
    pub fn manual() -> Self {
        Self::build(false)
    }

    fn build(auto_mine: bool) -> Self {
        let (blocks, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                block_timestamp: GENESIS_TIMESTAMP,
                ..Inner::default()
            }),
            auto_mine,
            confirmation_timeout: Duration::from_secs(5),
            blocks,
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub async fn set_reject_submissions(&self, reject: bool) {
        self.inner.lock().await.reject_submissions = reject;
    }

    pub async fn set_revert_transactions(&self, revert: bool) {
        self.inner.lock().await.revert_transactions = revert;
    }

    pub async fn set_duplicate_delivery(&self, duplicate: bool) {
        self.inner.lock().await.duplicate_delivery = duplicate;
    }

    /// Deposits the ledger has accepted, in submission order.
    pub async fn deposits(&self) -> Vec<(Digest, Amount)> {
        self.inner.lock().await.deposits.clone()
    }

    /// Withdrawals the ledger has accepted, in submission order.
    pub async fn withdrawals(&self) -> Vec<(Digest, Recipient)> {
        self.inner.lock().await.withdrawals.clone()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// Push an event as if another session had caused it.
    pub async fn emit(&self, event: LedgerEvent) {
        let (subscribers, duplicate) = {
            let inner = self.inner.lock().await;
            (
                inner.subscribers.values().cloned().collect::<Vec<_>>(),
                inner.duplicate_delivery,
            )
        };
        let copies = if duplicate { 2 } else { 1 };
        for subscriber in subscribers {
            for _ in 0..copies {
                // A closed subscriber just misses the event.
                let _ = subscriber.send(event.clone()).await;
            }
        }
    }

    /// Mine every pending transaction into one new block.
    pub async fn mine_pending(&self) -> usize {
        let events = {
            let mut inner = self.inner.lock().await;
            inner.block_timestamp += BLOCK_TIME_SECS;
            let block_timestamp = inner.block_timestamp;
            let revert = inner.revert_transactions;

            let mut events = Vec::new();
            let mut reverted = Vec::new();
            for tx in inner.txs.values_mut().filter(|tx| tx.outcome.is_none()) {
                if revert {
                    tx.outcome = Some(Confirmation::Failed {
                        reason: "execution reverted".into(),
                    });
                    if let Call::Withdraw { nullifier, .. } = &tx.call {
                        reverted.push(*nullifier);
                    }
                    continue;
                }
                tx.outcome = Some(Confirmation::Confirmed { block_timestamp });
                events.push(match &tx.call {
                    Call::Deposit { commitment } => LedgerEvent::DepositConfirmed {
                        commitment: *commitment,
                        block_timestamp,
                    },
                    Call::Withdraw {
                        nullifier,
                        recipient,
                    } => LedgerEvent::WithdrawalConfirmed {
                        nullifier: *nullifier,
                        recipient: *recipient,
                        block_timestamp,
                    },
                });
            }
            // A reverted withdrawal leaves its nullifier unspent.
            for nullifier in reverted {
                inner.nullifiers.remove(&nullifier);
            }
            events
        };

        let mined = events.len();
        for event in events {
            self.emit(event).await;
        }
        self.blocks.send_modify(|height| *height += 1);
        debug!(mined, "mined block");
        mined
    }

    async fn submit(&self, call: Call) -> Result<TxHandle> {
        let mut inner = self.inner.lock().await;
        if inner.reject_submissions {
            return Err(MixerError::SubmissionFailed("rejected by ledger".into()));
        }
        match &call {
            Call::Deposit { .. } => {}
            Call::Withdraw { nullifier, .. } => {
                if !inner.nullifiers.insert(*nullifier) {
                    return Err(MixerError::SubmissionFailed(format!(
                        "nullifier {nullifier} already spent"
                    )));
                }
            }
        }
        inner.next_tx += 1;
        let mut hash = [0u8; 32];
        hash[24..].copy_from_slice(&inner.next_tx.to_be_bytes());
        let handle = TxHandle(hash);
        inner.txs.insert(handle, Tx { call, outcome: None });
        Ok(handle)
    }

    async fn outcome(&self, handle: &TxHandle) -> Result<Option<Confirmation>> {
        let inner = self.inner.lock().await;
        let tx = inner
            .txs
            .get(handle)
            .ok_or_else(|| MixerError::InvalidInput("unknown transaction".into()))?;
        Ok(tx.outcome.clone())
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn submit_deposit(&self, commitment: Digest, amount: Amount) -> Result<TxHandle> {
        let handle = self.submit(Call::Deposit { commitment }).await?;
        self.inner.lock().await.deposits.push((commitment, amount));
        Ok(handle)
    }

    async fn submit_withdraw(&self, nullifier: Digest, recipient: Recipient) -> Result<TxHandle> {
        let handle = self
            .submit(Call::Withdraw {
                nullifier,
                recipient,
            })
            .await?;
        self.inner.lock().await.withdrawals.push((nullifier, recipient));
        Ok(handle)
    }

    async fn await_confirmation(&self, handle: TxHandle) -> Result<Confirmation> {
        let mut blocks = self.blocks.subscribe();
        if self.auto_mine && self.outcome(&handle).await?.is_none() {
            self.mine_pending().await;
        }
        let deadline = tokio::time::Instant::now() + self.confirmation_timeout;
        loop {
            if let Some(outcome) = self.outcome(&handle).await? {
                return Ok(outcome);
            }
            match tokio::time::timeout_at(deadline, blocks.changed()).await {
                Ok(Ok(())) => continue,
                _ => {
                    return Err(MixerError::ConfirmationTimeout {
                        waited_ms: super::millis(self.confirmation_timeout),
                    })
                }
            }
        }
    }

    async fn subscribe(&self, events: mpsc::Sender<LedgerEvent>) -> Result<SubscriptionId> {
        let mut inner = self.inner.lock().await;
        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);
        inner.subscribers.insert(id, events);
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().await.subscribers.remove(&id);
    }
}
