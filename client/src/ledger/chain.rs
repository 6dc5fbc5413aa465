//! Ledger client backed by the deployed mixer contract.
//!
//! Submissions go through a wallet-filled provider. Confirmation polls the
//! receipt. Subscriptions run a polling task that replays `Deposit` and
//! `Withdrawal` logs over advancing block ranges; overlapping ranges are fine
//! because the engine absorbs duplicates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::{
    network::ReceiptResponse as _,
    primitives::{Address, FixedBytes, TxHash, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    sol,
};
use anyhow::Context;
use async_trait::async_trait;
use mixer_lib::{now_millis, Amount, Digest, MixerError, Recipient, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Confirmation, LedgerClient, LedgerEvent, SubscriptionId, TxHandle};
use crate::config::ChainConfig;

// ---------------------------------------------------------------------------
// Contract bindings (inline, no ABI files needed)
// ---------------------------------------------------------------------------

sol! {
    #[sol(rpc)]
    interface IMixer {
        function deposit(bytes32 commitment) external payable;
        function withdraw(bytes32 nullifierHash, address recipient) external;

        event Deposit(bytes32 indexed commitment, uint32 leafIndex, uint256 timestamp);
        event Withdrawal(address to, bytes32 nullifierHash);
    }
}

type MixerContract = IMixer::IMixerInstance<DynProvider>;

pub struct AlloyLedger {
    provider: DynProvider,
    mixer: MixerContract,
    deploy_block: u64,
    poll_interval: Duration,
    confirmation_timeout: Duration,
    next_subscription: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
}

impl AlloyLedger {
    /// Connect a signing provider to the mixer at `config.mixer_address`.
    pub fn connect(config: &ChainConfig) -> anyhow::Result<Self> {
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .context("PRIVATE_KEY is not a valid key")?;
        let wallet_address = signer.address();

        let provider = ProviderBuilder::new()
            .wallet(signer)
            .connect_http(config.rpc_url.parse().context("RPC_URL is not a valid URL")?)
            .erased();
        let mixer = IMixer::new(config.mixer_address, provider.clone());

        info!(
            wallet = %wallet_address,
            mixer = %config.mixer_address,
            "connected to mixer contract"
        );
        Ok(Self {
            provider,
            mixer,
            deploy_block: config.deploy_block,
            poll_interval: config.poll_interval,
            confirmation_timeout: config.confirmation_timeout,
            next_subscription: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl LedgerClient for AlloyLedger {
    async fn submit_deposit(&self, commitment: Digest, amount: Amount) -> Result<TxHandle> {
        let pending = self
            .mixer
            .deposit(FixedBytes::from(commitment.0))
            .value(U256::from(amount.wei()))
            .send()
            .await
            .map_err(|e| MixerError::SubmissionFailed(e.to_string()))?;
        Ok(TxHandle(pending.tx_hash().0))
    }

    async fn submit_withdraw(&self, nullifier: Digest, recipient: Recipient) -> Result<TxHandle> {
        let pending = self
            .mixer
            .withdraw(FixedBytes::from(nullifier.0), Address::from(recipient.0))
            .send()
            .await
            .map_err(|e| MixerError::SubmissionFailed(e.to_string()))?;
        Ok(TxHandle(pending.tx_hash().0))
    }

    async fn await_confirmation(&self, handle: TxHandle) -> Result<Confirmation> {
        let hash = TxHash::from(handle.0);
        let deadline = tokio::time::Instant::now() + self.confirmation_timeout;
        loop {
            match self.provider.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    if !receipt.status() {
                        return Ok(Confirmation::Failed {
                            reason: format!("transaction {hash} reverted"),
                        });
                    }
                    // Receipts carry no timestamp; the event stream supplies
                    // the block's own.
                    return Ok(Confirmation::Confirmed {
                        block_timestamp: now_millis() / 1000,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(%hash, error = %e, "receipt lookup failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MixerError::ConfirmationTimeout {
                    waited_ms: super::millis(self.confirmation_timeout),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn subscribe(&self, events: mpsc::Sender<LedgerEvent>) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let poller = EventPoller {
            provider: self.provider.clone(),
            mixer: IMixer::new(*self.mixer.address(), self.provider.clone()),
            next_block: self.deploy_block,
            interval: self.poll_interval,
            events,
        };
        let task = tokio::spawn(poller.run());
        self.subscriptions.lock().await.insert(id, task);
        info!(subscription = id.0, from_block = self.deploy_block, "subscribed to mixer events");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(task) = self.subscriptions.lock().await.remove(&id) {
            task.abort();
            info!(subscription = id.0, "unsubscribed from mixer events");
        }
    }
}

struct EventPoller {
    provider: DynProvider,
    mixer: MixerContract,
    next_block: u64,
    interval: Duration,
    events: mpsc::Sender<LedgerEvent>,
}

impl EventPoller {
    async fn run(mut self) {
        while !self.events.is_closed() {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, from_block = self.next_block, "event poll failed");
            }
            tokio::time::sleep(self.interval).await;
        }
        debug!("event receiver closed; poller exiting");
    }

    async fn poll_once(&mut self) -> anyhow::Result<()> {
        let latest = self.provider.get_block_number().await?;
        if latest < self.next_block {
            return Ok(());
        }

        let deposits = self
            .mixer
            .Deposit_filter()
            .from_block(self.next_block)
            .to_block(latest)
            .query()
            .await?;
        let withdrawals = self
            .mixer
            .Withdrawal_filter()
            .from_block(self.next_block)
            .to_block(latest)
            .query()
            .await?;
        debug!(
            from = self.next_block,
            to = latest,
            deposits = deposits.len(),
            withdrawals = withdrawals.len(),
            "polled mixer events"
        );

        for (event, _log) in &deposits {
            let event = LedgerEvent::DepositConfirmed {
                commitment: Digest(event.commitment.0),
                block_timestamp: event.timestamp.saturating_to::<u64>(),
            };
            if self.events.send(event).await.is_err() {
                return Ok(());
            }
        }

        for (event, log) in &withdrawals {
            let recipient = match Recipient::new(event.to.0 .0) {
                Ok(recipient) => recipient,
                Err(e) => {
                    warn!(error = %e, "skipping withdrawal event with unusable recipient");
                    continue;
                }
            };
            let event = LedgerEvent::WithdrawalConfirmed {
                nullifier: Digest(event.nullifierHash.0),
                recipient,
                block_timestamp: log.block_timestamp.unwrap_or_else(|| now_millis() / 1000),
            };
            if self.events.send(event).await.is_err() {
                return Ok(());
            }
        }

        self.next_block = latest + 1;
        Ok(())
    }
}
