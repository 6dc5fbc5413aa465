//! Reconciliation engine.
//!
//! A single actor task owns every store mutation. User operations and ledger
//! events both reach it as messages; submissions and confirmation waits run in
//! the caller's task so events keep flowing while a transaction is in flight.
//!
//! Commitment lifecycle: `Pending -[deposit confirmed]-> Confirmed
//! -[withdrawal confirmed]-> Withdrawn`. The secret is erased on the second
//! edge. Duplicate and out-of-order events are absorbed.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use mixer_lib::{
    now_millis, nullifier_of, Amount, CommitmentRecord, CommitmentStatus, Digest, MixerError,
    Recipient, Result, Secret, WithdrawalRecord, WithdrawalStatus,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::{self, LedgerSnapshot};
use crate::ledger::{Confirmation, LedgerClient, LedgerEvent, SubscriptionId, TxHandle};
use crate::store::RecordStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Amount assumed for deposits and withdrawals seen only on the ledger.
    pub deposit_unit: Amount,
    /// Capacity of the command and event channels.
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deposit_unit: Amount::ether(1),
            command_buffer: 256,
        }
    }
}

// =============================================================================
//                                ACTOR
// =============================================================================

type Reply<T> = oneshot::Sender<Result<T>>;

/// A pending deposit claimed for submission.
#[derive(Debug, PartialEq, Eq)]
struct DepositClaim {
    amount: Amount,
    /// Transaction already accepted by the ledger; wait on it instead of
    /// submitting again.
    earlier: Option<TxHandle>,
}

/// What the actor hands back when it lets a withdrawal go ahead.
struct WithdrawalTicket {
    nullifier: Digest,
    recipient: Recipient,
    earlier: Option<TxHandle>,
}

/// Record whose accepted transaction is being tracked.
#[derive(Clone, Copy, Debug)]
enum Submission {
    Deposit(Digest),
    Withdrawal(Digest),
}

enum Command {
    /// Persist a new local deposit and hold its commitment in flight.
    RecordDeposit {
        record: CommitmentRecord,
        reply: Reply<()>,
    },
    /// Claim a still-pending deposit for resubmission. `None` when it no
    /// longer needs one.
    ClaimDeposit {
        commitment: Digest,
        reply: Reply<Option<DepositClaim>>,
    },
    BeginWithdrawal {
        commitment: Digest,
        reply: Reply<WithdrawalTicket>,
    },
    /// Persist the transaction accepted for a submission, or clear it once
    /// the ledger has failed it.
    Track {
        submission: Submission,
        tx: Option<TxHandle>,
        reply: Reply<()>,
    },
    /// Release an in-flight claim.
    Settle { digest: Digest },
    Apply {
        event: LedgerEvent,
        reply: Reply<()>,
    },
    Shutdown,
}

struct Reconciler {
    store: Arc<RecordStore>,
    deposit_unit: Amount,
    in_flight: HashSet<Digest>,
    snapshots: watch::Sender<Arc<LedgerSnapshot>>,
}

impl Reconciler {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<LedgerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                Some(event) = events.recv() => {
                    if let Err(e) = self.apply(event) {
                        warn!(error = %e, "failed to apply ledger event");
                    }
                    self.publish();
                }
            }
        }
        debug!(in_flight = self.in_flight.len(), "reconciler loop exited");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RecordDeposit { record, reply } => {
                let _ = reply.send(self.record_deposit(record));
                self.publish();
            }
            Command::ClaimDeposit { commitment, reply } => {
                let _ = reply.send(self.claim_deposit(commitment));
            }
            Command::BeginWithdrawal { commitment, reply } => {
                let _ = reply.send(self.begin_withdrawal(commitment));
                self.publish();
            }
            Command::Track {
                submission,
                tx,
                reply,
            } => {
                let _ = reply.send(self.track(submission, tx));
            }
            Command::Settle { digest } => {
                self.in_flight.remove(&digest);
            }
            Command::Apply { event, reply } => {
                let _ = reply.send(self.apply(event));
                self.publish();
            }
            Command::Shutdown => {}
        }
    }

    fn publish(&self) {
        match aggregate::snapshot(&self.store) {
            Ok(snapshot) => {
                self.snapshots.send_replace(Arc::new(snapshot));
            }
            Err(e) => warn!(error = %e, "failed to refresh snapshot"),
        }
    }

    fn record_deposit(&mut self, record: CommitmentRecord) -> Result<()> {
        let commitment = record.commitment;
        if self.store.get(&commitment)?.is_some() {
            return Err(MixerError::InFlight(commitment));
        }
        self.store.put(&record)?;
        self.in_flight.insert(commitment);
        Ok(())
    }

    fn claim_deposit(&mut self, commitment: Digest) -> Result<Option<DepositClaim>> {
        let record = self
            .store
            .get(&commitment)?
            .ok_or(MixerError::UnknownCommitment(commitment))?;
        if record.status != CommitmentStatus::Pending {
            return Ok(None);
        }
        if !self.in_flight.insert(commitment) {
            return Err(MixerError::InFlight(commitment));
        }
        Ok(Some(DepositClaim {
            amount: record.amount,
            earlier: record.tx_hash.map(TxHandle::from),
        }))
    }

    fn begin_withdrawal(&mut self, commitment: Digest) -> Result<WithdrawalTicket> {
        let record = self
            .store
            .get(&commitment)?
            .ok_or(MixerError::UnknownCommitment(commitment))?;
        match record.status {
            CommitmentStatus::Pending => return Err(MixerError::NotYetConfirmed(commitment)),
            CommitmentStatus::Withdrawn => return Err(MixerError::UnknownCommitment(commitment)),
            CommitmentStatus::Confirmed => {}
        }
        let (Some(secret), Some(recipient)) = (record.secret.as_ref(), record.recipient) else {
            return Err(MixerError::UnknownCommitment(commitment));
        };

        let nullifier = nullifier_of(secret, &recipient);
        if self.in_flight.contains(&nullifier) {
            return Err(MixerError::InFlight(nullifier));
        }

        let pending = WithdrawalRecord::pending(nullifier, commitment, recipient, record.amount, now_millis());
        let mut earlier = None;
        if !self.store.insert_withdrawal_if_absent(&pending)? {
            let existing = self.store.get_withdrawal(&nullifier)?;
            if let Some(existing) = existing {
                if existing.status == WithdrawalStatus::Confirmed {
                    // Spent on the ledger already; finish the bookkeeping instead.
                    self.retire_commitment(&commitment)?;
                    return Err(MixerError::UnknownCommitment(commitment));
                }
                earlier = existing.tx_hash.map(TxHandle::from);
            }
            debug!(%nullifier, resuming = earlier.is_some(), "reusing pending withdrawal record");
        }

        self.in_flight.insert(nullifier);
        Ok(WithdrawalTicket {
            nullifier,
            recipient,
            earlier,
        })
    }

    fn track(&mut self, submission: Submission, tx: Option<TxHandle>) -> Result<()> {
        let tx_hash = tx.map(Digest::from);
        match submission {
            Submission::Deposit(commitment) => self.store.set_deposit_tx(&commitment, tx_hash),
            Submission::Withdrawal(nullifier) => self.store.set_withdrawal_tx(&nullifier, tx_hash),
        }
    }

    fn apply(&mut self, event: LedgerEvent) -> Result<()> {
        match event {
            LedgerEvent::DepositConfirmed {
                commitment,
                block_timestamp,
            } => self.deposit_confirmed(commitment, block_timestamp),
            LedgerEvent::WithdrawalConfirmed {
                nullifier,
                recipient,
                block_timestamp,
            } => self.withdrawal_confirmed(nullifier, recipient, block_timestamp),
        }
    }

    fn deposit_confirmed(&mut self, commitment: Digest, block_timestamp: u64) -> Result<()> {
        match self.store.get(&commitment)? {
            Some(record) if record.status == CommitmentStatus::Pending => {
                self.store.update_status(&commitment, CommitmentStatus::Confirmed)?;
                info!(%commitment, "deposit confirmed");
            }
            Some(record) => {
                debug!(%commitment, status = record.status.as_str(), "deposit confirmation already applied");
            }
            None => {
                let record = CommitmentRecord::observed(
                    commitment,
                    self.deposit_unit,
                    block_timestamp.saturating_mul(1000),
                );
                self.store.put(&record)?;
                info!(%commitment, "recorded deposit observed on ledger");
            }
        }
        Ok(())
    }

    fn withdrawal_confirmed(
        &mut self,
        nullifier: Digest,
        recipient: Recipient,
        block_timestamp: u64,
    ) -> Result<()> {
        let confirmed_at = block_timestamp.saturating_mul(1000);
        let Some(record) = self.store.get_withdrawal(&nullifier)? else {
            let record = WithdrawalRecord::detached(nullifier, recipient, self.deposit_unit, confirmed_at);
            self.store.put_withdrawal(&record)?;
            info!(%nullifier, "recorded withdrawal observed on ledger");
            return Ok(());
        };

        if record.status == WithdrawalStatus::Pending {
            self.store.confirm_withdrawal(&nullifier, confirmed_at)?;
            info!(%nullifier, "withdrawal confirmed");
        } else {
            debug!(%nullifier, "withdrawal confirmation already applied");
        }
        match record.commitment {
            Some(commitment) => self.retire_commitment(&commitment),
            None => Ok(()),
        }
    }

    /// Erase the secret and move the source deposit to `Withdrawn`, stepping
    /// through `Confirmed` if its own confirmation has not arrived yet.
    fn retire_commitment(&mut self, commitment: &Digest) -> Result<()> {
        let Some(record) = self.store.get(commitment)? else {
            warn!(%commitment, "withdrawn deposit is missing from the store");
            return Ok(());
        };
        self.store.erase_secret(commitment)?;

        let mut status = record.status;
        if status == CommitmentStatus::Pending {
            status = self
                .store
                .update_status(commitment, CommitmentStatus::Confirmed)?
                .status;
        }
        if status == CommitmentStatus::Confirmed {
            self.store.update_status(commitment, CommitmentStatus::Withdrawn)?;
            info!(%commitment, "deposit withdrawn; secret erased");
        }
        Ok(())
    }
}

// =============================================================================
//                                HANDLE
// =============================================================================

/// Entry point: deposit, withdraw and read the reconciled state.
pub struct Mixer<L: LedgerClient + ?Sized> {
    ledger: Arc<L>,
    store: Arc<RecordStore>,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<LedgerSnapshot>>,
    subscription: SubscriptionId,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl<L: LedgerClient + ?Sized> Mixer<L> {
    /// Subscribe to `ledger` and spawn the engine over `store`.
    pub async fn start(store: RecordStore, ledger: Arc<L>, config: EngineConfig) -> Result<Self> {
        if config.command_buffer == 0 {
            return Err(MixerError::InvalidInput("command buffer must be positive".into()));
        }
        let store = Arc::new(store);
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(aggregate::snapshot(&store)?));
        let (commands, command_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.command_buffer);

        let subscription = ledger.subscribe(event_tx).await?;
        let reconciler = Reconciler {
            store: store.clone(),
            deposit_unit: config.deposit_unit,
            in_flight: HashSet::new(),
            snapshots: snapshot_tx,
        };
        let actor = tokio::spawn(reconciler.run(command_rx, event_rx));
        info!(subscription = subscription.0, "mixer engine started");

        Ok(Self {
            ledger,
            store,
            commands,
            snapshots,
            subscription,
            actor: Mutex::new(Some(actor)),
        })
    }

    /// Create a commitment for `recipient`, submit it and wait for the ledger
    /// to confirm it. The record stays `Pending` if submission or
    /// confirmation fails; use [`Mixer::prepare_deposit`] when the caller
    /// needs the commitment before anything is submitted.
    pub async fn deposit(&self, amount: Amount, recipient: Recipient) -> Result<Digest> {
        let record = Self::new_deposit(amount, recipient)?;
        let commitment = record.commitment;
        self.request(|reply| Command::RecordDeposit { record, reply })
            .await?;
        info!(%commitment, %amount, "deposit recorded");

        let claim = DepositClaim {
            amount,
            earlier: None,
        };
        self.submit_deposit(commitment, claim).await.map(|()| commitment)
    }

    /// Record a `Pending` deposit without submitting it. Submit it with
    /// [`Mixer::resubmit_deposit`].
    pub async fn prepare_deposit(&self, amount: Amount, recipient: Recipient) -> Result<Digest> {
        let record = Self::new_deposit(amount, recipient)?;
        let commitment = record.commitment;
        self.request(|reply| Command::RecordDeposit { record, reply })
            .await?;
        self.settle(commitment).await;
        info!(%commitment, %amount, "deposit prepared");
        Ok(commitment)
    }

    /// Drive a still-pending local deposit to confirmation. If the ledger
    /// already accepted a transaction for it, that transaction is awaited
    /// instead of funding the commitment again. Already confirmed deposits
    /// are left alone.
    pub async fn resubmit_deposit(&self, commitment: Digest) -> Result<()> {
        let claimed = self
            .request(|reply| Command::ClaimDeposit { commitment, reply })
            .await?;
        let Some(claim) = claimed else {
            debug!(%commitment, "deposit no longer pending; nothing to resubmit");
            return Ok(());
        };
        self.submit_deposit(commitment, claim).await
    }

    /// Withdraw a confirmed local deposit to the recipient it was created
    /// for. Returns the nullifier. A retry after a timeout waits on the
    /// transaction already accepted; the nullifier is only submitted again
    /// after the ledger failed the earlier one.
    pub async fn withdraw(&self, commitment: Digest) -> Result<Digest> {
        let ticket = self
            .request(|reply| Command::BeginWithdrawal { commitment, reply })
            .await?;
        let nullifier = ticket.nullifier;
        info!(%commitment, %nullifier, resuming = ticket.earlier.is_some(), "withdrawal started");

        let outcome = self.submit_withdrawal(ticket).await;
        self.settle(nullifier).await;
        if let Err(e) = &outcome {
            warn!(%commitment, error = %e, "withdrawal did not complete");
        }
        outcome.map(|()| nullifier)
    }

    /// Fresh snapshot read straight from the store.
    pub fn state(&self) -> Result<LedgerSnapshot> {
        aggregate::snapshot(&self.store)
    }

    /// Snapshots published after every change the engine makes.
    pub fn watch_state(&self) -> watch::Receiver<Arc<LedgerSnapshot>> {
        self.snapshots.clone()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Unsubscribe from the ledger and stop the engine. Later calls that need
    /// the engine fail with `EngineStopped`.
    pub async fn shutdown(&self) {
        let Some(actor) = self.actor.lock().await.take() else {
            return;
        };
        self.ledger.unsubscribe(self.subscription).await;
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = actor.await {
            warn!(error = %e, "engine task ended abnormally");
        }
        info!("mixer engine stopped");
    }

    fn new_deposit(amount: Amount, recipient: Recipient) -> Result<CommitmentRecord> {
        if amount.is_zero() {
            return Err(MixerError::InvalidInput("deposit amount must be positive".into()));
        }
        if recipient.0 == [0u8; 20] {
            return Err(MixerError::InvalidInput("recipient is the zero address".into()));
        }
        Ok(CommitmentRecord::new_local(recipient, Secret::random(), amount, now_millis()))
    }

    /// Runs with the commitment claimed; releases it before returning.
    async fn submit_deposit(&self, commitment: Digest, claim: DepositClaim) -> Result<()> {
        let outcome = self.confirm_deposit(commitment, claim).await;
        self.settle(commitment).await;
        if let Err(e) = &outcome {
            warn!(%commitment, error = %e, "deposit left pending");
        }
        outcome
    }

    async fn confirm_deposit(&self, commitment: Digest, claim: DepositClaim) -> Result<()> {
        let DepositClaim { amount, earlier } = claim;
        let block_timestamp = self
            .confirm(Submission::Deposit(commitment), earlier, || {
                self.ledger.submit_deposit(commitment, amount)
            })
            .await?;
        let event = LedgerEvent::DepositConfirmed {
            commitment,
            block_timestamp,
        };
        self.request(|reply| Command::Apply { event, reply }).await
    }

    async fn submit_withdrawal(&self, ticket: WithdrawalTicket) -> Result<()> {
        let WithdrawalTicket {
            nullifier,
            recipient,
            earlier,
        } = ticket;
        let block_timestamp = self
            .confirm(Submission::Withdrawal(nullifier), earlier, || {
                self.ledger.submit_withdraw(nullifier, recipient)
            })
            .await?;
        let event = LedgerEvent::WithdrawalConfirmed {
            nullifier,
            recipient,
            block_timestamp,
        };
        self.request(|reply| Command::Apply { event, reply }).await
    }

    /// Wait for the ledger to include `submission`, returning the block
    /// timestamp. An `earlier` accepted transaction is awaited first; only
    /// when the ledger failed it does `submit` run. A timeout keeps the
    /// accepted transaction on record for the next attempt.
    async fn confirm<F, Fut>(
        &self,
        submission: Submission,
        earlier: Option<TxHandle>,
        submit: F,
    ) -> Result<u64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TxHandle>>,
    {
        if let Some(handle) = earlier {
            debug!(?submission, "waiting on earlier transaction");
            match self.ledger.await_confirmation(handle).await? {
                Confirmation::Confirmed { block_timestamp } => return Ok(block_timestamp),
                Confirmation::Failed { reason } => {
                    warn!(?submission, %reason, "earlier transaction failed; submitting again");
                    self.track(submission, None).await?;
                }
            }
        }

        let handle = submit().await?;
        self.track(submission, Some(handle)).await?;
        match self.ledger.await_confirmation(handle).await? {
            Confirmation::Confirmed { block_timestamp } => Ok(block_timestamp),
            Confirmation::Failed { reason } => {
                self.track(submission, None).await?;
                Err(MixerError::SubmissionFailed(reason))
            }
        }
    }

    async fn track(&self, submission: Submission, tx: Option<TxHandle>) -> Result<()> {
        self.request(|reply| Command::Track {
            submission,
            tx,
            reply,
        })
        .await
    }

    async fn settle(&self, digest: Digest) {
        // A stopped engine has no claims left to release.
        let _ = self.commands.send(Command::Settle { digest }).await;
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| MixerError::EngineStopped)?;
        response.await.map_err(|_| MixerError::EngineStopped)?
    }
}

/// Dropping without [`Mixer::shutdown`] stops the engine and releases the
/// ledger subscription in the background.
impl<L: LedgerClient + ?Sized> Drop for Mixer<L> {
    fn drop(&mut self) {
        let Some(actor) = self.actor.get_mut().take() else {
            return;
        };
        actor.abort();

        let ledger = self.ledger.clone();
        let subscription = self.subscription;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    ledger.unsubscribe(subscription).await;
                    debug!(subscription = subscription.0, "released subscription of dropped engine");
                });
            }
            Err(_) => warn!(
                subscription = subscription.0,
                "engine dropped outside a runtime; subscription left registered"
            ),
        }
    }
}
