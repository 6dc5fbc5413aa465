use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{commitment_of, Amount, Digest, MixerError, Recipient, Result, Secret};

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
//                              STATUS
// =============================================================================

/// Deposit lifecycle. Only `Pending -> Confirmed -> Withdrawn` is allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentStatus {
    Pending,
    Confirmed,
    Withdrawn,
}

impl CommitmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitmentStatus::Pending => "pending",
            CommitmentStatus::Confirmed => "confirmed",
            CommitmentStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn can_advance_to(self, next: CommitmentStatus) -> bool {
        matches!(
            (self, next),
            (CommitmentStatus::Pending, CommitmentStatus::Confirmed)
                | (CommitmentStatus::Confirmed, CommitmentStatus::Withdrawn)
        )
    }

    /// Check a single monotonic step.
    pub fn advance_to(self, next: CommitmentStatus) -> Result<CommitmentStatus> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(MixerError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Confirmed,
}

/// Where a record came from. `Observed` records were built from a ledger
/// event with no local counterpart; their amount and timestamps are
/// best-effort.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOrigin {
    #[default]
    Local,
    Observed,
}

// =============================================================================
//                          COMMITMENT RECORD
// =============================================================================

/// One deposit attempt.
///
/// The secret is never part of the serialized form; the store seals it
/// separately and joins it back on read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentRecord {
    pub commitment: Digest,
    #[serde(skip)]
    pub secret: Option<Secret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Recipient>,
    pub amount: Amount,
    pub created_at: u64,
    pub status: CommitmentStatus,
    #[serde(default)]
    pub origin: RecordOrigin,
    /// Last deposit transaction the ledger accepted for this commitment.
    /// A retry waits on it instead of funding the commitment twice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<Digest>,
}

impl CommitmentRecord {
    /// A freshly created local deposit, `Pending`.
    pub fn new_local(recipient: Recipient, secret: Secret, amount: Amount, created_at: u64) -> Self {
        Self {
            commitment: commitment_of(&recipient, &secret),
            secret: Some(secret),
            recipient: Some(recipient),
            amount,
            created_at,
            status: CommitmentStatus::Pending,
            origin: RecordOrigin::Local,
            tx_hash: None,
        }
    }

    /// A deposit seen on the ledger that this store never created.
    pub fn observed(commitment: Digest, amount: Amount, created_at: u64) -> Self {
        Self {
            commitment,
            secret: None,
            recipient: None,
            amount,
            created_at,
            status: CommitmentStatus::Confirmed,
            origin: RecordOrigin::Observed,
            tx_hash: None,
        }
    }

    pub fn is_approximate(&self) -> bool {
        self.origin == RecordOrigin::Observed
    }
}

// =============================================================================
//                          WITHDRAWAL RECORD
// =============================================================================

/// One withdrawal. Never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub nullifier: Digest,
    /// Source deposit; `None` for withdrawals observed from elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<Digest>,
    pub recipient: Recipient,
    pub amount: Amount,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<u64>,
    pub status: WithdrawalStatus,
    #[serde(default)]
    pub origin: RecordOrigin,
    /// Accepted withdrawal transaction, if any. The nullifier is never
    /// submitted again while this is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<Digest>,
}

impl WithdrawalRecord {
    pub fn pending(
        nullifier: Digest,
        commitment: Digest,
        recipient: Recipient,
        amount: Amount,
        created_at: u64,
    ) -> Self {
        Self {
            nullifier,
            commitment: Some(commitment),
            recipient,
            amount,
            created_at,
            confirmed_at: None,
            status: WithdrawalStatus::Pending,
            origin: RecordOrigin::Local,
            tx_hash: None,
        }
    }

    /// A confirmed withdrawal with no local source deposit.
    pub fn detached(nullifier: Digest, recipient: Recipient, amount: Amount, confirmed_at: u64) -> Self {
        Self {
            nullifier,
            commitment: None,
            recipient,
            amount,
            created_at: confirmed_at,
            confirmed_at: Some(confirmed_at),
            status: WithdrawalStatus::Confirmed,
            origin: RecordOrigin::Observed,
            tx_hash: None,
        }
    }

    pub fn is_approximate(&self) -> bool {
        self.origin == RecordOrigin::Observed
    }
}
