//! Read-only projection of the record store for display.

use std::cmp::Reverse;

use mixer_lib::{
    Amount, CommitmentRecord, CommitmentStatus, Digest, Recipient, Result, WithdrawalRecord,
    WithdrawalStatus,
};
use serde::Serialize;

use crate::store::RecordStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DepositView {
    pub commitment: Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Recipient>,
    pub amount: Amount,
    pub created_at: u64,
    pub status: CommitmentStatus,
    /// Built from a ledger event alone; `amount` and `created_at` are guesses.
    pub approximate: bool,
}

impl From<&CommitmentRecord> for DepositView {
    fn from(record: &CommitmentRecord) -> Self {
        Self {
            commitment: record.commitment,
            recipient: record.recipient,
            amount: record.amount,
            created_at: record.created_at,
            status: record.status,
            approximate: record.is_approximate(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WithdrawalView {
    pub nullifier: Digest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment: Option<Digest>,
    pub recipient: Recipient,
    pub amount: Amount,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<u64>,
    pub status: WithdrawalStatus,
    pub approximate: bool,
}

impl From<&WithdrawalRecord> for WithdrawalView {
    fn from(record: &WithdrawalRecord) -> Self {
        Self {
            nullifier: record.nullifier,
            commitment: record.commitment,
            recipient: record.recipient,
            amount: record.amount,
            created_at: record.created_at,
            confirmed_at: record.confirmed_at,
            status: record.status,
            approximate: record.is_approximate(),
        }
    }
}

/// Totals plus sorted views. Never carries a secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub total_deposited: Amount,
    pub total_withdrawn: Amount,
    /// Newest first.
    pub deposits: Vec<DepositView>,
    /// Pending (newest created first), then confirmed (newest confirmed first).
    pub withdrawals: Vec<WithdrawalView>,
}

impl LedgerSnapshot {
    pub fn from_records(commitments: &[CommitmentRecord], withdrawals: &[WithdrawalRecord]) -> Self {
        let total_deposited = commitments.iter().map(|r| r.amount).sum();
        let total_withdrawn = withdrawals
            .iter()
            .filter(|w| w.status == WithdrawalStatus::Confirmed)
            .map(|w| w.amount)
            .sum();

        let mut deposits: Vec<DepositView> = commitments.iter().map(DepositView::from).collect();
        deposits.sort_by_key(|d| (Reverse(d.created_at), d.commitment));

        let mut withdrawals: Vec<WithdrawalView> =
            withdrawals.iter().map(WithdrawalView::from).collect();
        withdrawals.sort_by_key(|w| {
            (
                w.confirmed_at.is_some(),
                Reverse(w.confirmed_at),
                Reverse(w.created_at),
                w.nullifier,
            )
        });

        Self {
            total_deposited,
            total_withdrawn,
            deposits,
            withdrawals,
        }
    }

    pub fn deposit(&self, commitment: &Digest) -> Option<&DepositView> {
        self.deposits.iter().find(|d| &d.commitment == commitment)
    }

    pub fn withdrawal(&self, nullifier: &Digest) -> Option<&WithdrawalView> {
        self.withdrawals.iter().find(|w| &w.nullifier == nullifier)
    }
}

/// Recompute a snapshot from everything currently in the store.
pub fn snapshot(store: &RecordStore) -> Result<LedgerSnapshot> {
    let commitments = store.list_all()?;
    let withdrawals = store.list_withdrawals()?;
    Ok(LedgerSnapshot::from_records(&commitments, &withdrawals))
}
