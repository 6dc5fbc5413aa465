//! Local record store: sled trees keyed by `0x` hex digest, JSON values.
//!
//! Three trees:
//!   commitments - CommitmentRecord metadata (never contains the secret)
//!   secrets     - nonce || SalsaBox(secret), joined to metadata by key
//!   withdrawals - WithdrawalRecord audit trail
//!
//! A value that fails to decode is treated as absent so one bad entry cannot
//! take the rest of the store down with it.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{SalsaBox, SecretKey};
use mixer_lib::{
    CommitmentRecord, CommitmentStatus, Digest, MixerError, Result, Secret, WithdrawalRecord,
    WithdrawalStatus,
};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 24;

fn storage_err(e: impl fmt::Display) -> MixerError {
    MixerError::Storage(format!("sled: {e}"))
}

// =============================================================================
//                              STORE KEY
// =============================================================================

/// 32-byte key sealing secrets at rest.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoreKey([u8; 32]);

impl StoreKey {
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl FromStr for StoreKey {
    type Err = MixerError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = hex::decode(s.trim().trim_start_matches("0x"))
            .map_err(|e| MixerError::InvalidInput(format!("store key: {e}")))?;
        let key: Result<[u8; 32]> = bytes
            .as_slice()
            .try_into()
            .map_err(|_| MixerError::InvalidInput("store key: expected 32 bytes".into()));
        bytes.zeroize();
        key.map(Self)
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreKey(..)")
    }
}

/// Seals secrets with a box from the store key to itself.
struct Sealer {
    cipher: SalsaBox,
}

impl Sealer {
    fn new(key: &StoreKey) -> Self {
        let secret_key = SecretKey::from(key.0);
        let public_key = secret_key.public_key();
        Self {
            cipher: SalsaBox::new(&public_key, &secret_key),
        }
    }

    fn seal(&self, secret: &Secret) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), &secret.expose()[..])
            .map_err(|_| MixerError::Storage("failed to seal secret".into()))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Option<Secret> {
        if sealed.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut plaintext = self.cipher.decrypt(GenericArray::from_slice(nonce), ciphertext).ok()?;
        let secret = Secret::from_slice(&plaintext).ok();
        plaintext.zeroize();
        secret
    }
}

// =============================================================================
//                              RECORD STORE
// =============================================================================

pub struct RecordStore {
    db: sled::Db,
    commitments: sled::Tree,
    secrets: sled::Tree,
    withdrawals: sled::Tree,
    sealer: Sealer,
}

impl RecordStore {
    /// Open (or create) a durable store at `path`.
    pub fn open(path: impl AsRef<Path>, key: &StoreKey) -> Result<Self> {
        let db = sled::open(path.as_ref()).map_err(storage_err)?;
        info!("opened record store at {}", path.as_ref().display());
        Self::from_db(db, key)
    }

    /// A store that lives only as long as this handle, with a random key.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage_err)?;
        Self::from_db(db, &StoreKey::random())
    }

    fn from_db(db: sled::Db, key: &StoreKey) -> Result<Self> {
        Ok(Self {
            commitments: db.open_tree("commitments").map_err(storage_err)?,
            secrets: db.open_tree("secrets").map_err(storage_err)?,
            withdrawals: db.open_tree("withdrawals").map_err(storage_err)?,
            sealer: Sealer::new(key),
            db,
        })
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }

    // ── commitments ───────────────────────────────────────────────────

    /// Write a record. The secret, if any, goes to the sealed tree; the
    /// metadata is written last so a reader never sees a record whose secret
    /// is still missing.
    pub fn put(&self, record: &CommitmentRecord) -> Result<()> {
        let key = record.commitment.to_hex();
        let meta = serde_json::to_vec(record).map_err(storage_err)?;
        match &record.secret {
            Some(secret) => {
                let sealed = self.sealer.seal(secret)?;
                self.secrets.insert(key.as_bytes(), sealed).map_err(storage_err)?;
            }
            None => {
                self.secrets.remove(key.as_bytes()).map_err(storage_err)?;
            }
        }
        self.commitments.insert(key.as_bytes(), meta).map_err(storage_err)?;
        self.flush()
    }

    /// Fetch a record with its secret joined back in. Malformed metadata reads
    /// as `None`; a secret that fails to unseal reads as erased.
    pub fn get(&self, commitment: &Digest) -> Result<Option<CommitmentRecord>> {
        let key = commitment.to_hex();
        let Some(raw) = self.commitments.get(key.as_bytes()).map_err(storage_err)? else {
            return Ok(None);
        };
        let Some(mut record) = decode::<CommitmentRecord>(&key, &raw) else {
            return Ok(None);
        };
        record.secret = self.load_secret(&key)?;
        Ok(Some(record))
    }

    fn load_secret(&self, key: &str) -> Result<Option<Secret>> {
        let Some(sealed) = self.secrets.get(key.as_bytes()).map_err(storage_err)? else {
            return Ok(None);
        };
        let secret = self.sealer.open(&sealed);
        if secret.is_none() {
            warn!(key, "sealed secret could not be opened; treating as erased");
        }
        Ok(secret)
    }

    /// All readable commitment records, metadata only. Secrets are not joined
    /// here; use [`RecordStore::get`] when the secret is needed.
    pub fn list_all(&self) -> Result<Vec<CommitmentRecord>> {
        list(&self.commitments)
    }

    /// Advance a record's status by one monotonic step.
    pub fn update_status(
        &self,
        commitment: &Digest,
        next: CommitmentStatus,
    ) -> Result<CommitmentRecord> {
        let key = commitment.to_hex();
        let mut record = cas_update::<CommitmentRecord, _>(&self.commitments, &key, |mut record| {
            record.status = record.status.advance_to(next)?;
            Ok(record)
        })?
        .ok_or(MixerError::UnknownCommitment(*commitment))?;
        self.flush()?;
        debug!(%commitment, status = next.as_str(), "status advanced");
        record.secret = self.load_secret(&key)?;
        Ok(record)
    }

    /// Drop the sealed secret. Returns whether one was present.
    pub fn erase_secret(&self, commitment: &Digest) -> Result<bool> {
        let key = commitment.to_hex();
        let erased = self
            .secrets
            .remove(key.as_bytes())
            .map_err(storage_err)?
            .is_some();
        self.flush()?;
        if erased {
            debug!(%commitment, "secret erased");
        }
        Ok(erased)
    }

    /// Remember (or forget, with `None`) the deposit transaction the ledger
    /// accepted for `commitment`.
    pub fn set_deposit_tx(&self, commitment: &Digest, tx_hash: Option<Digest>) -> Result<()> {
        let key = commitment.to_hex();
        cas_update::<CommitmentRecord, _>(&self.commitments, &key, |mut record| {
            record.tx_hash = tx_hash;
            Ok(record)
        })?
        .ok_or(MixerError::UnknownCommitment(*commitment))?;
        self.flush()
    }

    pub fn remove(&self, commitment: &Digest) -> Result<()> {
        let key = commitment.to_hex();
        self.commitments.remove(key.as_bytes()).map_err(storage_err)?;
        self.secrets.remove(key.as_bytes()).map_err(storage_err)?;
        self.flush()
    }

    // ── withdrawals ───────────────────────────────────────────────────

    pub fn put_withdrawal(&self, record: &WithdrawalRecord) -> Result<()> {
        let key = record.nullifier.to_hex();
        let value = serde_json::to_vec(record).map_err(storage_err)?;
        self.withdrawals.insert(key.as_bytes(), value).map_err(storage_err)?;
        self.flush()
    }

    /// Create the record only if no entry exists for its nullifier. Returns
    /// `false` when something was already there.
    pub fn insert_withdrawal_if_absent(&self, record: &WithdrawalRecord) -> Result<bool> {
        let key = record.nullifier.to_hex();
        let value = serde_json::to_vec(record).map_err(storage_err)?;
        let swapped = self
            .withdrawals
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(value))
            .map_err(storage_err)?;
        if swapped.is_ok() {
            self.flush()?;
        }
        Ok(swapped.is_ok())
    }

    pub fn get_withdrawal(&self, nullifier: &Digest) -> Result<Option<WithdrawalRecord>> {
        let key = nullifier.to_hex();
        let raw = self.withdrawals.get(key.as_bytes()).map_err(storage_err)?;
        Ok(raw.and_then(|raw| decode(&key, &raw)))
    }

    pub fn list_withdrawals(&self) -> Result<Vec<WithdrawalRecord>> {
        list(&self.withdrawals)
    }

    pub fn set_withdrawal_tx(&self, nullifier: &Digest, tx_hash: Option<Digest>) -> Result<()> {
        let key = nullifier.to_hex();
        cas_update::<WithdrawalRecord, _>(&self.withdrawals, &key, |mut record| {
            record.tx_hash = tx_hash;
            Ok(record)
        })?
        .ok_or_else(|| MixerError::InvalidInput(format!("no withdrawal for nullifier {nullifier}")))?;
        self.flush()
    }

    /// Mark a pending withdrawal confirmed. Confirming twice is an
    /// `InvalidTransition`.
    pub fn confirm_withdrawal(
        &self,
        nullifier: &Digest,
        confirmed_at: u64,
    ) -> Result<WithdrawalRecord> {
        let key = nullifier.to_hex();
        let record = cas_update::<WithdrawalRecord, _>(&self.withdrawals, &key, |mut record| {
            if record.status != WithdrawalStatus::Pending {
                return Err(MixerError::InvalidTransition {
                    from: "confirmed",
                    to: "confirmed",
                });
            }
            record.status = WithdrawalStatus::Confirmed;
            record.confirmed_at = Some(confirmed_at);
            Ok(record)
        })?
        .ok_or_else(|| MixerError::InvalidInput(format!("no withdrawal for nullifier {nullifier}")))?;
        self.flush()?;
        Ok(record)
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> Option<T> {
    match serde_json::from_slice(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "malformed store entry; treating as absent");
            None
        }
    }
}

fn list<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for entry in tree.iter() {
        let (key, value) = entry.map_err(storage_err)?;
        let key = String::from_utf8_lossy(&key);
        if let Some(record) = decode(&key, &value) {
            out.push(record);
        }
    }
    Ok(out)
}

/// Read-modify-write one key with compare-and-swap, retrying if another
/// writer got there first. `Ok(None)` when the key is absent or malformed.
fn cas_update<T, F>(tree: &sled::Tree, key: &str, mut f: F) -> Result<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(T) -> Result<T>,
{
    loop {
        let Some(current) = tree.get(key.as_bytes()).map_err(storage_err)? else {
            return Ok(None);
        };
        let Some(record) = decode::<T>(key, &current) else {
            return Ok(None);
        };
        let updated = f(record)?;
        let encoded = serde_json::to_vec(&updated).map_err(storage_err)?;
        match tree
            .compare_and_swap(key.as_bytes(), Some(&current), Some(encoded))
            .map_err(storage_err)?
        {
            Ok(()) => return Ok(Some(updated)),
            Err(_) => debug!(key, "concurrent update; retrying"),
        }
    }
}
