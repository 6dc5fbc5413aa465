//! Commitment and nullifier primitives for the mixer ledger.
//!
//! Off-chain representation (matches the mixer contract's ABI encoding):
//!   commitment = keccak256(abi.encode(address recipient, bytes32 secret))
//!   nullifier  = keccak256(abi.encode(bytes32 secret, address recipient))
//!
//! The nullifier is derived from the same secret that backs the commitment and
//! is published at withdrawal time without any proof of knowledge. Anyone who
//! learns the secret can link a withdrawal to its deposit, so unlinkability is
//! weaker than a zero-knowledge pool provides.

use core::fmt;
use core::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tiny_keccak::{Hasher, Keccak};
use zeroize::{Zeroize, ZeroizeOnDrop};

mod amount;
mod error;
mod record;

pub use amount::{Amount, WEI_PER_ETHER};
pub use error::{MixerError, Result};
pub use record::{
    now_millis, CommitmentRecord, CommitmentStatus, RecordOrigin, WithdrawalRecord,
    WithdrawalStatus,
};

// =============================================================================
//                          KECCAK256 HELPERS
// =============================================================================

/// Compute keccak256 hash. This matches Solidity's keccak256() opcode.
/// Note: tiny_keccak::Keccak is the original Keccak-256 (NOT SHA3-256).
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Decode hex with or without a `0x` prefix into exactly `N` bytes.
fn decode_hex_fixed<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    let bytes =
        hex::decode(s).map_err(|e| MixerError::InvalidInput(format!("{what}: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        MixerError::InvalidInput(format!("{what}: expected {N} bytes, got {}", bytes.len()))
    })
}

// =============================================================================
//                              DIGEST
// =============================================================================

/// A 32-byte keccak digest: a commitment or a nullifier.
///
/// Rendered as lowercase `0x`-prefixed hex, which is also the storage key form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            MixerError::InvalidInput(format!("digest: expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x`-prefixed hex form used for store keys and transfer.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = MixerError;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex_fixed::<32>(s, "digest").map(Self)
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
//                              RECIPIENT
// =============================================================================

/// A 20-byte account address that receives the withdrawn funds.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Recipient(pub [u8; 20]);

impl Recipient {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            MixerError::InvalidInput(format!("recipient: expected 20 bytes, got {}", bytes.len()))
        })?;
        Self::new(arr)
    }

    /// The zero address is never a valid withdrawal target.
    pub fn new(bytes: [u8; 20]) -> Result<Self> {
        if bytes == [0u8; 20] {
            return Err(MixerError::InvalidInput("recipient: zero address".into()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// ABI encoding of `address`: 12 zero bytes + 20 address bytes.
    pub fn padded(&self) -> [u8; 32] {
        let mut padded = [0u8; 32];
        padded[12..32].copy_from_slice(&self.0);
        padded
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Recipient({self})")
    }
}

impl FromStr for Recipient {
    type Err = MixerError;

    fn from_str(s: &str) -> Result<Self> {
        decode_hex_fixed::<20>(s.trim(), "recipient").and_then(Self::new)
    }
}

impl Serialize for Recipient {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
//                              SECRET
// =============================================================================

/// The 32-byte random value behind a commitment.
///
/// Has no `Display` and no serde impls; `Debug` is redacted and the bytes are
/// zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; 32]);

impl Secret {
    /// Fresh secret from the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self(rng.gen())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            MixerError::InvalidInput(format!("secret: expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Raw bytes, for digest computation and sealing only.
    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

// =============================================================================
//                          DIGEST FUNCTIONS
// =============================================================================

/// Compute the deposit commitment.
///
/// commitment = keccak256(pad32(recipient) || secret)
/// Total preimage: 64 bytes.
pub fn commitment_of(recipient: &Recipient, secret: &Secret) -> Digest {
    let mut preimage = [0u8; 64];
    preimage[0..32].copy_from_slice(&recipient.padded());
    preimage[32..64].copy_from_slice(secret.expose());
    let digest = Digest(keccak256(&preimage));
    preimage.zeroize();
    digest
}

/// Compute the withdrawal nullifier. Field order is reversed relative to the
/// commitment so the two digests never coincide for the same pair.
///
/// nullifier = keccak256(secret || pad32(recipient))
pub fn nullifier_of(secret: &Secret, recipient: &Recipient) -> Digest {
    let mut preimage = [0u8; 64];
    preimage[0..32].copy_from_slice(secret.expose());
    preimage[32..64].copy_from_slice(&recipient.padded());
    let digest = Digest(keccak256(&preimage));
    preimage.zeroize();
    digest
}

// =============================================================================
//                              TESTS
// =============================================================================
