use core::fmt;
use core::iter::Sum;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{MixerError, Result};

/// 10^18 wei per ether.
pub const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;

const DECIMALS: usize = 18;

/// A non-negative ether amount, held as whole wei.
///
/// Parses and renders decimal strings ("1.0", "0.25"); JSON carries the string
/// form so stored records stay readable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_wei(wei: u128) -> Self {
        Self(wei)
    }

    pub const fn wei(self) -> u128 {
        self.0
    }

    /// Whole ether units.
    pub const fn ether(units: u64) -> Self {
        Self(units as u128 * WEI_PER_ETHER)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Parse a deposit amount: must be well-formed and strictly positive.
    pub fn parse_positive(s: &str) -> Result<Self> {
        let amount: Amount = s.parse()?;
        if amount.is_zero() {
            return Err(MixerError::InvalidInput("amount must be positive".into()));
        }
        Ok(amount)
    }
}

impl FromStr for Amount {
    type Err = MixerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| MixerError::InvalidInput(format!("amount {s:?}: {why}"));
        let s = s.trim();
        let (int_part, frac_part) = match s.split_once('.') {
            Some((int, frac)) => (int, Some(frac)),
            None => (s, None),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("expected a non-negative decimal"));
        }
        let frac_part = frac_part.unwrap_or("0");
        if frac_part.is_empty() || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("expected a non-negative decimal"));
        }
        if frac_part.len() > DECIMALS {
            return Err(invalid("more than 18 fractional digits"));
        }

        let whole: u128 = int_part.parse().map_err(|_| invalid("overflow"))?;
        let mut frac_padded = String::with_capacity(DECIMALS);
        frac_padded.push_str(frac_part);
        while frac_padded.len() < DECIMALS {
            frac_padded.push('0');
        }
        let frac: u128 = frac_padded.parse().map_err(|_| invalid("overflow"))?;

        whole
            .checked_mul(WEI_PER_ETHER)
            .and_then(|w| w.checked_add(frac))
            .map(Amount)
            .ok_or_else(|| invalid("overflow"))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / WEI_PER_ETHER;
        let frac = self.0 % WEI_PER_ETHER;
        if frac == 0 {
            return write!(f, "{whole}.0");
        }
        let digits = format!("{frac:018}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl TryFrom<String> for Amount {
    type Error = MixerError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        Amount(iter.fold(0u128, |acc, a| acc.saturating_add(a.0)))
    }
}
