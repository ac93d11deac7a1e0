use std::{fmt, str::FromStr};

use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub const ADDRESS_LEN: usize = 20;

/// Opaque 20-byte account identifier.
///
/// [`Address::ZERO`] is reserved: it is never a valid recipient or spender,
/// and the exchange uses it as the asset identifier for ether.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_LEN]);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AddressError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("address must be {ADDRESS_LEN} bytes, got {0}")]
    Length(usize),
}

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LEN]);

    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LEN]
    }

    /// Deterministic address for a human label (`"deployer"`, `"user1"`, ...).
    pub fn derive(label: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update(label.as_bytes());
        Self::truncate(hasher.finalize().into())
    }

    /// Address of the `nonce`-th contract deployed by `deployer`.
    pub fn contract(deployer: &Address, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"contract");
        hasher.update(deployer.0);
        hasher.update(nonce.to_le_bytes());
        Self::truncate(hasher.finalize().into())
    }

    /// `0x`-prefixed text is parsed as an address; anything else is treated
    /// as a label and derived.
    pub fn resolve(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        if text.starts_with("0x") || text.starts_with("0X") {
            text.parse()
        } else {
            Ok(Self::derive(text))
        }
    }

    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn truncate(digest: [u8; 32]) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest[..ADDRESS_LEN]);
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let raw = hex::decode(digits)?;
        let bytes: [u8; ADDRESS_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::Length(raw.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
