//! Ledger data model shared by every component
//!
//! Identifiers are opaque strings. Addresses carry their chain alias as a
//! prefix (`X-0x...`), so an address is only meaningful on the chain it names.

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Amount in the asset's smallest unit.
pub type Amount = U256;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Chain-scoped account address
    Address
);
string_id!(
    /// Canonical asset identifier (never the human-readable symbol)
    AssetId
);
string_id!(
    /// Registered blockchain identifier, as returned by an alias lookup
    ChainId
);
string_id!(
    /// Transaction identifier returned on submission
    TxId
);

impl Address {
    /// Alias of the chain this address belongs to (`X` for `X-0xabc`)
    pub fn chain_alias(&self) -> Option<&str> {
        self.0.split_once('-').map(|(alias, _)| alias)
    }
}

/// Reference to one output of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoId {
    pub tx_id: TxId,
    pub output_index: u32,
}

impl UtxoId {
    pub fn new(tx_id: TxId, output_index: u32) -> Self {
        Self { tx_id, output_index }
    }
}

impl fmt::Display for UtxoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

/// Spend condition of an output: `threshold` of `addresses` must sign,
/// and not before `locktime` (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputOwners {
    pub addresses: Vec<Address>,
    pub threshold: u32,
    #[serde(default)]
    pub locktime: u64,
}

impl OutputOwners {
    /// Single-signature owners over a sorted, de-duplicated address set
    pub fn new(addresses: &[Address]) -> Self {
        let mut addresses = addresses.to_vec();
        addresses.sort();
        addresses.dedup();
        Self {
            addresses,
            threshold: 1,
            locktime: 0,
        }
    }

    /// Addresses among `candidates` that satisfy the threshold at `as_of`
    pub fn signers_among(&self, candidates: &[Address], as_of: u64) -> Option<Vec<Address>> {
        if self.locktime > as_of {
            return None;
        }

        let threshold = self.threshold.max(1) as usize;
        let signers: Vec<Address> = self
            .addresses
            .iter()
            .filter(|a| candidates.contains(a))
            .take(threshold)
            .cloned()
            .collect();

        (signers.len() == threshold).then_some(signers)
    }

    pub fn includes_any(&self, addresses: &[Address]) -> bool {
        self.addresses.iter().any(|a| addresses.contains(a))
    }
}

/// Unspent transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub id: UtxoId,
    pub asset_id: AssetId,
    #[serde(with = "amount_serde")]
    pub amount: Amount,
    pub owners: OutputOwners,
}

/// Ledger-reported transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Unknown,
    Processing,
    Accepted,
    Rejected,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Accepted | TxStatus::Rejected)
    }

    /// Parse a status string as reported by a node
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "processing" => TxStatus::Processing,
            "accepted" | "committed" => TxStatus::Accepted,
            "rejected" | "dropped" | "aborted" => TxStatus::Rejected,
            _ => TxStatus::Unknown,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Unknown => "Unknown",
            TxStatus::Processing => "Processing",
            TxStatus::Accepted => "Accepted",
            TxStatus::Rejected => "Rejected",
        };
        f.write_str(s)
    }
}

/// Result of an asset description lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDescription {
    #[serde(rename = "assetID")]
    pub asset_id: AssetId,
    pub name: String,
    pub symbol: String,
    #[serde(default, with = "u8_string")]
    pub denomination: u8,
}

/// Parse a decimal or `0x`-prefixed hexadecimal amount
pub fn parse_amount(value: &str) -> Result<Amount, String> {
    let value = value.trim();
    match value.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => U256::from_dec_str(value).map_err(|e| e.to_string()),
    }
}

/// Amounts travel as decimal strings; numbers are accepted on input.
pub mod amount_serde {
    use super::{parse_amount, Amount};
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => parse_amount(&s).map_err(de::Error::custom),
            Raw::Number(n) => Ok(Amount::from(n)),
        }
    }
}

/// Optional amount, same encoding as [`amount_serde`]
pub mod option_amount_serde {
    use super::Amount;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapped(#[serde(with = "super::amount_serde")] Amount);

    pub fn serialize<S: Serializer>(
        amount: &Option<Amount>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match amount {
            Some(amount) => serializer.serialize_some(&amount.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Amount>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|w| w.0))
    }
}

mod u8_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u8),
    }

    pub fn serialize<S: Serializer>(value: &u8, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(de::Error::custom),
            Raw::Number(n) => Ok(n),
        }
    }
}
