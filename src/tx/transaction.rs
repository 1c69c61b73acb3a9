//! Unsigned and signed transaction model

use crate::error::{TransferError, TransferResult};
use crate::types::{Address, Amount, AssetId, ChainId, OutputOwners, TxId, UtxoId};

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeSet;

/// Reference to a UTXO being consumed, with the addresses that must sign it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferableInput {
    pub utxo_id: UtxoId,
    pub asset_id: AssetId,
    #[serde(with = "crate::types::amount_serde")]
    pub amount: Amount,
    pub signers: Vec<Address>,
}

/// New output created by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferableOutput {
    pub asset_id: AssetId,
    #[serde(with = "crate::types::amount_serde")]
    pub amount: Amount,
    pub owners: OutputOwners,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Same-chain transfer
    Base,
    /// Moves `exported_outputs` into the destination chain's shared memory
    Export {
        destination_chain: ChainId,
        exported_outputs: Vec<TransferableOutput>,
    },
    /// Consumes UTXOs exported by `source_chain`
    Import {
        source_chain: ChainId,
        imported_inputs: Vec<TransferableInput>,
    },
}

impl TxKind {
    pub fn name(&self) -> &'static str {
        match self {
            TxKind::Base => "base",
            TxKind::Export { .. } => "export",
            TxKind::Import { .. } => "import",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub network_id: u32,
    pub blockchain_id: ChainId,
    /// Local UTXOs consumed
    pub inputs: Vec<TransferableInput>,
    /// Local outputs created
    pub outputs: Vec<TransferableOutput>,
    pub kind: TxKind,
    pub memo: Vec<u8>,
}

impl UnsignedTx {
    /// Deterministic byte encoding: bincode over the declared field order
    pub fn encode(&self) -> TransferResult<Vec<u8>> {
        encode(self)
    }

    /// Message every credential signs
    pub fn digest(&self) -> TransferResult<[u8; 32]> {
        Ok(Keccak256::digest(self.encode()?).into())
    }

    /// Local inputs followed by imported inputs, in credential order
    pub fn all_inputs(&self) -> impl Iterator<Item = &TransferableInput> {
        let imported: &[TransferableInput] = match &self.kind {
            TxKind::Import {
                imported_inputs, ..
            } => imported_inputs,
            _ => &[],
        };
        self.inputs.iter().chain(imported.iter())
    }

    /// Local outputs followed by exported outputs
    pub fn all_outputs(&self) -> impl Iterator<Item = &TransferableOutput> {
        let exported: &[TransferableOutput] = match &self.kind {
            TxKind::Export {
                exported_outputs, ..
            } => exported_outputs,
            _ => &[],
        };
        self.outputs.iter().chain(exported.iter())
    }

    /// Total consumed of an asset
    pub fn consumed(&self, asset_id: &AssetId) -> Amount {
        self.all_inputs()
            .filter(|i| &i.asset_id == asset_id)
            .fold(Amount::zero(), |acc, i| acc.saturating_add(i.amount))
    }

    /// Total produced of an asset
    pub fn produced(&self, asset_id: &AssetId) -> Amount {
        self.all_outputs()
            .filter(|o| &o.asset_id == asset_id)
            .fold(Amount::zero(), |acc, o| acc.saturating_add(o.amount))
    }

    /// Value consumed but not produced, i.e. the fee paid in this asset
    pub fn burned(&self, asset_id: &AssetId) -> Amount {
        self.consumed(asset_id).saturating_sub(self.produced(asset_id))
    }

    pub fn assets(&self) -> BTreeSet<AssetId> {
        self.all_inputs()
            .map(|i| i.asset_id.clone())
            .chain(self.all_outputs().map(|o| o.asset_id.clone()))
            .collect()
    }

    /// Addresses whose keys must sign
    pub fn required_signers(&self) -> BTreeSet<Address> {
        self.all_inputs()
            .flat_map(|i| i.signers.iter().cloned())
            .collect()
    }
}

/// Signatures for one input, in signer order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub signatures: Vec<String>,
}

impl Credential {
    pub fn from_raw(signatures: Vec<Vec<u8>>) -> Self {
        Self {
            signatures: signatures.iter().map(hex::encode).collect(),
        }
    }

    pub fn raw_signatures(&self) -> Result<Vec<Vec<u8>>, hex::FromHexError> {
        self.signatures.iter().map(hex::decode).collect()
    }
}

/// Transaction with one credential per input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub unsigned: UnsignedTx,
    pub credentials: Vec<Credential>,
}

impl SignedTx {
    pub fn encode(&self) -> TransferResult<Vec<u8>> {
        encode(self)
    }

    /// Identifier the ledger assigns to this payload
    pub fn id(&self) -> TransferResult<TxId> {
        Ok(TxId::new(hex::encode(Keccak256::digest(self.encode()?))))
    }

    pub fn to_hex(&self) -> TransferResult<String> {
        Ok(format!("0x{}", hex::encode(self.encode()?)))
    }
}

fn encode<T: Serialize>(value: &T) -> TransferResult<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| TransferError::Internal(format!("Failed to encode transaction: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> UnsignedTx {
        let owner = Address::from("X-0xowner");
        UnsignedTx {
            network_id: 5,
            blockchain_id: ChainId::from("x-chain"),
            inputs: vec![TransferableInput {
                utxo_id: UtxoId::new(TxId::from("genesis"), 0),
                asset_id: AssetId::from("avax"),
                amount: Amount::from(10u64),
                signers: vec![owner.clone()],
            }],
            outputs: vec![TransferableOutput {
                asset_id: AssetId::from("avax"),
                amount: Amount::from(9u64),
                owners: OutputOwners::new(&[owner]),
            }],
            kind: TxKind::Base,
            memo: b"memo".to_vec(),
        }
    }

    #[test]
    fn test_kind_is_part_of_the_digest() {
        let tx = base();
        let mut export = base();
        export.kind = TxKind::Export {
            destination_chain: ChainId::from("c-chain"),
            exported_outputs: Vec::new(),
        };

        assert_eq!(tx.digest().unwrap(), base().digest().unwrap());
        assert_ne!(tx.digest().unwrap(), export.digest().unwrap());
    }

    #[test]
    fn test_credentials_change_the_id() {
        let unsigned = SignedTx {
            unsigned: base(),
            credentials: Vec::new(),
        };
        let signed = SignedTx {
            unsigned: base(),
            credentials: vec![Credential::from_raw(vec![vec![1, 2, 3]])],
        };

        assert_ne!(unsigned.id().unwrap(), signed.id().unwrap());
        assert!(signed.to_hex().unwrap().starts_with("0x"));
        assert_eq!(signed.id().unwrap().as_str().len(), 64);
    }
}
