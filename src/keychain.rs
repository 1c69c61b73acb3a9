//! Chain-scoped keychains and the credential store
//!
//! The same private key yields a different address on every chain because
//! addresses carry the chain alias. One keychain exists per chain.

use crate::config::CredentialsConfig;
use crate::error::{TransferError, TransferResult};
use crate::types::Address;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Signature, H160, H256};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Ordered set of private keys for one chain
#[derive(Clone)]
pub struct KeyChain {
    alias: String,
    keys: Vec<(Address, LocalWallet)>,
}

impl KeyChain {
    /// Create an empty keychain for a chain alias
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            keys: Vec::new(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Import a hex-encoded secp256k1 private key, returning its address
    pub fn import_key(&mut self, private_key: &str) -> TransferResult<Address> {
        let wallet = private_key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| TransferError::Credentials(format!("Invalid private key: {}", e)))?;

        let address = chain_address(&self.alias, wallet.address());
        if !self.contains(&address) {
            debug!("Imported key for {}", address);
            self.keys.push((address.clone(), wallet));
        }
        Ok(address)
    }

    /// Addresses in import order
    pub fn addresses(&self) -> Vec<Address> {
        self.keys.iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.keys.iter().any(|(a, _)| a == address)
    }

    /// Sign a 32-byte digest with the key owning `address`
    pub fn sign_digest(&self, address: &Address, digest: [u8; 32]) -> TransferResult<Vec<u8>> {
        let wallet = self
            .keys
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, w)| w)
            .ok_or_else(|| TransferError::MissingKey {
                address: address.clone(),
            })?;

        let signature = wallet
            .sign_hash(H256::from(digest))
            .map_err(|e| TransferError::Signing(e.to_string()))?;
        Ok(signature.to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for KeyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyChain")
            .field("alias", &self.alias)
            .field("addresses", &self.addresses())
            .finish()
    }
}

/// Address of a key on a specific chain
pub fn chain_address(alias: &str, key_address: H160) -> Address {
    Address::new(format!("{}-0x{}", alias, hex::encode(key_address.as_bytes())))
}

/// Recover the chain address that produced `signature` over `digest`
pub fn recover_signer(alias: &str, digest: [u8; 32], signature: &[u8]) -> TransferResult<Address> {
    let signature = Signature::try_from(signature)
        .map_err(|e| TransferError::Signing(format!("Malformed signature: {}", e)))?;
    let signer = signature
        .recover(H256::from(digest))
        .map_err(|e| TransferError::Signing(format!("Unrecoverable signature: {}", e)))?;
    Ok(chain_address(alias, signer))
}

/// Persisted keypair file
#[derive(Debug, Clone, Deserialize)]
pub struct StoredKeypair {
    pub privkey: String,
    #[serde(default)]
    pub pubkey: Option<String>,
}

/// Read the keypair JSON file
pub fn load_keypair(path: &Path) -> TransferResult<StoredKeypair> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        TransferError::Credentials(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&data).map_err(|e| {
        TransferError::Credentials(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Load the private key from the environment (if configured) or the keypair file
pub fn load_private_key(config: &CredentialsConfig) -> TransferResult<String> {
    if let Some(var) = &config.private_key_env {
        if let Ok(key) = std::env::var(var) {
            info!("Using private key from ${}", var);
            return Ok(key);
        }
    }

    let keypair = load_keypair(Path::new(&config.keypair_path))?;
    info!("Loaded keypair from {}", config.keypair_path);
    Ok(keypair.privkey)
}

/// Import one private key into a keychain per chain alias
pub fn keychains_for(aliases: &[&str], private_key: &str) -> TransferResult<Vec<KeyChain>> {
    aliases
        .iter()
        .map(|alias| {
            let mut keychain = KeyChain::new(*alias);
            keychain.import_key(private_key)?;
            Ok(keychain)
        })
        .collect()
}
