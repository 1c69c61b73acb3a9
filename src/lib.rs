//! Interchain Transfer - atomic value movement between UTXO chains
//!
//! A transfer exports value from a source chain into shared atomic memory,
//! waits for the destination chain to see it, and imports it there. Every
//! phase is checkpointed so an interrupted transfer resumes without
//! exporting twice.

pub mod asset;
pub mod cancel;
pub mod chain;
pub mod config;
pub mod error;
pub mod keychain;
pub mod metrics;
pub mod query;
pub mod state;
pub mod transfer;
pub mod tx;
pub mod types;
pub mod utxo;

pub use error::{TransferError, TransferResult};
