//! Transaction construction, signing, and submission

pub mod builder;
pub mod signer;
pub mod submitter;
pub mod transaction;

pub use builder::{BuildContext, SpendParams, TxBuilder};
pub use signer::sign;
pub use submitter::TransactionSubmitter;
pub use transaction::{
    Credential, SignedTx, TransferableInput, TransferableOutput, TxKind, UnsignedTx,
};
