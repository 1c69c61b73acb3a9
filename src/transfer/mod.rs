//! Value transfers
//!
//! Handles:
//! - Cross-chain export/import with checkpointed phases and resumption
//! - Concurrent transfers over shared keys
//! - Same-chain sends

mod locks;
mod orchestrator;
mod send;
mod state;

pub use locks::BuildLocks;
pub use orchestrator::{
    TransferFailure, TransferOrchestrator, TransferOutcome, TransferParties, TransferReceipt,
    TransferRequest,
};
pub use send::{SendReceipt, SendRequest};
pub use state::{FailureInfo, Leg, Phase, TransferRecord};
