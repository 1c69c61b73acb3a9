//! Transfer phases and the persisted transfer record

use crate::error::{TransferError, TransferResult};
use crate::tx::SignedTx;
use crate::types::{Address, Amount, AssetId, TxId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Phase of a cross-chain transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    ExportBuilding,
    ExportSigned,
    ExportSubmitted,
    AwaitingPropagation,
    ImportBuilding,
    ImportSigned,
    ImportSubmitted,
    Done,
    ExportFailed,
    ImportFailed,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::Init,
        Phase::ExportBuilding,
        Phase::ExportSigned,
        Phase::ExportSubmitted,
        Phase::AwaitingPropagation,
        Phase::ImportBuilding,
        Phase::ImportSigned,
        Phase::ImportSubmitted,
        Phase::Done,
        Phase::ExportFailed,
        Phase::ImportFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::ExportBuilding => "export_building",
            Phase::ExportSigned => "export_signed",
            Phase::ExportSubmitted => "export_submitted",
            Phase::AwaitingPropagation => "awaiting_propagation",
            Phase::ImportBuilding => "import_building",
            Phase::ImportSigned => "import_signed",
            Phase::ImportSubmitted => "import_submitted",
            Phase::Done => "done",
            Phase::ExportFailed => "export_failed",
            Phase::ImportFailed => "import_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == value)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::ExportFailed | Phase::ImportFailed)
    }

    /// Leg a non-terminal phase belongs to
    pub fn leg(self) -> Leg {
        match self {
            Phase::Init
            | Phase::ExportBuilding
            | Phase::ExportSigned
            | Phase::ExportSubmitted
            | Phase::ExportFailed => Leg::Export,
            _ => Leg::Import,
        }
    }

    fn successor(self) -> Option<Phase> {
        match self {
            Phase::Init => Some(Phase::ExportBuilding),
            Phase::ExportBuilding => Some(Phase::ExportSigned),
            Phase::ExportSigned => Some(Phase::ExportSubmitted),
            Phase::ExportSubmitted => Some(Phase::AwaitingPropagation),
            Phase::AwaitingPropagation => Some(Phase::ImportBuilding),
            Phase::ImportBuilding => Some(Phase::ImportSigned),
            Phase::ImportSigned => Some(Phase::ImportSubmitted),
            Phase::ImportSubmitted => Some(Phase::Done),
            _ => None,
        }
    }

    pub fn can_transition_to(self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Phase::ExportFailed => self.leg() == Leg::Export,
            Phase::ImportFailed => self.leg() == Leg::Import,
            _ => self.successor() == Some(to),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half of a cross-chain transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Export,
    Import,
}

impl Leg {
    pub fn as_str(self) -> &'static str {
        match self {
            Leg::Export => "export",
            Leg::Import => "import",
        }
    }

    fn failed_phase(self) -> Phase {
        match self {
            Leg::Export => Phase::ExportFailed,
            Leg::Import => Phase::ImportFailed,
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transfer stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub leg: Leg,
    pub phase_reached: Phase,
    /// [`TransferError::kind`] of the cause
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

/// Everything needed to report on or resume a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub source_chain: String,
    pub destination_chain: String,
    pub asset_symbol: String,
    #[serde(with = "crate::types::amount_serde")]
    pub amount: Amount,
    pub recipient: Option<Address>,
    pub memo: Option<String>,
    pub phase: Phase,
    pub asset_id: Option<AssetId>,
    /// Signed export, kept so an interrupted submission replays the same payload
    pub export_payload: Option<SignedTx>,
    pub export_tx_id: Option<TxId>,
    pub import_payload: Option<SignedTx>,
    pub import_tx_id: Option<TxId>,
    #[serde(default, with = "crate::types::option_amount_serde")]
    pub received: Option<Amount>,
    pub failure: Option<FailureInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(
        source_chain: &str,
        destination_chain: &str,
        asset_symbol: &str,
        amount: Amount,
        recipient: Option<Address>,
        memo: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_chain: source_chain.to_string(),
            destination_chain: destination_chain.to_string(),
            asset_symbol: asset_symbol.to_string(),
            amount,
            recipient,
            memo,
            phase: Phase::Init,
            asset_id: None,
            export_payload: None,
            export_tx_id: None,
            import_payload: None,
            import_tx_id: None,
            received: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to the next phase
    pub fn advance(&mut self, to: Phase) -> TransferResult<()> {
        if !self.phase.can_transition_to(to) {
            return Err(TransferError::InvalidStateTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter the failed state of the current leg
    pub fn fail(&mut self, cause: &TransferError) -> Leg {
        let leg = self.phase.leg();
        if !self.phase.is_terminal() {
            self.failure = Some(FailureInfo {
                leg,
                phase_reached: self.phase,
                kind: cause.kind().to_string(),
                message: cause.to_string(),
                retryable: cause.is_retryable(),
            });
            self.phase = leg.failed_phase();
            self.updated_at = Utc::now();
        }
        leg
    }

    /// Phase a resumed run would restart from, if resuming is safe.
    ///
    /// A rejected export is final. Anything after a submitted export resumes
    /// without exporting again.
    pub fn resume_phase(&self) -> Option<Phase> {
        let failure = self.failure.as_ref();
        let rejected = failure.map(|f| f.kind == "rejected").unwrap_or(false);
        let retryable = failure.map(|f| f.retryable || f.kind == "cancelled").unwrap_or(true);

        match self.phase {
            Phase::Done => None,
            Phase::Init | Phase::ExportBuilding => Some(Phase::Init),
            Phase::ExportSigned if self.export_payload.is_some() => Some(Phase::ExportSigned),
            Phase::ExportSigned => Some(Phase::Init),
            Phase::ExportSubmitted => Some(Phase::ExportSubmitted),
            Phase::AwaitingPropagation | Phase::ImportBuilding => {
                Some(Phase::AwaitingPropagation)
            }
            Phase::ImportSigned if self.import_payload.is_some() => Some(Phase::ImportSigned),
            Phase::ImportSigned => Some(Phase::AwaitingPropagation),
            Phase::ImportSubmitted => Some(Phase::ImportSubmitted),
            Phase::ExportFailed => {
                if rejected {
                    None
                } else if self.export_tx_id.is_some() {
                    Some(Phase::ExportSubmitted)
                } else if self.export_payload.is_some() && retryable {
                    // Outcome of the submission is unknown; replay it
                    Some(Phase::ExportSigned)
                } else if retryable && self.export_payload.is_none() {
                    // Nothing reached the chain yet
                    Some(Phase::Init)
                } else {
                    None
                }
            }
            Phase::ImportFailed => {
                if self.import_tx_id.is_some() && !rejected {
                    Some(Phase::ImportSubmitted)
                } else if self.import_payload.is_some() && self.import_tx_id.is_none() && retryable
                {
                    Some(Phase::ImportSigned)
                } else {
                    Some(Phase::AwaitingPropagation)
                }
            }
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.resume_phase().is_some()
    }

    /// Reset to the resume phase, dropping state the rerun recreates
    pub fn reopen(&mut self) -> TransferResult<Phase> {
        let phase = self
            .resume_phase()
            .ok_or_else(|| TransferError::InvalidStateTransition {
                from: self.phase.to_string(),
                to: "resume".to_string(),
            })?;

        match phase {
            Phase::Init => {
                self.export_payload = None;
                self.export_tx_id = None;
            }
            Phase::AwaitingPropagation => {
                self.import_payload = None;
                self.import_tx_id = None;
            }
            _ => {}
        }

        self.phase = phase;
        self.failure = None;
        self.updated_at = Utc::now();
        Ok(phase)
    }
}
