use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A mounted removable volume as seen by the last enumeration.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeDescriptor {
    /// Mount path or drive letter, e.g. `/media/user/SD` or `E:\`.
    pub id: String,
    pub label: String,
    pub capacity_bytes: u64,
}

impl VolumeDescriptor {
    pub fn capacity_gb(&self) -> f64 {
        self.capacity_bytes as f64 / BYTES_PER_GB
    }

    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.id)
    }
}

impl fmt::Display for VolumeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub ok: bool,
    pub reason: String,
    /// The root could not be listed; a reformat may recover the volume.
    pub is_corrupt: bool,
}

impl ValidationVerdict {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: "OK".to_string(),
            is_corrupt: false,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            is_corrupt: false,
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            is_corrupt: true,
        }
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    RecoveringCorruption,
    Clearing,
    Copying,
    Formatting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::RecoveringCorruption => "recovering corruption",
            Self::Clearing => "clearing",
            Self::Copying => "copying",
            Self::Formatting => "formatting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Idle,
    Validating,
    RecoveringCorruption,
    Clearing,
    Copying,
    Formatting,
    Done(CopySummary),
    Failed { stage: Stage, reason: String },
}

impl TransferState {
    /// True for every state in which a new operation may start.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Idle | Self::Done(_) | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopySummary {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    pub finished_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Done(CopySummary),
    Failed { stage: Stage, reason: String },
}

impl TransferOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

impl From<&TransferOutcome> for TransferState {
    fn from(outcome: &TransferOutcome) -> Self {
        match outcome {
            TransferOutcome::Done(summary) => Self::Done(summary.clone()),
            TransferOutcome::Failed { stage, reason } => Self::Failed {
                stage: *stage,
                reason: reason.clone(),
            },
        }
    }
}

/// Result of one invocation of the OS format facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOutcome {
    pub success: bool,
    /// Output of the format tool, or the reason it could not run.
    pub diagnostic: String,
}
