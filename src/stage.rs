use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// One step of the server-side enrichment pipeline a video goes through after
/// it is created by a bulk import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Metadata,
    Captions,
    Chapters,
    Complete,
    Error,
}

impl Stage {
    pub const PROGRESSION: [Stage; 5] = [
        Stage::Created,
        Stage::Metadata,
        Stage::Captions,
        Stage::Chapters,
        Stage::Complete,
    ];

    /// Position in the progression order. `Error` sits outside the order.
    pub fn rank(self) -> Option<u8> {
        match self {
            Stage::Created => Some(0),
            Stage::Metadata => Some(1),
            Stage::Captions => Some(2),
            Stage::Chapters => Some(3),
            Stage::Complete => Some(4),
            Stage::Error => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }

    pub fn nominal_progress(self) -> u8 {
        match self {
            Stage::Created => 0,
            Stage::Metadata => 25,
            Stage::Captions => 50,
            Stage::Chapters => 75,
            Stage::Complete => 100,
            Stage::Error => 0,
        }
    }

    /// Whether an update carrying `self` must be discarded because the entity
    /// is already recorded at `current`.
    ///
    /// `Error` always wins. Once an entity has errored it stays errored, so any
    /// later non-error update counts as stale.
    pub fn is_regression_from(self, current: Stage) -> bool {
        match (self.rank(), current.rank()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(incoming), Some(stored)) => incoming < stored,
        }
    }

    /// Highest non-terminal stage whose nominal progress has been reached.
    pub fn from_progress(progress: u8) -> Stage {
        Stage::PROGRESSION[..4]
            .iter()
            .rev()
            .copied()
            .find(|stage| progress >= stage.nominal_progress())
            .unwrap_or(Stage::Created)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Metadata => "metadata",
            Stage::Captions => "captions",
            Stage::Chapters => "chapters",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Created => "Queued",
            Stage::Metadata => "Fetching metadata",
            Stage::Captions => "Downloading captions",
            Stage::Chapters => "Building chapters",
            Stage::Complete => "Imported",
            Stage::Error => "Import failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "created" => Ok(Stage::Created),
            "metadata" => Ok(Stage::Metadata),
            "captions" => Ok(Stage::Captions),
            "chapters" => Ok(Stage::Chapters),
            "complete" => Ok(Stage::Complete),
            "error" => Ok(Stage::Error),
            other => Err(AppError::Parse(format!("unknown import stage: {other}"))),
        }
    }
}
