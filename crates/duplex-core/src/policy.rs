//! Conflict-resolution policy
//!
//! Cross-contour concurrent writes to the same row are resolved by the
//! monotonic per-row `version`. The policy only comes into play on the
//! conflict paths: an INSERT landing on an existing row, or an UPDATE
//! whose incoming version does not exceed the committed one.

use serde::{Deserialize, Serialize};

/// How the applier resolves a row conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Higher version wins; ties keep the existing row
    #[default]
    LastWriteWins,
    /// Never overwrite on conflict
    Skip,
    /// Surface the conflict as a processing failure
    Error,
}

/// Outcome of a policy decision over `(existing, incoming)` versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Overwrite the existing row with the incoming image
    Apply,
    /// Keep the existing row, acknowledge the event
    Skip,
    /// Fail the message; the bus redelivers until an operator intervenes
    Fail,
}

impl ConflictPolicy {
    /// Decide a conflict between the committed and the incoming version.
    ///
    /// Under `last_write_wins` a strictly higher incoming version applies;
    /// equal versions keep the existing row so both contours converge
    /// deterministically on replay.
    pub fn decide(&self, existing: i64, incoming: i64) -> ConflictDecision {
        match self {
            ConflictPolicy::LastWriteWins => {
                if incoming > existing {
                    ConflictDecision::Apply
                } else {
                    ConflictDecision::Skip
                }
            }
            ConflictPolicy::Skip => ConflictDecision::Skip,
            ConflictPolicy::Error => ConflictDecision::Fail,
        }
    }

    /// Wire name as it appears in configuration documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriteWins => "last_write_wins",
            ConflictPolicy::Skip => "skip",
            ConflictPolicy::Error => "error",
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
