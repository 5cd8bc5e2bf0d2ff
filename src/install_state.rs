//! Install State Machine
//!
//! Tracks one (application, kind) pair through an install or uninstall and
//! refuses transitions that would skip a step.
//!
//! # Design Principles
//!
//! - **Validated Transitions**: only the edges below are allowed
//! - **No Global State**: each install owns its tracker
//! - **Fail Fast**: invalid transitions return errors immediately
//!
//! # Stage Flow
//!
//! ```text
//! NotInstalled ──stage──▶ Staged ──place──▶ Installed
//!      ▲                    │                   │
//!      └────rollback────────┘                   │
//!      └──────────────────uninstall─────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Install stages of one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStage {
    /// No file and no record
    NotInstalled,

    /// Rendered text written to the staging directory
    Staged,

    /// Placed at the target, activated and recorded
    Installed,
}

impl InstallStage {
    /// The stage an install moves to next, or None once installed
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotInstalled => Some(Self::Staged),
            Self::Staged => Some(Self::Installed),
            Self::Installed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotInstalled => "not installed",
            Self::Staged => "staged",
            Self::Installed => "installed",
        }
    }

    /// Whether `self -> target` is an edge of the state machine
    pub const fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::NotInstalled, Self::Staged)
                | (Self::Staged, Self::Installed)
                | (Self::Staged, Self::NotInstalled)
                | (Self::Installed, Self::NotInstalled)
        )
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallTransitionError {
    /// Attempted to skip staging
    #[error("Cannot skip from {from} to {to} (the artifact must be staged first)")]
    SkippedStage { from: InstallStage, to: InstallStage },

    /// Attempted an edge that does not exist
    #[error("Cannot go from {from} to {to}")]
    InvalidTransition { from: InstallStage, to: InstallStage },

    /// Attempted to transition to the same state
    #[error("Already {stage}")]
    AlreadyAtStage { stage: InstallStage },
}

/// Current stage of one artifact.
#[derive(Debug, Clone)]
pub struct InstallTracker {
    current: InstallStage,
}

impl Default for InstallTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallTracker {
    /// A tracker for an artifact that is not installed.
    pub fn new() -> Self {
        Self::at(InstallStage::NotInstalled)
    }

    /// A tracker for an artifact known to be at `stage`, e.g. from its record.
    pub fn at(stage: InstallStage) -> Self {
        Self { current: stage }
    }

    #[inline]
    pub fn current_stage(&self) -> InstallStage {
        self.current
    }

    /// Transition to `target`.
    ///
    /// # Errors
    ///
    /// - `AlreadyAtStage` if target is the current stage
    /// - `SkippedStage` for `NotInstalled -> Installed`
    /// - `InvalidTransition` for any other edge the machine lacks
    pub fn transition_to(&mut self, target: InstallStage) -> Result<InstallStage, InstallTransitionError> {
        if target == self.current {
            return Err(InstallTransitionError::AlreadyAtStage { stage: target });
        }
        if !self.current.can_transition_to(target) {
            let from = self.current;
            return Err(match (from, target) {
                (InstallStage::NotInstalled, InstallStage::Installed) => {
                    InstallTransitionError::SkippedStage { from, to: target }
                }
                _ => InstallTransitionError::InvalidTransition { from, to: target },
            });
        }

        tracing::debug!("Install stage {} -> {}", self.current, target);
        self.current = target;
        Ok(target)
    }

    /// Move forward one stage.
    pub fn advance(&mut self) -> Result<InstallStage, InstallTransitionError> {
        match self.current.next() {
            Some(next) => self.transition_to(next),
            None => Err(InstallTransitionError::AlreadyAtStage {
                stage: self.current,
            }),
        }
    }

    /// Drop a staged artifact after a failed placement.
    pub fn roll_back(&mut self) -> Result<InstallStage, InstallTransitionError> {
        match self.current {
            InstallStage::Staged => self.transition_to(InstallStage::NotInstalled),
            from => Err(InstallTransitionError::InvalidTransition {
                from,
                to: InstallStage::NotInstalled,
            }),
        }
    }
}

impl From<InstallTransitionError> for crate::error::SiteUnitError {
    fn from(err: InstallTransitionError) -> Self {
        crate::error::SiteUnitError::InstallTransition(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SiteUnitError;

    // =========================================================================
    // Stage Tests
    // =========================================================================

    #[test]
    fn test_stage_next() {
        assert_eq!(InstallStage::NotInstalled.next(), Some(InstallStage::Staged));
        assert_eq!(InstallStage::Staged.next(), Some(InstallStage::Installed));
        assert_eq!(InstallStage::Installed.next(), None);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(InstallStage::NotInstalled.to_string(), "not installed");
        assert_eq!(InstallStage::Installed.to_string(), "installed");
    }

    // =========================================================================
    // Tracker Tests
    // =========================================================================

    #[test]
    fn test_install_path() {
        let mut tracker = InstallTracker::new();
        assert_eq!(tracker.advance().unwrap(), InstallStage::Staged);
        assert_eq!(tracker.advance().unwrap(), InstallStage::Installed);
        assert_eq!(tracker.current_stage(), InstallStage::Installed);
        assert!(tracker.advance().is_err());
    }

    #[test]
    fn test_cannot_skip_staging() {
        let mut tracker = InstallTracker::new();
        let err = tracker.transition_to(InstallStage::Installed).unwrap_err();
        assert!(matches!(err, InstallTransitionError::SkippedStage { .. }));
        assert_eq!(tracker.current_stage(), InstallStage::NotInstalled);
    }

    #[test]
    fn test_rollback_only_from_staged() {
        let mut tracker = InstallTracker::new();
        assert!(tracker.roll_back().is_err());
        tracker.advance().unwrap();
        assert_eq!(tracker.roll_back().unwrap(), InstallStage::NotInstalled);
    }

    #[test]
    fn test_uninstall_from_installed() {
        let mut tracker = InstallTracker::at(InstallStage::Installed);
        assert!(tracker.transition_to(InstallStage::Staged).is_err());
        assert_eq!(
            tracker.transition_to(InstallStage::NotInstalled).unwrap(),
            InstallStage::NotInstalled
        );
        assert!(matches!(
            tracker.transition_to(InstallStage::NotInstalled),
            Err(InstallTransitionError::AlreadyAtStage { .. })
        ));
    }

    #[test]
    fn test_error_conversion() {
        let err: SiteUnitError = InstallTransitionError::AlreadyAtStage {
            stage: InstallStage::Installed,
        }
        .into();
        assert!(matches!(err, SiteUnitError::InstallTransition(msg) if msg == "Already installed"));
    }
}
