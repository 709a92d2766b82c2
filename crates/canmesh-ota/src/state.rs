//! The OTA update state machine.

use serde::{Deserialize, Serialize};

/// States of the per-ECU update pipeline.
///
/// The transitions form a DAG with only `Failure → Rollback → Idle` and
/// `Success → Idle` cycling back to the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UpdateState {
    /// No update in flight.
    #[default]
    Idle,
    /// An advertised version exceeds the installed one.
    UpdateAvailable,
    /// Fetching the image from the update source.
    Downloading,
    /// Sending segments over the mesh.
    Distributing,
    /// Writing the image to the platform partition.
    Applying,
    /// The update committed; the installed version was bumped.
    Success,
    /// A pipeline step failed terminally.
    Failure,
    /// Restoring the previously installed image.
    Rollback,
}

impl UpdateState {
    /// Whether the pipeline is between `UpdateAvailable` and resolution.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UpdateState::UpdateAvailable
                | UpdateState::Downloading
                | UpdateState::Distributing
                | UpdateState::Applying
        )
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdateState::Idle => "idle",
            UpdateState::UpdateAvailable => "update-available",
            UpdateState::Downloading => "downloading",
            UpdateState::Distributing => "distributing",
            UpdateState::Applying => "applying",
            UpdateState::Success => "success",
            UpdateState::Failure => "failure",
            UpdateState::Rollback => "rollback",
        };
        f.write_str(name)
    }
}
