use serde::{Deserialize, Serialize};
use std::fmt;

/// Ownership state of one partition as seen by one host.
///
/// ```text
/// Unowned -> Acquiring -> Owned -> Renewing -> Owned
///                |          |          \-> LeaseLost -> Unowned
///                v          \-> Unowned (released, stopped, partition gone)
///             Unowned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PartitionState {
    #[default]
    Unowned,
    Acquiring,
    Owned,
    Renewing,
    LeaseLost,
}

impl PartitionState {
    pub fn can_transition_to(self, next: PartitionState) -> bool {
        use PartitionState::*;
        matches!(
            (self, next),
            (Unowned, Acquiring)
                | (Acquiring, Owned)
                | (Acquiring, Unowned)
                | (Owned, Renewing)
                | (Owned, LeaseLost)
                | (Owned, Unowned)
                | (Renewing, Owned)
                | (Renewing, LeaseLost)
                | (LeaseLost, Unowned)
        )
    }

    /// Owned or in the middle of a renewal.
    pub fn is_owned(self) -> bool {
        matches!(self, PartitionState::Owned | PartitionState::Renewing)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Unowned => "unowned",
            PartitionState::Acquiring => "acquiring",
            PartitionState::Owned => "owned",
            PartitionState::Renewing => "renewing",
            PartitionState::LeaseLost => "lease-lost",
        };
        f.write_str(name)
    }
}
