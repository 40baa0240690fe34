// Catalog entry status state machine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Sync lifecycle of a discovered source table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogStatus {
    Pending,
    FullLoad,
    ListeningChanges,
    NoData,
    Skip,
    Error,
}

impl CatalogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogStatus::Pending => "PENDING",
            CatalogStatus::FullLoad => "FULL_LOAD",
            CatalogStatus::ListeningChanges => "LISTENING_CHANGES",
            CatalogStatus::NoData => "NO_DATA",
            CatalogStatus::Skip => "SKIP",
            CatalogStatus::Error => "ERROR",
        }
    }

    /// Legal transitions of the sync lifecycle. Hygiene and reset paths use
    /// this to refuse surprising moves instead of silently corrupting state.
    pub fn can_transition_to(&self, next: CatalogStatus) -> bool {
        use CatalogStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Pending, FullLoad)
                | (Pending, Skip)
                | (FullLoad, ListeningChanges)
                | (FullLoad, NoData)
                | (FullLoad, Error)
                | (ListeningChanges, FullLoad)
                | (ListeningChanges, Error)
                | (NoData, ListeningChanges)
                | (Skip, Pending)
                | (Error, FullLoad)
        )
    }
}

impl FromStr for CatalogStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(CatalogStatus::Pending),
            "FULL_LOAD" => Ok(CatalogStatus::FullLoad),
            "LISTENING_CHANGES" => Ok(CatalogStatus::ListeningChanges),
            "NO_DATA" => Ok(CatalogStatus::NoData),
            "SKIP" => Ok(CatalogStatus::Skip),
            "ERROR" => Ok(CatalogStatus::Error),
            other => Err(CoreError::config(format!("unknown catalog status: {other}"))),
        }
    }
}

impl fmt::Display for CatalogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        for status in [
            CatalogStatus::Pending,
            CatalogStatus::FullLoad,
            CatalogStatus::ListeningChanges,
            CatalogStatus::NoData,
            CatalogStatus::Skip,
            CatalogStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<CatalogStatus>().unwrap(), status);
        }
    }

    #[test]
    fn lifecycle_transitions() {
        use CatalogStatus::*;
        assert!(Pending.can_transition_to(FullLoad));
        assert!(Pending.can_transition_to(Skip));
        assert!(FullLoad.can_transition_to(ListeningChanges));
        assert!(FullLoad.can_transition_to(NoData));
        assert!(ListeningChanges.can_transition_to(FullLoad));
        assert!(NoData.can_transition_to(ListeningChanges));
        assert!(Skip.can_transition_to(Pending));
        assert!(Error.can_transition_to(FullLoad));

        assert!(!Pending.can_transition_to(ListeningChanges));
        assert!(!NoData.can_transition_to(FullLoad));
        assert!(!Skip.can_transition_to(ListeningChanges));
    }
}
