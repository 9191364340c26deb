use crate::types::{CheckResult, DomainStatus};

/// What a monitoring cycle should do with a subscription after one lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The lookup failed; keep the stored status and `last_check` untouched.
    Skip,
    /// First successful observation of a subscription stored as `Unknown`.
    Initialize(DomainStatus),
    /// Observation matches the stored status.
    Unchanged(DomainStatus),
    /// Observation differs from a previously known status.
    Changed {
        from: DomainStatus,
        to: DomainStatus,
    },
}

impl Transition {
    /// Status to persist, if any.
    pub fn next_status(self) -> Option<DomainStatus> {
        match self {
            Self::Skip => None,
            Self::Initialize(status) | Self::Unchanged(status) => Some(status),
            Self::Changed { to, .. } => Some(to),
        }
    }

    /// Whether the transition warrants a user notification.
    pub fn is_change(self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Decides the transition for a stored status given a fresh lookup result.
pub fn evaluate(current: DomainStatus, result: CheckResult) -> Transition {
    let Some(observed) = result.status() else {
        return Transition::Skip;
    };

    match current {
        DomainStatus::Unknown => Transition::Initialize(observed),
        known if known == observed => Transition::Unchanged(observed),
        known => Transition::Changed {
            from: known,
            to: observed,
        },
    }
}
