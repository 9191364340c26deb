use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Last-known blocking status of a monitored domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainStatus {
    Blocked,
    NotBlocked,
    Unknown,
}

impl DomainStatus {
    /// Maps a reachable lookup verdict onto a status.
    pub fn from_blocked(blocked: bool) -> Self {
        if blocked {
            Self::Blocked
        } else {
            Self::NotBlocked
        }
    }

    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "BLOCKED",
            Self::NotBlocked => "NOT_BLOCKED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Human readable label used in notifications.
    pub fn label(self) -> &'static str {
        match self {
            Self::Blocked => "Blocked",
            Self::NotBlocked => "Not blocked",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainStatus {
    type Err = UnknownStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "BLOCKED" => Ok(Self::Blocked),
            "NOT_BLOCKED" => Ok(Self::NotBlocked),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(UnknownStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognised domain status {0:?}")]
pub struct UnknownStatusError(pub String);

/// A monitored (user, domain) pair together with its last observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub domain: String,
    pub current_status: DomainStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Creates a subscription that has never been checked.
    pub fn new(
        user_id: impl Into<String>,
        domain: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            domain: domain.into(),
            current_status: DomainStatus::Unknown,
            last_check: None,
            created_at,
        }
    }

    /// Returns a copy carrying a fresh observation.
    pub fn observed(&self, status: DomainStatus, at: DateTime<Utc>) -> Self {
        Self {
            current_status: status,
            last_check: Some(at),
            ..self.clone()
        }
    }
}

/// Outcome of one external lookup for a single domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub blocked: bool,
    /// `false` when the source could not be queried, as opposed to "queried and not blocked".
    pub reachable: bool,
}

impl CheckResult {
    pub fn observed(blocked: bool) -> Self {
        Self {
            blocked,
            reachable: true,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            blocked: false,
            reachable: false,
        }
    }

    /// Status implied by the result, or `None` when nothing was observed.
    pub fn status(self) -> Option<DomainStatus> {
        self.reachable.then(|| DomainStatus::from_blocked(self.blocked))
    }
}

/// Status transition observed for a subscription during a monitoring cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub user_id: String,
    pub domain: String,
    pub old_status: DomainStatus,
    pub new_status: DomainStatus,
    pub observed_at: DateTime<Utc>,
}

/// One recorded observation of a domain on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user_id: String,
    pub domain: String,
    pub status: DomainStatus,
    pub checked_at: DateTime<Utc>,
}

/// A domain a user keeps for quick re-checks without monitoring it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub user_id: String,
    pub domain: String,
    pub added_at: DateTime<Utc>,
}
