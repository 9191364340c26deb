pub mod transition;
pub mod types;

pub use transition::{evaluate, Transition};
pub use types::{
    Bookmark, ChangeEvent, CheckResult, DomainStatus, HistoryEntry, Subscription,
    UnknownStatusError,
};

/// Canonical form of a user supplied domain.
///
/// Any non-empty string is accepted; the value is only trimmed, lower-cased and
/// stripped of a single trailing dot so that `Example.COM.` and `example.com`
/// address the same subscription.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed).trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}
