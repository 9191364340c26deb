use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use domwatch_core::{normalize_domain, Bookmark, DomainStatus, HistoryEntry, Subscription};
use domwatch_storage::{
    BookmarkInsert, BookmarkStore, HistoryStore, StoreError, SubscriptionStore,
};
use domwatch_upstream::{StatusChecker, MAX_BATCH_DOMAINS};

use crate::engine::Clock;

/// Bookmarks a single user may keep.
pub const BOOKMARK_LIMIT: u32 = 20;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("domain must not be empty")]
    InvalidDomain,
    #[error("subscription limit of {limit} reached")]
    LimitReached { limit: u32 },
    #[error("bookmark limit of {limit} reached")]
    BookmarkLimitReached { limit: u32 },
    #[error("at most {max} domains can be checked at once")]
    TooManyDomains { max: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeOutcome {
    pub subscription: Subscription,
    /// `false` when an existing subscription was refreshed.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookmarkOutcome {
    pub bookmark: Bookmark,
    /// `false` when the domain was already bookmarked.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainCheck {
    pub domain: String,
    pub status: DomainStatus,
    pub reachable: bool,
}

/// User initiated operations that bypass the monitoring cycle.
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    history: Arc<dyn HistoryStore>,
    bookmarks: Arc<dyn BookmarkStore>,
    checker: Arc<dyn StatusChecker>,
    limit: u32,
    clock: Clock,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        history: Arc<dyn HistoryStore>,
        bookmarks: Arc<dyn BookmarkStore>,
        checker: Arc<dyn StatusChecker>,
        limit: u32,
    ) -> Self {
        Self {
            store,
            history,
            bookmarks,
            checker,
            limit,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Subscribes `user_id` to `raw_domain`, storing a fresh status snapshot.
    ///
    /// Re-subscribing refreshes the existing row and is never refused by the cap.
    /// An unreachable lookup leaves a new subscription `Unknown` so the first
    /// monitoring cycle initializes it silently.
    pub async fn subscribe(
        &self,
        user_id: &str,
        raw_domain: &str,
    ) -> Result<SubscribeOutcome, ServiceError> {
        let domain = normalize_domain(raw_domain).ok_or(ServiceError::InvalidDomain)?;
        let existing = self.store.get(user_id, &domain).await?;
        // Early refusal spares the lookup; the insert below enforces the cap.
        if existing.is_none() && self.store.count_for_user(user_id).await? >= self.limit {
            return Err(ServiceError::LimitReached { limit: self.limit });
        }

        let result = self.checker.check(&domain).await;
        let now = (self.clock)();
        let created = existing.is_none();
        let base = existing.unwrap_or_else(|| Subscription::new(user_id, domain.clone(), now));
        let subscription = match result.status() {
            Some(status) => base.observed(status, now),
            None => base,
        };

        if created {
            if !self.store.insert_within_limit(&subscription, self.limit).await? {
                return Err(ServiceError::LimitReached { limit: self.limit });
            }
        } else {
            self.store.upsert(&subscription).await?;
        }
        if let Some(status) = result.status() {
            self.record_history(user_id, &domain, status, now).await;
        }
        info!(
            stage = "app",
            %user_id,
            domain = %subscription.domain,
            status = %subscription.current_status,
            created,
            "subscription saved"
        );
        Ok(SubscribeOutcome {
            subscription,
            created,
        })
    }

    pub async fn unsubscribe(&self, user_id: &str, raw_domain: &str) -> Result<bool, ServiceError> {
        let domain = normalize_domain(raw_domain).ok_or(ServiceError::InvalidDomain)?;
        let removed = self.store.delete(user_id, &domain).await?;
        info!(stage = "app", %user_id, %domain, removed, "unsubscribe processed");
        Ok(removed)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Subscription>, ServiceError> {
        Ok(self.store.list_for_user(user_id).await?)
    }

    /// One-off batch check; results are returned in input order.
    ///
    /// Subscriptions are never touched. When `user_id` is given, reachable
    /// results are appended to that user's history.
    pub async fn recheck(
        &self,
        user_id: Option<&str>,
        raw_domains: &[String],
    ) -> Result<Vec<DomainCheck>, ServiceError> {
        let mut domains: Vec<String> = Vec::with_capacity(raw_domains.len());
        for raw in raw_domains {
            let domain = normalize_domain(raw).ok_or(ServiceError::InvalidDomain)?;
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        if domains.is_empty() {
            return Err(ServiceError::InvalidDomain);
        }
        if domains.len() > MAX_BATCH_DOMAINS {
            return Err(ServiceError::TooManyDomains {
                max: MAX_BATCH_DOMAINS,
            });
        }

        let results = self.checker.check_many(&domains).await;
        let now = (self.clock)();
        let mut checks = Vec::with_capacity(domains.len());
        for domain in domains {
            let status = results.get(&domain).and_then(|result| result.status());
            if let (Some(user_id), Some(status)) = (user_id, status) {
                self.record_history(user_id, &domain, status, now).await;
            }
            checks.push(DomainCheck {
                status: status.unwrap_or(DomainStatus::Unknown),
                reachable: status.is_some(),
                domain,
            });
        }
        Ok(checks)
    }

    /// Most recent observations for `user_id`, newest first.
    pub async fn history(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, ServiceError> {
        Ok(self.history.recent_for_user(user_id, limit).await?)
    }

    pub async fn bookmark(
        &self,
        user_id: &str,
        raw_domain: &str,
    ) -> Result<BookmarkOutcome, ServiceError> {
        let domain = normalize_domain(raw_domain).ok_or(ServiceError::InvalidDomain)?;
        let bookmark = Bookmark {
            user_id: user_id.to_string(),
            domain,
            added_at: (self.clock)(),
        };
        let created = match self.bookmarks.add(&bookmark, BOOKMARK_LIMIT).await? {
            BookmarkInsert::Added => true,
            BookmarkInsert::AlreadyPresent => false,
            BookmarkInsert::LimitReached => {
                return Err(ServiceError::BookmarkLimitReached {
                    limit: BOOKMARK_LIMIT,
                });
            }
        };
        info!(stage = "app", %user_id, domain = %bookmark.domain, created, "bookmark saved");
        Ok(BookmarkOutcome { bookmark, created })
    }

    pub async fn unbookmark(&self, user_id: &str, raw_domain: &str) -> Result<bool, ServiceError> {
        let domain = normalize_domain(raw_domain).ok_or(ServiceError::InvalidDomain)?;
        Ok(self.bookmarks.remove(user_id, &domain).await?)
    }

    pub async fn bookmarks(&self, user_id: &str) -> Result<Vec<Bookmark>, ServiceError> {
        Ok(self.bookmarks.list_for_user(user_id).await?)
    }

    async fn record_history(
        &self,
        user_id: &str,
        domain: &str,
        status: DomainStatus,
        checked_at: DateTime<Utc>,
    ) {
        let entry = HistoryEntry {
            user_id: user_id.to_string(),
            domain: domain.to_string(),
            status,
            checked_at,
        };
        if let Err(err) = self.history.record(&entry).await {
            warn!(stage = "storage", %user_id, %domain, error = %err, "failed to append check history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone};
    use domwatch_core::CheckResult;

    use crate::testing::{MemoryStore, ScriptedChecker};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0)
            .single()
            .expect("timestamp")
    }

    fn service(
        store: Arc<MemoryStore>,
        checker: Arc<ScriptedChecker>,
        limit: u32,
    ) -> SubscriptionService {
        SubscriptionService::new(store.clone(), store.clone(), store, checker, limit)
            .with_clock(Arc::new(|| at(10)))
    }

    #[tokio::test]
    async fn subscribe_normalizes_and_records_snapshot() {
        let store = Arc::new(MemoryStore::default());
        let checker = Arc::new(ScriptedChecker::default());
        checker.set("example.com", CheckResult::observed(true));

        let outcome = service(store.clone(), checker, 10)
            .subscribe("u1", " Example.COM. ")
            .await
            .expect("subscribe");

        assert!(outcome.created);
        assert_eq!(outcome.subscription.domain, "example.com");
        assert_eq!(outcome.subscription.current_status, DomainStatus::Blocked);
        assert_eq!(outcome.subscription.last_check, Some(at(10)));
        assert_eq!(store.snapshot("u1", "example.com"), Some(outcome.subscription));
        assert_eq!(
            store.history(),
            vec![HistoryEntry {
                user_id: "u1".to_string(),
                domain: "example.com".to_string(),
                status: DomainStatus::Blocked,
                checked_at: at(10),
            }]
        );
    }

    #[tokio::test]
    async fn unreachable_lookup_stores_unknown() {
        let store = Arc::new(MemoryStore::default());
        let outcome = service(store.clone(), Arc::new(ScriptedChecker::default()), 10)
            .subscribe("u1", "a.test")
            .await
            .expect("subscribe");

        assert_eq!(outcome.subscription.current_status, DomainStatus::Unknown);
        assert_eq!(outcome.subscription.last_check, None);
        assert!(store.history().is_empty());
    }

    #[tokio::test]
    async fn cap_applies_to_new_pairs_only() {
        let store = Arc::new(MemoryStore::default());
        store.seed(Subscription::new("u1", "a.test", at(1)));
        store.seed(Subscription::new("u1", "b.test", at(2)));
        let service = service(store.clone(), Arc::new(ScriptedChecker::default()), 2);

        let err = service
            .subscribe("u1", "c.test")
            .await
            .expect_err("cap reached");
        assert!(matches!(err, ServiceError::LimitReached { limit: 2 }));

        let refreshed = service
            .subscribe("u1", "A.test")
            .await
            .expect("re-subscribe allowed");
        assert!(!refreshed.created);
        assert_eq!(refreshed.subscription.created_at, at(1));

        service
            .subscribe("u2", "c.test")
            .await
            .expect("other users unaffected");
    }

    #[tokio::test]
    async fn concurrent_subscribes_cannot_exceed_cap() {
        let store = Arc::new(MemoryStore::default());
        let checker =
            Arc::new(ScriptedChecker::default().with_delay(Duration::from_millis(50)));
        let service = service(store.clone(), checker, 1);

        let (first, second) = tokio::join!(
            service.subscribe("u1", "a.test"),
            service.subscribe("u1", "b.test")
        );

        let accepted = [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        assert_eq!(accepted, 1);
        let refused = if first.is_err() { first } else { second };
        assert!(matches!(refused, Err(ServiceError::LimitReached { limit: 1 })));
        assert_eq!(store.all().len(), 1);
    }

    #[tokio::test]
    async fn history_failure_does_not_fail_subscribe() {
        let store = Arc::new(MemoryStore::default());
        store.fail_history(true);
        let checker = Arc::new(ScriptedChecker::default());
        checker.set("a.test", CheckResult::observed(false));

        let outcome = service(store.clone(), checker, 10)
            .subscribe("u1", "a.test")
            .await
            .expect("subscribe");
        assert_eq!(outcome.subscription.current_status, DomainStatus::NotBlocked);
        assert!(store.snapshot("u1", "a.test").is_some());
    }

    #[tokio::test]
    async fn empty_domain_is_rejected() {
        let service = service(
            Arc::new(MemoryStore::default()),
            Arc::new(ScriptedChecker::default()),
            10,
        );
        assert!(matches!(
            service.subscribe("u1", "  ").await,
            Err(ServiceError::InvalidDomain)
        ));
        assert!(matches!(
            service.unsubscribe("u1", ".").await,
            Err(ServiceError::InvalidDomain)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_and_list() {
        let store = Arc::new(MemoryStore::default());
        store.seed(Subscription::new("u1", "a.test", at(1)));
        store.seed(Subscription::new("u1", "b.test", at(2)));
        let service = service(store, Arc::new(ScriptedChecker::default()), 10);

        let listed: Vec<_> = service
            .list("u1")
            .await
            .expect("list")
            .into_iter()
            .map(|s| s.domain)
            .collect();
        assert_eq!(listed, vec!["b.test", "a.test"]);

        assert!(service.unsubscribe("u1", "A.TEST").await.expect("delete"));
        assert!(!service.unsubscribe("u1", "a.test").await.expect("delete"));
        assert_eq!(service.list("u1").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn recheck_dedupes_and_keeps_order() {
        let store = Arc::new(MemoryStore::default());
        let checker = Arc::new(ScriptedChecker::default());
        checker.set("b.test", CheckResult::observed(false));
        checker.set("a.test", CheckResult::observed(true));
        let service = service(store.clone(), checker.clone(), 10);

        let checks = service
            .recheck(None, &[
                "B.test".to_string(),
                "a.test".to_string(),
                "b.test".to_string(),
                "gone.test".to_string(),
            ])
            .await
            .expect("recheck");

        assert_eq!(
            checks,
            vec![
                DomainCheck {
                    domain: "b.test".to_string(),
                    status: DomainStatus::NotBlocked,
                    reachable: true,
                },
                DomainCheck {
                    domain: "a.test".to_string(),
                    status: DomainStatus::Blocked,
                    reachable: true,
                },
                DomainCheck {
                    domain: "gone.test".to_string(),
                    status: DomainStatus::Unknown,
                    reachable: false,
                },
            ]
        );
        assert!(store.all().is_empty());
        assert!(store.history().is_empty());
    }

    #[tokio::test]
    async fn recheck_for_a_user_records_reachable_results() {
        let store = Arc::new(MemoryStore::default());
        let checker = Arc::new(ScriptedChecker::default());
        checker.set("a.test", CheckResult::observed(true));
        let service = service(store.clone(), checker, 10);

        service
            .recheck(Some("u1"), &["a.test".to_string(), "gone.test".to_string()])
            .await
            .expect("recheck");

        let recent = service.history("u1", 20).await.expect("history");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].domain, "a.test");
        assert_eq!(recent[0].status, DomainStatus::Blocked);
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn bookmarks_are_normalized_and_deduplicated() {
        let service = service(
            Arc::new(MemoryStore::default()),
            Arc::new(ScriptedChecker::default()),
            10,
        );

        let first = service.bookmark("u1", "Example.com").await.expect("bookmark");
        assert!(first.created);
        assert_eq!(first.bookmark.domain, "example.com");
        let again = service.bookmark("u1", "example.com.").await.expect("bookmark");
        assert!(!again.created);

        assert_eq!(service.bookmarks("u1").await.expect("list").len(), 1);
        assert!(service.unbookmark("u1", "EXAMPLE.com").await.expect("remove"));
        assert!(!service.unbookmark("u1", "example.com").await.expect("remove"));
        assert!(matches!(
            service.bookmark("u1", " ").await,
            Err(ServiceError::InvalidDomain)
        ));
    }

    #[tokio::test]
    async fn bookmark_cap_is_enforced_per_user() {
        let service = service(
            Arc::new(MemoryStore::default()),
            Arc::new(ScriptedChecker::default()),
            10,
        );
        for idx in 0..BOOKMARK_LIMIT {
            service
                .bookmark("u1", &format!("d{idx}.test"))
                .await
                .expect("under the cap");
        }

        assert!(matches!(
            service.bookmark("u1", "extra.test").await,
            Err(ServiceError::BookmarkLimitReached { limit: 20 })
        ));
        let again = service.bookmark("u1", "d0.test").await.expect("existing");
        assert!(!again.created);
        service
            .bookmark("u2", "extra.test")
            .await
            .expect("other users unaffected");
    }

    #[tokio::test]
    async fn recheck_enforces_batch_bounds() {
        let service = service(
            Arc::new(MemoryStore::default()),
            Arc::new(ScriptedChecker::default()),
            10,
        );
        assert!(matches!(
            service.recheck(None, &[]).await,
            Err(ServiceError::InvalidDomain)
        ));

        let many: Vec<String> = (0..11).map(|idx| format!("d{idx}.test")).collect();
        assert!(matches!(
            service.recheck(None, &many).await,
            Err(ServiceError::TooManyDomains { max: 10 })
        ));
    }
}
