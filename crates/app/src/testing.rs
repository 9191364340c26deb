//! In-memory collaborators shared by the app's unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use domwatch_core::{Bookmark, ChangeEvent, CheckResult, HistoryEntry, Subscription};
use domwatch_storage::{BookmarkInsert, BookmarkStore, HistoryStore, StoreError, SubscriptionStore};
use domwatch_upstream::StatusChecker;

use crate::notifier::{DeliveryError, Notifier};

#[derive(Default)]
pub(crate) struct MemoryStore {
    rows: Mutex<BTreeMap<(String, String), Subscription>>,
    fail_list: AtomicBool,
    fail_upserts: AtomicBool,
    fail_history: AtomicBool,
    history: Mutex<Vec<HistoryEntry>>,
    bookmarks: Mutex<BTreeMap<(String, String), Bookmark>>,
    pub(crate) list_calls: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn seed(&self, subscription: Subscription) {
        self.rows.lock().expect("rows").insert(
            (subscription.user_id.clone(), subscription.domain.clone()),
            subscription,
        );
    }

    pub(crate) fn snapshot(&self, user_id: &str, domain: &str) -> Option<Subscription> {
        self.rows
            .lock()
            .expect("rows")
            .get(&(user_id.to_string(), domain.to_string()))
            .cloned()
    }

    pub(crate) fn all(&self) -> Vec<Subscription> {
        self.rows.lock().expect("rows").values().cloned().collect()
    }

    pub(crate) fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Recorded history in insertion order.
    pub(crate) fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().expect("history").clone()
    }

    fn unavailable() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn list_all(&self) -> Result<Vec<Subscription>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.all())
    }

    async fn get(
        &self,
        user_id: &str,
        domain: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.snapshot(user_id, domain))
    }

    async fn upsert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut rows = self.rows.lock().expect("rows");
        let key = (subscription.user_id.clone(), subscription.domain.clone());
        let created_at = rows
            .get(&key)
            .map(|existing| existing.created_at)
            .unwrap_or(subscription.created_at);
        let mut stored = subscription.clone();
        stored.created_at = created_at;
        rows.insert(key, stored);
        Ok(())
    }

    async fn insert_within_limit(
        &self,
        subscription: &Subscription,
        limit: u32,
    ) -> Result<bool, StoreError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut rows = self.rows.lock().expect("rows");
        let key = (subscription.user_id.clone(), subscription.domain.clone());
        if let Some(existing) = rows.get_mut(&key) {
            existing.current_status = subscription.current_status;
            existing.last_check = subscription.last_check;
            return Ok(true);
        }
        let held = rows.keys().filter(|(user, _)| *user == subscription.user_id).count();
        if held >= limit as usize {
            return Ok(false);
        }
        rows.insert(key, subscription.clone());
        Ok(true)
    }

    async fn delete(&self, user_id: &str, domain: &str) -> Result<bool, StoreError> {
        Ok(self
            .rows
            .lock()
            .expect("rows")
            .remove(&(user_id.to_string(), domain.to_string()))
            .is_some())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let mut rows: Vec<_> = self
            .all()
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        Ok(rows)
    }

    async fn count_for_user(&self, user_id: &str) -> Result<u32, StoreError> {
        Ok(self.all().iter().filter(|s| s.user_id == user_id).count() as u32)
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn record(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.history.lock().expect("history").push(entry.clone());
        Ok(())
    }

    async fn recent_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut entries: Vec<_> = self
            .history()
            .into_iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .collect();
        entries.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        entries.truncate(limit as usize);
        Ok(entries)
    }
}

#[async_trait]
impl BookmarkStore for MemoryStore {
    async fn add(&self, bookmark: &Bookmark, limit: u32) -> Result<BookmarkInsert, StoreError> {
        let mut bookmarks = self.bookmarks.lock().expect("bookmarks");
        let key = (bookmark.user_id.clone(), bookmark.domain.clone());
        if bookmarks.contains_key(&key) {
            return Ok(BookmarkInsert::AlreadyPresent);
        }
        let held = bookmarks.keys().filter(|(user, _)| *user == bookmark.user_id).count();
        if held >= limit as usize {
            return Ok(BookmarkInsert::LimitReached);
        }
        bookmarks.insert(key, bookmark.clone());
        Ok(BookmarkInsert::Added)
    }

    async fn remove(&self, user_id: &str, domain: &str) -> Result<bool, StoreError> {
        Ok(self
            .bookmarks
            .lock()
            .expect("bookmarks")
            .remove(&(user_id.to_string(), domain.to_string()))
            .is_some())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Bookmark>, StoreError> {
        let mut marks: Vec<_> = self
            .bookmarks
            .lock()
            .expect("bookmarks")
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        marks.sort_by(|a, b| {
            b.added_at
                .cmp(&a.added_at)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        Ok(marks)
    }
}

/// Answers lookups from a table; domains not in the table are unreachable.
#[derive(Default)]
pub(crate) struct ScriptedChecker {
    results: Mutex<HashMap<String, CheckResult>>,
    panics: Mutex<Vec<String>>,
    cancel_on_call: Mutex<Option<CancellationToken>>,
    delay: Duration,
    in_flight: AtomicUsize,
    pub(crate) max_in_flight: AtomicUsize,
    pub(crate) calls: AtomicUsize,
}

impl ScriptedChecker {
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn set(&self, domain: &str, result: CheckResult) {
        self.results
            .lock()
            .expect("results")
            .insert(domain.to_string(), result);
    }

    pub(crate) fn panic_on(&self, domain: &str) {
        self.panics.lock().expect("panics").push(domain.to_string());
    }

    /// Cancels `token` as soon as the first lookup starts.
    pub(crate) fn cancel_on_call(&self, token: CancellationToken) {
        *self.cancel_on_call.lock().expect("token") = Some(token);
    }
}

#[async_trait]
impl StatusChecker for ScriptedChecker {
    async fn check(&self, domain: &str) -> CheckResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_on_call.lock().expect("token").as_ref() {
            token.cancel();
        }
        if self.panics.lock().expect("panics").iter().any(|d| d == domain) {
            panic!("scripted lookup fault for {domain}");
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.results
            .lock()
            .expect("results")
            .get(domain)
            .copied()
            .unwrap_or_else(CheckResult::unreachable)
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    events: Mutex<Vec<ChangeEvent>>,
    fail: bool,
    panic: bool,
}

impl RecordingNotifier {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::default()
        }
    }

    pub(crate) fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().expect("events").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, event: &ChangeEvent) -> Result<(), DeliveryError> {
        if self.panic {
            panic!("scripted delivery fault");
        }
        self.events.lock().expect("events").push(event.clone());
        if self.fail {
            return Err(DeliveryError::Unavailable("scripted failure".to_string()));
        }
        Ok(())
    }
}

/// Accepts every event but takes `delay` to do so.
pub(crate) struct SlowNotifier {
    delay: Duration,
    pub(crate) started: AtomicUsize,
}

impl SlowNotifier {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Notifier for SlowNotifier {
    async fn deliver(&self, _event: &ChangeEvent) -> Result<(), DeliveryError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
