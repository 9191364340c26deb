use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{interval, timeout, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use domwatch_core::{
    evaluate, ChangeEvent, DomainStatus, HistoryEntry, Subscription, Transition,
};
use domwatch_storage::{HistoryStore, StoreError, SubscriptionStore};
use domwatch_upstream::StatusChecker;

use crate::notifier::{DeliveryError, Notifier};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DEFAULT_SPACING: Duration = Duration::from_secs(1);
const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of processing one subscription that reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// First successful observation of an `Unknown` subscription; no notification.
    Initialized,
    Unchanged,
    Changed { delivered: bool },
}

/// Why a subscription was not updated during a cycle.
#[derive(Debug, Error)]
pub enum ItemFailure {
    #[error("status lookup unreachable")]
    LookupUnreachable,
    #[error("subscription store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("unexpected fault while processing item")]
    Panicked,
    #[error("item not attempted")]
    NotAttempted,
}

impl ItemFailure {
    fn label(&self) -> &'static str {
        match self {
            Self::LookupUnreachable => "skipped",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Panicked => "panicked",
            Self::NotAttempted => "not_attempted",
        }
    }
}

type ItemResult = Result<ItemOutcome, ItemFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Completed,
    PartiallyFailed,
}

impl CycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
        }
    }
}

/// Summary of one monitoring cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: CycleState,
    /// Subscriptions in the snapshot.
    pub total: usize,
    /// Lookups that succeeded and were persisted.
    pub checked: usize,
    /// Lookups that were unreachable; retried next cycle.
    pub skipped: usize,
    pub changed: usize,
    pub notified: usize,
    pub delivery_failed: usize,
    /// Store failures and unexpected faults.
    pub failed: usize,
    pub not_attempted: usize,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

impl CycleReport {
    fn begin(cycle_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            started_at,
            finished_at: started_at,
            state: CycleState::Completed,
            total: 0,
            checked: 0,
            skipped: 0,
            changed: 0,
            notified: 0,
            delivery_failed: 0,
            failed: 0,
            not_attempted: 0,
            cancelled: false,
            store_error: None,
        }
    }

    fn record(&mut self, result: &ItemResult) {
        let label = match result {
            Ok(outcome) => {
                self.checked += 1;
                match outcome {
                    ItemOutcome::Initialized => "initialized",
                    ItemOutcome::Unchanged => "unchanged",
                    ItemOutcome::Changed { delivered } => {
                        self.changed += 1;
                        if *delivered {
                            self.notified += 1;
                        } else {
                            self.delivery_failed += 1;
                        }
                        "changed"
                    }
                }
            }
            Err(failure) => {
                match failure {
                    ItemFailure::LookupUnreachable => self.skipped += 1,
                    ItemFailure::StoreUnavailable(err) => {
                        self.failed += 1;
                        self.store_error.get_or_insert_with(|| err.to_string());
                    }
                    ItemFailure::Panicked => self.failed += 1,
                    ItemFailure::NotAttempted => self.not_attempted += 1,
                }
                failure.label()
            }
        };
        counter!("monitor_items_total", "outcome" => label).increment(1);
    }

    fn seal(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
        self.state = if self.failed == 0
            && self.not_attempted == 0
            && self.store_error.is_none()
            && !self.cancelled
        {
            CycleState::Completed
        } else {
            CycleState::PartiallyFailed
        };
    }
}

/// Spaces outbound lookups across every worker of a cycle.
struct RateGate {
    ticker: Option<Mutex<Interval>>,
}

impl RateGate {
    fn new(spacing: Duration) -> Self {
        if spacing.is_zero() {
            return Self { ticker: None };
        }
        let mut ticker = interval(spacing);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker: Some(Mutex::new(ticker)),
        }
    }

    async fn wait(&self) {
        if let Some(ticker) = &self.ticker {
            ticker.lock().await.tick().await;
        }
    }
}

/// Re-checks every subscription, persists new states and emits change notifications.
pub struct SubscriptionEngine {
    store: Arc<dyn SubscriptionStore>,
    checker: Arc<dyn StatusChecker>,
    notifier: Arc<dyn Notifier>,
    clock: Clock,
    history: Option<Arc<dyn HistoryStore>>,
    concurrency: usize,
    spacing: Duration,
    delivery_timeout: Duration,
}

impl SubscriptionEngine {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        checker: Arc<dyn StatusChecker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            checker,
            notifier,
            clock: Arc::new(Utc::now),
            history: None,
            concurrency: 1,
            spacing: DEFAULT_SPACING,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Number of subscriptions processed at the same time (at least one).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Minimum delay between two outbound lookups, shared by all workers.
    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    /// Upper bound for a single notification; a slower delivery counts as failed.
    pub fn with_delivery_timeout(mut self, delivery_timeout: Duration) -> Self {
        self.delivery_timeout = delivery_timeout;
        self
    }

    /// Appends every persisted observation to `history`.
    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Runs one full cycle over a fresh snapshot of the store.
    ///
    /// `shutdown` is honoured between items only: an item whose lookup has
    /// started always finishes its notify-then-persist sequence.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let started = Instant::now();
        let mut report = CycleReport::begin(cycle_id, self.now());

        let items = match self.store.list_all().await {
            Ok(items) => items,
            Err(err) => {
                error!(stage = "monitor", %cycle_id, error = %err, "failed to snapshot subscriptions");
                report.store_error = Some(err.to_string());
                return self.finish(report, started);
            }
        };

        report.total = items.len();
        info!(
            stage = "monitor",
            %cycle_id,
            total = items.len(),
            concurrency = self.concurrency,
            "starting subscription check"
        );

        let halt = shutdown.child_token();
        let gate = RateGate::new(self.spacing);
        let results: Vec<ItemResult> = stream::iter(items)
            .map(|item| self.process_guarded(cycle_id, item, &gate, &halt))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in &results {
            report.record(result);
        }
        report.cancelled = shutdown.is_cancelled();
        self.finish(report, started)
    }

    fn finish(&self, mut report: CycleReport, started: Instant) -> CycleReport {
        report.seal(self.now());
        let elapsed = started.elapsed().as_secs_f64();
        histogram!("monitor_cycle_seconds").record(elapsed);
        counter!("monitor_cycles_total", "state" => report.state.as_str()).increment(1);

        info!(
            stage = "monitor",
            cycle_id = %report.cycle_id,
            state = report.state.as_str(),
            total = report.total,
            checked = report.checked,
            skipped = report.skipped,
            changed = report.changed,
            delivery_failed = report.delivery_failed,
            failed = report.failed,
            not_attempted = report.not_attempted,
            cancelled = report.cancelled,
            duration_secs = elapsed,
            "subscription check completed"
        );
        report
    }

    /// Per-item boundary: nothing below this point can abort the cycle.
    async fn process_guarded(
        &self,
        cycle_id: Uuid,
        item: Subscription,
        gate: &RateGate,
        halt: &CancellationToken,
    ) -> ItemResult {
        if halt.is_cancelled() {
            return Err(ItemFailure::NotAttempted);
        }

        let user_id = item.user_id.clone();
        let domain = item.domain.clone();
        let result = AssertUnwindSafe(self.process_item(item, gate, halt))
            .catch_unwind()
            .await
            .unwrap_or(Err(ItemFailure::Panicked));

        match &result {
            Ok(_) | Err(ItemFailure::NotAttempted) => {}
            Err(ItemFailure::LookupUnreachable) => {
                warn!(stage = "monitor", %cycle_id, %user_id, %domain, "lookup unreachable, keeping previous status");
            }
            Err(ItemFailure::StoreUnavailable(err)) => {
                error!(stage = "monitor", %cycle_id, %user_id, %domain, error = %err, "store unavailable, aborting remaining items");
                halt.cancel();
            }
            Err(ItemFailure::Panicked) => {
                error!(stage = "monitor", %cycle_id, %user_id, %domain, "unexpected fault while checking subscription");
            }
        }
        result
    }

    async fn process_item(
        &self,
        item: Subscription,
        gate: &RateGate,
        halt: &CancellationToken,
    ) -> ItemResult {
        gate.wait().await;
        if halt.is_cancelled() {
            return Err(ItemFailure::NotAttempted);
        }

        let result = self.checker.check(&item.domain).await;
        let observed_at = self.now();

        let (status, outcome) = match evaluate(item.current_status, result) {
            Transition::Skip => return Err(ItemFailure::LookupUnreachable),
            Transition::Initialize(status) => (status, ItemOutcome::Initialized),
            Transition::Unchanged(status) => (status, ItemOutcome::Unchanged),
            Transition::Changed { from, to } => {
                let event = ChangeEvent {
                    user_id: item.user_id.clone(),
                    domain: item.domain.clone(),
                    old_status: from,
                    new_status: to,
                    observed_at,
                };
                let delivered = self.notify(&event).await;
                (to, ItemOutcome::Changed { delivered })
            }
        };

        let updated = item.observed(status, observed_at);
        self.store
            .upsert(&updated)
            .await
            .map_err(ItemFailure::StoreUnavailable)?;
        self.record_history(&updated, status, observed_at).await;

        Ok(outcome)
    }

    /// A failed append is logged and never fails the item.
    async fn record_history(
        &self,
        item: &Subscription,
        status: DomainStatus,
        checked_at: DateTime<Utc>,
    ) {
        let Some(history) = &self.history else {
            return;
        };
        let entry = HistoryEntry {
            user_id: item.user_id.clone(),
            domain: item.domain.clone(),
            status,
            checked_at,
        };
        if let Err(err) = history.record(&entry).await {
            warn!(
                stage = "storage",
                user_id = %item.user_id,
                domain = %item.domain,
                error = %err,
                "failed to append check history"
            );
        }
    }

    async fn notify(&self, event: &ChangeEvent) -> bool {
        let guarded = AssertUnwindSafe(self.notifier.deliver(event)).catch_unwind();
        let delivery = match timeout(self.delivery_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeliveryError::Unavailable("notifier panicked".to_string())),
            Err(_) => Err(DeliveryError::TimedOut(self.delivery_timeout)),
        };

        match delivery {
            Ok(()) => {
                counter!("monitor_notifications_total", "result" => "delivered").increment(1);
                info!(
                    stage = "notify",
                    user_id = %event.user_id,
                    domain = %event.domain,
                    old = %event.old_status,
                    new = %event.new_status,
                    "notification sent"
                );
                true
            }
            Err(err) => {
                counter!("monitor_notifications_total", "result" => "failed").increment(1);
                error!(
                    stage = "notify",
                    user_id = %event.user_id,
                    domain = %event.domain,
                    error = %err,
                    "failed to deliver notification"
                );
                false
            }
        }
    }
}
