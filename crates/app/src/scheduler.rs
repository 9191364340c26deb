use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::{Mutex, OwnedMutexGuard, RwLock},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use domwatch_util::MonitorConfig;

use crate::engine::{CycleReport, SubscriptionEngine};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unknown time zone: {0}")]
    UnknownTimezone(String),
    #[error("invalid wall-clock time {hour:02}:{minute:02}")]
    InvalidTime { hour: u32, minute: u32 },
}

pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

/// When monitoring cycles fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Once a day at a wall-clock time in `timezone`.
    Daily { hour: u32, minute: u32, timezone: Tz },
    /// Fixed cadence measured from the end of the previous cycle.
    Every(Duration),
}

impl Schedule {
    pub fn from_config(config: &MonitorConfig) -> Result<Self, ScheduleError> {
        if let Some(interval) = config.interval {
            return Ok(Self::Every(interval));
        }
        if config.hour > 23 || config.minute > 59 {
            return Err(ScheduleError::InvalidTime {
                hour: config.hour,
                minute: config.minute,
            });
        }
        Ok(Self::Daily {
            hour: config.hour,
            minute: config.minute,
            timezone: parse_timezone(&config.timezone)?,
        })
    }

    /// First fire instant strictly after `now`.
    ///
    /// A daily time that falls inside a DST gap fires one hour later on that day.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Every(interval) => {
                now + ChronoDuration::from_std(interval).unwrap_or_else(|_| ChronoDuration::days(1))
            }
            Self::Daily {
                hour,
                minute,
                timezone,
            } => {
                let today = now.with_timezone(&timezone).date_naive();
                (0..=2)
                    .filter_map(|offset| today.checked_add_signed(ChronoDuration::days(offset)))
                    .filter_map(|day| day.and_hms_opt(hour, minute, 0))
                    .filter_map(|naive| resolve_local(timezone, naive))
                    .map(|local| local.with_timezone(&Utc))
                    .find(|candidate| *candidate > now)
                    .unwrap_or_else(|| now + ChronoDuration::days(1))
            }
        }
    }
}

fn resolve_local(timezone: Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(at) => Some(at),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => timezone
            .from_local_datetime(&(naive + ChronoDuration::hours(1)))
            .earliest(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

/// Owns the engine and guarantees at most one cycle runs at a time.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    engine: SubscriptionEngine,
    schedule: Schedule,
    slot: Arc<Mutex<()>>,
    last_report: RwLock<Option<CycleReport>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: SubscriptionEngine, schedule: Schedule, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                schedule,
                slot: Arc::new(Mutex::new(())),
                last_report: RwLock::new(None),
                shutdown,
            }),
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.inner.schedule
    }

    /// Starts a cycle in the background unless one is already running.
    pub fn trigger(&self) -> TriggerOutcome {
        match self.try_acquire() {
            Some(guard) => {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.execute(guard).await;
                });
                TriggerOutcome::Started
            }
            None => TriggerOutcome::AlreadyRunning,
        }
    }

    /// Runs a cycle inline; `None` when another cycle holds the slot.
    pub async fn run_now(&self) -> Option<CycleReport> {
        let guard = self.try_acquire()?;
        Some(self.execute(guard).await)
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.inner.last_report.read().await.clone()
    }

    /// Resolves once no cycle is running.
    pub async fn wait_idle(&self) {
        let _slot = self.inner.slot.lock().await;
    }

    /// Runs the timer loop until the shutdown token fires.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        loop {
            let now = Utc::now();
            let next = self.inner.schedule.next_after(now);
            let delay = (next - now).to_std().unwrap_or_default();
            info!(stage = "scheduler", next_run = %next.to_rfc3339(), "next monitoring cycle scheduled");

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }

            if self.run_now().await.is_none() {
                warn!(stage = "scheduler", "scheduled run skipped");
            }
        }
        info!(stage = "scheduler", "scheduler stopped");
    }

    fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        match self.inner.slot.clone().try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                counter!("monitor_triggers_dropped_total").increment(1);
                info!(stage = "scheduler", "cycle already running");
                None
            }
        }
    }

    async fn execute(&self, _slot: OwnedMutexGuard<()>) -> CycleReport {
        let report = self.inner.engine.run_cycle(&self.inner.shutdown).await;
        *self.inner.last_report.write().await = Some(report.clone());
        report
    }
}
