use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use thiserror::Error;
use tracing::info;

use domwatch_core::{ChangeEvent, DomainStatus};
use domwatch_upstream::{TelegramClient, TelegramError};

/// Delivers status change events to the subscribed user.
///
/// Delivery is best effort: the engine logs failures and moves on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, event: &ChangeEvent) -> Result<(), DeliveryError>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("telegram delivery failed: {0}")]
    Telegram(#[from] TelegramError),
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
    #[error("delivery did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Sends change events as Telegram chat messages; the user id is the chat id.
#[derive(Clone)]
pub struct TelegramNotifier {
    client: TelegramClient,
    timezone: Tz,
}

impl TelegramNotifier {
    pub fn new(client: TelegramClient, timezone: Tz) -> Self {
        Self { client, timezone }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, event: &ChangeEvent) -> Result<(), DeliveryError> {
        let text = render_change_message(event, self.timezone);
        self.client.send_message(&event.user_id, &text).await?;
        Ok(())
    }
}

/// Writes change events to the log instead of a chat. Used when no bot token is configured.
#[derive(Clone)]
pub struct LogNotifier {
    timezone: Tz,
}

impl LogNotifier {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, event: &ChangeEvent) -> Result<(), DeliveryError> {
        info!(
            stage = "notify",
            user_id = %event.user_id,
            domain = %event.domain,
            message = %render_change_message(event, self.timezone),
            "change notification (log only)"
        );
        Ok(())
    }
}

fn status_marker(status: DomainStatus) -> &'static str {
    match status {
        DomainStatus::Blocked => "🔴",
        DomainStatus::NotBlocked => "🟢",
        DomainStatus::Unknown => "⚪",
    }
}

/// Human readable notification text for a status change.
pub fn render_change_message(event: &ChangeEvent, timezone: Tz) -> String {
    let observed = event.observed_at.with_timezone(&timezone);
    format!(
        "🔔 Domain status changed!\n\n\
         🌐 Domain: {domain}\n\
         📊 New status: {new_marker} {new_label}\n\
         🔄 Change: {old_marker} {old_label} ➡️ {new_marker} {new_label}\n\
         🕐 Observed: {observed} {tz}",
        domain = event.domain,
        new_marker = status_marker(event.new_status),
        new_label = event.new_status.label(),
        old_marker = status_marker(event.old_status),
        old_label = event.old_status.label(),
        observed = observed.format("%d/%m/%Y %H:%M"),
        tz = timezone.name(),
    )
}
