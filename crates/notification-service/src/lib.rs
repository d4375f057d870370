mod templates;

pub use templates::MessageTemplate;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Position lifecycle events that trigger notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PositionEvent {
    Opened {
        ticker: String,
        company_name: String,
        entry_price: f64,
        quantity: u64,
        target_price: f64,
        stop_loss: f64,
        sector: String,
    },
    Skipped {
        ticker: String,
        company_name: String,
        buy_score: f64,
        min_score: f64,
        reason: String,
    },
    PartialSell {
        ticker: String,
        company_name: String,
        quantity: u64,
        price: f64,
        profit_rate: f64,
        remaining_ratio: f64,
        reason: String,
    },
    Closed {
        ticker: String,
        company_name: String,
        exit_price: f64,
        profit_rate: f64,
        holding_days: i64,
        reason: String,
    },
    RiskLevelsAdjusted {
        ticker: String,
        target_price: f64,
        stop_loss: f64,
        urgency: String,
        reason: String,
    },
    OrderFailed {
        ticker: String,
        side: String,
        message: String,
    },
}

impl PositionEvent {
    pub fn ticker(&self) -> &str {
        match self {
            PositionEvent::Opened { ticker, .. }
            | PositionEvent::Skipped { ticker, .. }
            | PositionEvent::PartialSell { ticker, .. }
            | PositionEvent::Closed { ticker, .. }
            | PositionEvent::RiskLevelsAdjusted { ticker, .. }
            | PositionEvent::OrderFailed { ticker, .. } => ticker,
        }
    }
}

/// A notification ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub event: PositionEvent,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(event: PositionEvent) -> Self {
        Self {
            title: MessageTemplate::title(&event),
            message: MessageTemplate::render(&event),
            timestamp: chrono::Utc::now(),
            event,
        }
    }
}

/// Trait for notification sinks.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError>;
    fn name(&self) -> &str;
}

/// Errors from the notification system.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Delivery error: {0}")]
    Delivery(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Writes every notification to the tracing log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        match &notification.event {
            PositionEvent::OrderFailed { .. } => {
                tracing::warn!(ticker = notification.event.ticker(), "{}: {}", notification.title, notification.message)
            }
            _ => tracing::info!(ticker = notification.event.ticker(), "{}: {}", notification.title, notification.message),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Buffers notifications for an outer delivery layer to drain after a cycle.
#[derive(Default)]
pub struct QueueSink {
    queue: Mutex<Vec<Notification>>,
}

impl QueueSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.queue.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

#[async_trait]
impl NotificationSink for QueueSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.queue.lock().await.push(notification.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "queue"
    }
}

#[async_trait]
impl<T: NotificationSink + ?Sized> NotificationSink for Arc<T> {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        (**self).deliver(notification).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Dispatches events to all configured sinks.
#[derive(Clone)]
pub struct NotificationService {
    sinks: Arc<Vec<Box<dyn NotificationSink>>>,
}

impl NotificationService {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        if sinks.is_empty() {
            tracing::info!("No notification sinks configured");
        }
        Self {
            sinks: Arc::new(sinks),
        }
    }

    /// Log-only service.
    pub fn logging() -> Self {
        Self::new(vec![Box::new(LogSink)])
    }

    /// Deliver to every sink, awaiting completion. Sink failures are logged, not returned.
    pub async fn notify(&self, event: PositionEvent) {
        let notification = Notification::new(event);
        deliver_all(&self.sinks, &notification).await;
    }

    /// Deliver in the background (fire-and-forget via tokio::spawn).
    pub fn notify_detached(&self, event: PositionEvent) {
        let sinks = self.sinks.clone();
        let notification = Notification::new(event);
        tokio::spawn(async move {
            deliver_all(&sinks, &notification).await;
        });
    }
}

async fn deliver_all(sinks: &[Box<dyn NotificationSink>], notification: &Notification) {
    for sink in sinks.iter() {
        match sink.deliver(notification).await {
            Ok(()) => tracing::debug!("Sent notification via {}", sink.name()),
            Err(e) => {
                tracing::warn!("Failed to send notification via {}: {}", sink.name(), e)
            }
        }
    }
}
