// =============================================================================
// Notifier — priority fan-out with dedupe and bounded retries
// =============================================================================
//
// An unbounded MPSC with three priorities. The worker drains emergency first,
// then high, then normal. Delivery is at-least-once for emergency/high
// (bounded exponential-backoff retries) and best-effort for normal.
//
// Duplicate suppression collapses identical content within 60 s — except the
// trade and emergency classes, which always send. Notifier failures never
// propagate into trading state.
// =============================================================================

pub mod telegram;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Duplicate-suppression window.
const DEDUPE_WINDOW: Duration = Duration::from_secs(60);
/// Retry budget for at-least-once priorities.
const MAX_DELIVERY_RETRIES: u32 = 3;
/// Base delay between delivery retries.
const RETRY_BASE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
    Emergency,
}

/// Message class, used by duplicate suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageClass {
    Trade,
    Emergency,
    Alert,
    Info,
}

impl MessageClass {
    /// Trade and emergency messages are never collapsed.
    fn dedupe_exempt(self) -> bool {
        matches!(self, Self::Trade | Self::Emergency)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub content: String,
    pub priority: Priority,
    pub class: MessageClass,
    pub metadata: serde_json::Value,
}

impl Notification {
    pub fn new(content: impl Into<String>, priority: Priority, class: MessageClass) -> Self {
        Self {
            content: content.into(),
            priority,
            class,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// Channel port
// ---------------------------------------------------------------------------

/// Outbound delivery channel (Telegram, webhook, log).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Fallback channel that just logs; used when no external channel is
/// configured so the queue always drains.
pub struct LogChannel;

#[async_trait]
impl NotifyChannel for LogChannel {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            priority = ?notification.priority,
            class = ?notification.class,
            "{}",
            notification.content
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Queues {
    emergency: VecDeque<Notification>,
    high: VecDeque<Notification>,
    normal: VecDeque<Notification>,
}

impl Queues {
    fn push(&mut self, n: Notification) {
        match n.priority {
            Priority::Emergency => self.emergency.push_back(n),
            Priority::High => self.high.push_back(n),
            Priority::Normal => self.normal.push_back(n),
        }
    }

    /// Strict priority order: emergency, then high, then normal.
    fn pop(&mut self) -> Option<Notification> {
        self.emergency
            .pop_front()
            .or_else(|| self.high.pop_front())
            .or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.emergency.len() + self.high.len() + self.normal.len()
    }
}

pub struct Notifier {
    queues: Mutex<Queues>,
    wakeup: Notify,
    recent_hashes: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(Queues::default()),
            wakeup: Notify::new(),
            recent_hashes: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue a notification. Duplicates within the window are collapsed
    /// unless the class is exempt. Never blocks, never fails.
    pub fn send(&self, notification: Notification) {
        if !notification.class.dedupe_exempt() && self.is_duplicate(&notification.content) {
            debug!(content = %notification.content, "duplicate notification suppressed");
            return;
        }
        self.queues.lock().push(notification);
        self.wakeup.notify_one();
    }

    pub fn queued(&self) -> usize {
        self.queues.lock().len()
    }

    fn is_duplicate(&self, content: &str) -> bool {
        let hash = hex::encode(Sha256::digest(content.as_bytes()));
        let mut recent = self.recent_hashes.lock();
        recent.retain(|_, seen| seen.elapsed() < DEDUPE_WINDOW);
        match recent.get(&hash) {
            Some(_) => true,
            None => {
                recent.insert(hash, Instant::now());
                false
            }
        }
    }

    /// Worker loop: drains the queues into `channel` until shutdown.
    pub async fn run_worker(
        self: Arc<Self>,
        channel: Arc<dyn NotifyChannel>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = self.queues.lock().pop();
            match next {
                Some(notification) => {
                    Self::deliver_with_policy(&channel, &notification).await;
                }
                None => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = shutdown.changed() => {
                            // Drain what is already queued, then stop.
                            while let Some(n) = { let n = self.queues.lock().pop(); n } {
                                Self::deliver_with_policy(&channel, &n).await;
                            }
                            info!("notifier worker stopped");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// At-least-once for emergency/high; single best-effort attempt for
    /// normal. Failures are logged and dropped — they never affect trading.
    async fn deliver_with_policy(channel: &Arc<dyn NotifyChannel>, notification: &Notification) {
        let retries = match notification.priority {
            Priority::Emergency | Priority::High => MAX_DELIVERY_RETRIES,
            Priority::Normal => 0,
        };

        let mut attempt = 0;
        loop {
            match channel.deliver(notification).await {
                Ok(()) => return,
                Err(e) if attempt < retries => {
                    attempt += 1;
                    let wait = RETRY_BASE * 2u32.pow(attempt - 1);
                    warn!(
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %e,
                        "notification delivery failed — retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(error = %e, priority = ?notification.priority, "notification dropped");
                    return;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        delivered: Mutex<Vec<String>>,
        failures_before_success: AtomicU32,
    }

    impl Recorder {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                failures_before_success: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl NotifyChannel for Recorder {
        async fn deliver(&self, n: &Notification) -> anyhow::Result<()> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("simulated delivery failure");
            }
            self.delivered.lock().push(n.content.clone());
            Ok(())
        }
    }

    #[test]
    fn priority_order_is_strict() {
        let mut q = Queues::default();
        q.push(Notification::new("n1", Priority::Normal, MessageClass::Info));
        q.push(Notification::new("e1", Priority::Emergency, MessageClass::Emergency));
        q.push(Notification::new("h1", Priority::High, MessageClass::Alert));
        q.push(Notification::new("e2", Priority::Emergency, MessageClass::Emergency));

        let order: Vec<String> = std::iter::from_fn(|| q.pop()).map(|n| n.content).collect();
        assert_eq!(order, vec!["e1", "e2", "h1", "n1"]);
    }

    #[test]
    fn duplicates_are_suppressed_within_window() {
        let notifier = Notifier::new();
        notifier.send(Notification::new("same", Priority::Normal, MessageClass::Info));
        notifier.send(Notification::new("same", Priority::Normal, MessageClass::Info));
        assert_eq!(notifier.queued(), 1);
    }

    #[test]
    fn trade_class_is_never_suppressed() {
        let notifier = Notifier::new();
        notifier.send(Notification::new("fill", Priority::High, MessageClass::Trade));
        notifier.send(Notification::new("fill", Priority::High, MessageClass::Trade));
        assert_eq!(notifier.queued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_retries_until_delivered() {
        let notifier = Notifier::new();
        let channel = Recorder::new(2);
        let (_tx, rx) = watch::channel(false);
        let worker = tokio::spawn(
            notifier
                .clone()
                .run_worker(channel.clone() as Arc<dyn NotifyChannel>, rx),
        );

        notifier.send(Notification::new("alert", Priority::High, MessageClass::Alert));

        // Two failures then success; virtual time advances through backoff.
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if !channel.delivered.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("notification should eventually deliver");

        worker.abort();
        assert_eq!(channel.delivered.lock().as_slice(), &["alert".to_string()]);
    }

    #[tokio::test]
    async fn normal_priority_is_best_effort() {
        let notifier = Notifier::new();
        let channel = Recorder::new(1); // first attempt fails, no retry
        let (_tx, rx) = watch::channel(false);
        let worker = tokio::spawn(
            notifier
                .clone()
                .run_worker(channel.clone() as Arc<dyn NotifyChannel>, rx),
        );

        notifier.send(Notification::new("fyi", Priority::Normal, MessageClass::Info));
        tokio::time::sleep(Duration::from_millis(100)).await;

        worker.abort();
        assert!(channel.delivered.lock().is_empty());
    }
}
