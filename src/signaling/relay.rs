//! Relay transport seam
//!
//! The relay is an external pub/sub bus. [`Relay`] is the only surface the room needs from it;
//! [`MemoryBroker`] is an in-process implementation used by the demo binary and the tests, and
//! [`ReconnectingRelay`] adds reconnect-with-backoff in front of any implementation.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// One delivered relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub topic: String,
    pub payload: String,
}

#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Opens the connection and returns the inbound stream for all subscribed topics.
    /// The stream ending means the connection was lost; subscriptions do not survive it.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<RelayFrame>>;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn publish(&self, topic: &str, payload: String) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-process broker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Endpoint {
    inbox: Option<mpsc::UnboundedSender<RelayFrame>>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct BrokerInner {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    history: Vec<RelayFrame>,
}

/// Shared in-memory pub/sub bus. Delivery is synchronous under one lock, so every subscriber
/// sees frames in global publish order.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// New participant-side connection to this broker
    pub fn endpoint(&self) -> MemoryRelay {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.endpoints.insert(id, Endpoint::default());
        MemoryRelay {
            id,
            broker: self.clone(),
        }
    }

    /// Every frame ever published, in order
    pub fn history(&self) -> Vec<RelayFrame> {
        self.lock().history.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<RelayFrame> {
        self.lock()
            .history
            .iter()
            .filter(|f| f.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of connected endpoints currently subscribed to `topic`
    pub fn subscribers(&self, topic: &str) -> usize {
        self.lock()
            .endpoints
            .values()
            .filter(|e| e.inbox.is_some() && e.topics.contains(topic))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerInner> {
        // A poisoned broker only means a test panicked mid-publish; the data is still usable.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One endpoint on a [`MemoryBroker`]
pub struct MemoryRelay {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryRelay {
    /// Drops the connection as a network failure would: the inbound stream ends and
    /// subscriptions are forgotten.
    pub fn disconnect(&self) {
        let mut inner = self.broker.lock();
        if let Some(ep) = inner.endpoints.get_mut(&self.id) {
            ep.inbox = None;
            ep.topics.clear();
        }
        debug!(endpoint = self.id, "memory relay disconnected");
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<RelayFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.broker.lock();
        let ep = inner.endpoints.entry(self.id).or_default();
        ep.inbox = Some(tx);
        ep.topics.clear();
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut inner = self.broker.lock();
        match inner.endpoints.get_mut(&self.id) {
            Some(ep) if ep.inbox.is_some() => {
                ep.topics.insert(topic.to_string());
                Ok(())
            }
            _ => Err(Error::RelayDisconnected),
        }
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut inner = self.broker.lock();
        let connected = inner
            .endpoints
            .get(&self.id)
            .is_some_and(|ep| ep.inbox.is_some());
        if !connected {
            return Err(Error::RelayDisconnected);
        }

        let frame = RelayFrame {
            topic: topic.to_string(),
            payload,
        };
        for ep in inner.endpoints.values_mut() {
            if !ep.topics.contains(topic) {
                continue;
            }
            if let Some(tx) = &ep.inbox {
                if tx.send(frame.clone()).is_err() {
                    ep.inbox = None;
                    ep.topics.clear();
                }
            }
        }
        inner.history.push(frame);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconnect with backoff
// ---------------------------------------------------------------------------

/// Exponential backoff policy for relay reconnects
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// Adds up to 25% random jitter to each delay
    pub jitter_enabled: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.max_retries must be greater than 0".into(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnect.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(Error::InvalidConfig(
                "reconnect.backoff_initial_ms exceeds backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before attempt `attempt` (0-indexed)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);

        let final_ms = if self.jitter_enabled && backoff_ms > 0.0 {
            backoff_ms + rand::rng().random_range(0.0..=backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}

/// Keeps one inbound stream alive across connection losses of the wrapped relay.
///
/// Subscriptions are remembered and replayed after every reconnect. Publishes that fail with a
/// retryable error are retried on the same backoff schedule. Once `max_retries` consecutive
/// reconnects fail the outward stream is closed.
pub struct ReconnectingRelay<R: Relay> {
    inner: Arc<R>,
    policy: ReconnectPolicy,
    topics: Arc<Mutex<Vec<String>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Relay> ReconnectingRelay<R> {
    pub fn new(inner: R, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(inner),
            policy,
            topics: Arc::new(Mutex::new(Vec::new())),
            pump: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    fn remembered_topics(topics: &Mutex<Vec<String>>) -> Vec<String> {
        topics.lock().map(|t| t.clone()).unwrap_or_default()
    }

    async fn reconnect(
        inner: &R,
        topics: &Mutex<Vec<String>>,
        policy: &ReconnectPolicy,
    ) -> Result<mpsc::UnboundedReceiver<RelayFrame>> {
        for attempt in 0..policy.max_retries {
            let delay = policy.calculate_backoff(attempt);
            debug!(attempt, ?delay, "relay reconnect backoff");
            tokio::time::sleep(delay).await;

            let rx = match inner.connect().await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(attempt, "relay reconnect failed: {}", e);
                    continue;
                }
            };

            let mut resubscribed = true;
            for topic in Self::remembered_topics(topics) {
                if let Err(e) = inner.subscribe(&topic).await {
                    warn!(attempt, %topic, "resubscribe failed: {}", e);
                    resubscribed = false;
                    break;
                }
            }
            if resubscribed {
                info!(attempt, "relay reconnected");
                return Ok(rx);
            }
        }
        Err(Error::RelayDisconnected)
    }
}

impl<R: Relay> Drop for ReconnectingRelay<R> {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl<R: Relay> Relay for ReconnectingRelay<R> {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<RelayFrame>> {
        let first = match self.inner.connect().await {
            Ok(rx) => rx,
            Err(e) if e.is_retryable() => {
                warn!("relay connect failed, retrying: {}", e);
                Self::reconnect(&self.inner, &self.topics, &self.policy).await?
            }
            Err(e) => return Err(e),
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        let topics = self.topics.clone();
        let policy = self.policy.clone();

        let handle = tokio::spawn(async move {
            let mut rx = first;
            loop {
                while let Some(frame) = rx.recv().await {
                    if out_tx.send(frame).is_err() {
                        return;
                    }
                }
                warn!("relay stream ended, reconnecting");
                match Self::reconnect(&inner, &topics, &policy).await {
                    Ok(next) => rx = next,
                    Err(e) => {
                        error!("giving up on relay: {}", e);
                        return;
                    }
                }
            }
        });

        if let Ok(mut pump) = self.pump.lock() {
            if let Some(old) = pump.replace(handle) {
                old.abort();
            }
        }
        Ok(out_rx)
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if let Ok(mut topics) = self.topics.lock() {
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        match self.inner.subscribe(topic).await {
            // replayed on reconnect
            Err(e) if e.is_retryable() => {
                warn!(%topic, "subscribe deferred until reconnect: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut last = match self.inner.publish(topic, payload.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        for attempt in 0..self.policy.max_retries {
            tokio::time::sleep(self.policy.calculate_backoff(attempt)).await;
            match self.inner.publish(topic, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    debug!(attempt, %topic, "publish retry failed: {}", e);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}
