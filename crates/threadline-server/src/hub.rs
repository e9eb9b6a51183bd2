use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use threadline_contracts::{Message, StreamEvent};
use threadline_kernel::{format_millis, presence_cache_name};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::CacheLayer;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    pub organization_id: String,
    pub lead_key: String,
}

/// A registered subscriber: its id and the queue the hub fans messages into.
pub struct Registration {
    pub connection_id: String,
    pub key: SubscriberKey,
    pub receiver: mpsc::Receiver<Message>,
}

/// Live SSE subscribers grouped by (organization, lead key).
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberKey, HashMap<String, mpsc::Sender<Message>>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn register(&self, organization_id: &str, lead_key: &str) -> Registration {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let connection_id = format!("conn_{}", uuid::Uuid::new_v4().as_simple());
        let key = SubscriberKey {
            organization_id: organization_id.to_string(),
            lead_key: lead_key.to_string(),
        };
        self.subscribers
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(connection_id.clone(), sender);
        Registration {
            connection_id,
            key,
            receiver,
        }
    }

    /// Removes a subscriber; empty lead sets are dropped with it. Returns
    /// false when the subscriber was already gone.
    pub fn deregister(&self, key: &SubscriberKey, connection_id: &str) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(set) = subscribers.get_mut(key) else {
            return false;
        };
        let removed = set.remove(connection_id).is_some();
        if set.is_empty() {
            subscribers.remove(key);
        }
        removed
    }

    /// Delivers `message` to every subscriber of the given lead keys within
    /// the message's organization. Subscribers whose connection has closed
    /// are dropped; a full queue skips that subscriber only.
    pub fn publish(&self, lead_keys: &[String], message: &Message) -> usize {
        let mut delivered = 0;
        let mut subscribers = self.subscribers.lock();
        let mut seen: Vec<&String> = Vec::with_capacity(lead_keys.len());
        for lead_key in lead_keys {
            if seen.contains(&lead_key) {
                continue;
            }
            seen.push(lead_key);
            let key = SubscriberKey {
                organization_id: message.organization_id.clone(),
                lead_key: lead_key.clone(),
            };
            let Some(set) = subscribers.get_mut(&key) else {
                continue;
            };
            set.retain(|connection_id, sender| match sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        connection_id = %connection_id,
                        lead_key = %key.lead_key,
                        sequence = message.sequence_number,
                        "subscriber lagging; message skipped"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
            if set.is_empty() {
                subscribers.remove(&key);
            }
        }
        delivered
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, organization_id: &str, lead_key: &str) -> usize {
        let key = SubscriberKey {
            organization_id: organization_id.to_string(),
            lead_key: lead_key.to_string(),
        };
        self.subscribers
            .lock()
            .get(&key)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn total_subscribers(&self) -> usize {
        self.subscribers.lock().values().map(|set| set.len()).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

/// Drives one subscriber: emits `connected`, relays messages, heartbeats on
/// an interval and ends after `idle_timeout` without a message event or when
/// `cancel` fires. The subscriber is deregistered on every exit path.
pub fn spawn_connection(
    hub: Arc<BroadcastHub>,
    cache: Arc<CacheLayer>,
    registration: Registration,
    latest_sequence: Option<i64>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) -> mpsc::Receiver<StreamEvent> {
    let (out, events) = mpsc::channel(hub.capacity);
    tokio::spawn(run_connection(
        hub,
        cache,
        registration,
        latest_sequence,
        settings,
        cancel,
        out,
    ));
    events
}

async fn run_connection(
    hub: Arc<BroadcastHub>,
    cache: Arc<CacheLayer>,
    registration: Registration,
    latest_sequence: Option<i64>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
    out: mpsc::Sender<StreamEvent>,
) {
    let Registration {
        connection_id,
        key,
        mut receiver,
    } = registration;
    let presence = presence_cache_name(&key.lead_key, &connection_id);
    let presence_ttl = settings.idle_timeout + settings.heartbeat_interval;
    cache
        .set(&key.organization_id, &presence, &now_rfc3339(), presence_ttl)
        .await;
    debug!(connection_id = %connection_id, lead_key = %key.lead_key, "stream opened");

    let connected = StreamEvent::Connected {
        connection_id: connection_id.clone(),
        organization_id: key.organization_id.clone(),
        lead_key: key.lead_key.clone(),
        latest_sequence,
        timestamp: now_rfc3339(),
    };

    let reason = if out.send(connected).await.is_err() {
        "client_gone"
    } else {
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + settings.heartbeat_interval,
            settings.heartbeat_interval,
        );
        let idle = tokio::time::sleep(settings.idle_timeout);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break "cancelled",
                _ = &mut idle => break "idle_timeout",
                _ = heartbeat.tick() => {
                    let event = StreamEvent::Heartbeat { timestamp: now_rfc3339() };
                    if out.send(event).await.is_err() {
                        break "client_gone";
                    }
                }
                next = receiver.recv() => {
                    let Some(message) = next else { break "hub_closed" };
                    if out.send(StreamEvent::Message { message }).await.is_err() {
                        break "client_gone";
                    }
                    idle.as_mut().reset(Instant::now() + settings.idle_timeout);
                }
            }
        }
    };

    hub.deregister(&key, &connection_id);
    cache.del(&key.organization_id, &presence).await;
    debug!(connection_id = %connection_id, lead_key = %key.lead_key, reason, "stream closed");
}

fn now_rfc3339() -> String {
    format_millis(chrono::Utc::now().timestamp_millis())
}
