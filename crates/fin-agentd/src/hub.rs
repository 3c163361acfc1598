//! Subscriber registry for the dashboard channel. Owns every live
//! WebSocket peer, broadcast fan-out, keepalive pings, and the stale
//! reaper. Producers never touch the transport; they hand envelopes to
//! the hub and it does the rest.

use axum::extract::ws::Message;
use fin_core::envelope::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub ping_interval: Duration,
    pub stale_after: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
        }
    }
}

pub struct Subscriber {
    pub conn_id: String,
    sender: mpsc::Sender<Message>,
    last_seen: AsyncMutex<Instant>,
}

impl Subscriber {
    pub async fn touch(&self) {
        let mut last = self.last_seen.lock().await;
        *last = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_text() {
            Some(text) => self.sender.send(Message::Text(text)).await.is_ok(),
            None => false,
        }
    }

    async fn ping(&self) -> bool {
        self.sender.send(Message::Ping(Vec::new())).await.is_ok()
    }
}

pub struct Hub {
    config: HubConfig,
    conn_counter: AtomicU64,
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, sender: mpsc::Sender<Message>) -> Arc<Subscriber> {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let subscriber = Arc::new(Subscriber {
            conn_id: format!("conn-{id}"),
            sender,
            last_seen: AsyncMutex::new(Instant::now()),
        });
        self.subscribers
            .write()
            .await
            .insert(subscriber.conn_id.clone(), subscriber.clone());
        info!(event = "client_connected", conn_id = %subscriber.conn_id);
        subscriber
    }

    pub async fn remove(&self, subscriber: &Subscriber, reason: &str) {
        if self
            .subscribers
            .write()
            .await
            .remove(&subscriber.conn_id)
            .is_some()
        {
            info!(event = "client_disconnected", conn_id = %subscriber.conn_id, reason = reason);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().await.values().cloned().collect()
    }

    /// Fan out one envelope to every live subscriber, pruning peers whose
    /// send side is gone.
    pub async fn broadcast(&self, envelope: &Envelope) {
        for subscriber in self.snapshot().await {
            if !subscriber.send_envelope(envelope).await {
                warn!(event = "send_error", conn_id = %subscriber.conn_id);
                self.remove(&subscriber, "send_error").await;
            }
        }
    }

    /// Replay the given envelopes to one freshly connected subscriber so a
    /// reconnecting dashboard converges on current state.
    pub async fn send_snapshot(&self, subscriber: &Subscriber, envelopes: &[Envelope]) {
        for envelope in envelopes {
            if !subscriber.send_envelope(envelope).await {
                warn!(event = "snapshot_error", conn_id = %subscriber.conn_id);
                self.remove(subscriber, "snapshot_error").await;
                return;
            }
        }
        info!(event = "snapshot_sent", conn_id = %subscriber.conn_id, count = envelopes.len());
    }

    pub fn start_ping(self: Arc<Self>, subscriber: Arc<Subscriber>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !subscriber.ping().await {
                    warn!(event = "ping_failed", conn_id = %subscriber.conn_id);
                    self.remove(&subscriber, "ping_failed").await;
                    return;
                }
            }
        });
    }

    pub fn start_stale_reaper(self: Arc<Self>) {
        if self.config.stale_after.is_zero() {
            return;
        }
        let stale_after = self.config.stale_after;
        let interval = stale_after / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for subscriber in self.snapshot().await {
                    if subscriber.last_seen().await.elapsed() > stale_after {
                        warn!(event = "stale_close", conn_id = %subscriber.conn_id);
                        self.remove(&subscriber, "stale").await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_prunes_dead_subscribers() {
        let hub = Hub::new(HubConfig::default());
        let (alive_tx, mut alive_rx) = mpsc::channel(8);
        let (dead_tx, dead_rx) = mpsc::channel(8);
        hub.register(alive_tx).await;
        hub.register(dead_tx).await;
        drop(dead_rx);

        hub.broadcast(&Envelope::status("hello")).await;
        assert_eq!(hub.subscriber_count().await, 1);
        assert!(alive_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn snapshot_replays_in_order() {
        let hub = Hub::new(HubConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        let subscriber = hub.register(tx).await;

        let envelopes = vec![Envelope::status("one"), Envelope::status("two")];
        hub.send_snapshot(&subscriber, &envelopes).await;

        for expected in ["one", "two"] {
            match rx.recv().await {
                Some(Message::Text(text)) => assert!(text.contains(expected)),
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }
}
