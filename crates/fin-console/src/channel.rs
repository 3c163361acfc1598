//! WebSocket channel to the agent daemon: connect, reconnect with capped
//! exponential backoff, queue outbound frames while the link is down, and
//! watch link liveness with pings.

use std::collections::VecDeque;
use std::time::Duration;

use fin_core::envelope::{self, Envelope};
use fin_core::error::ChannelError;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_QUEUE_CAP: usize = 64;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Outbound frame plus its delivery class. Routine frames may be dropped
/// when the queue is full; critical frames (operator decisions) are kept
/// and re-queued if a send fails mid-flight.
#[derive(Debug, Clone)]
pub enum Outbound {
    Routine(Envelope),
    Critical(Envelope),
}

impl Outbound {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Outbound::Routine(env) | Outbound::Critical(env) => env,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Outbound::Critical(_))
    }
}

/// Bounded FIFO of frames waiting for an open link. At capacity the oldest
/// routine frame is discarded to make room; critical frames are never
/// evicted, so the queue can exceed its cap when it holds only decisions.
#[derive(Debug)]
pub struct SendQueue {
    items: VecDeque<Outbound>,
    cap: usize,
}

impl SendQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::new(),
            cap,
        }
    }

    pub fn push(&mut self, item: Outbound) {
        if self.items.len() >= self.cap {
            if let Some(pos) = self.items.iter().position(|queued| !queued.is_critical()) {
                let dropped = self.items.remove(pos);
                if let Some(dropped) = dropped {
                    warn!(
                        event = "queue_drop",
                        kind = %dropped.envelope().kind,
                        "outbound queue full, dropping oldest routine frame"
                    );
                }
            }
        }
        self.items.push_back(item);
    }

    pub fn drain(&mut self) -> Vec<Outbound> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Events surfaced to the projection / operator loop.
#[derive(Debug)]
pub enum ChannelEvent {
    Connected,
    Frame(Envelope),
    Disconnected { reason: ChannelError },
    /// The manager gave up after too many consecutive connect failures.
    Lost { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: Url,
    pub ping_interval: Duration,
    pub stale_after: Duration,
    pub max_reconnect_attempts: u32,
    pub queue_cap: usize,
}

impl ChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            ping_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            queue_cap: DEFAULT_QUEUE_CAP,
        }
    }
}

/// Delay before reconnect attempt number `attempts` (zero-based):
/// 1s, 2s, 4s, 8s, then capped at 10s.
pub fn backoff_delay(attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    BACKOFF_BASE
        .checked_mul(factor)
        .map_or(BACKOFF_CAP, |delay| delay.min(BACKOFF_CAP))
}

pub struct ChannelManager {
    config: ChannelConfig,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_attempts: u32,
    queue: SendQueue,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Self {
        let queue = SendQueue::new(config.queue_cap);
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            config,
            state_tx,
            reconnect_attempts: 0,
            queue,
        }
    }

    /// Observe the connection state from outside the run loop; the
    /// console's `status` command reads this.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    /// Drives the channel until the outbound sender side closes, the event
    /// receiver goes away, or the reconnect budget runs out.
    pub async fn run(
        mut self,
        mut outbound: mpsc::Receiver<Outbound>,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<(), ChannelError> {
        loop {
            self.set_state(ConnectionState::Connecting);
            let stream = match connect_async(self.config.url.as_str()).await {
                Ok((stream, _response)) => stream,
                Err(err) => {
                    warn!(event = "connect_failed", error = %err, attempts = self.reconnect_attempts);
                    if !self.schedule_retry(&events, &mut outbound).await {
                        self.set_state(ConnectionState::Closed);
                        return Err(ChannelError::ConnectionLost {
                            attempts: self.reconnect_attempts,
                        });
                    }
                    continue;
                }
            };

            self.reconnect_attempts = 0;
            self.set_state(ConnectionState::Open);
            info!(event = "channel_open", url = %self.config.url);
            if events.send(ChannelEvent::Connected).await.is_err() {
                return Ok(());
            }

            let reason = match self.session(stream, &mut outbound, &events).await {
                SessionEnd::Shutdown => {
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
                SessionEnd::Broken(reason) => reason,
            };

            self.set_state(ConnectionState::Closed);
            warn!(event = "channel_closed", reason = %reason);
            if events
                .send(ChannelEvent::Disconnected { reason })
                .await
                .is_err()
            {
                return Ok(());
            }
            if !self.schedule_retry(&events, &mut outbound).await {
                return Err(ChannelError::ConnectionLost {
                    attempts: self.reconnect_attempts,
                });
            }
        }
    }

    /// Sleeps the backoff delay while still accepting outbound frames into
    /// the queue. Returns false once the attempt budget is exhausted.
    async fn schedule_retry(
        &mut self,
        events: &mpsc::Sender<ChannelEvent>,
        outbound: &mut mpsc::Receiver<Outbound>,
    ) -> bool {
        let delay = backoff_delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            let _ = events
                .send(ChannelEvent::Lost {
                    attempts: self.reconnect_attempts,
                })
                .await;
            return false;
        }
        info!(event = "reconnect_scheduled", delay_ms = delay.as_millis() as u64);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                item = outbound.recv() => match item {
                    Some(item) => self.queue.push(item),
                    None => return true,
                },
            }
        }
    }

    async fn session(
        &mut self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        outbound: &mut mpsc::Receiver<Outbound>,
        events: &mpsc::Sender<ChannelEvent>,
    ) -> SessionEnd {
        let (mut sink, mut source) = stream.split();

        // Replay everything that queued up while the link was down before
        // taking new traffic.
        let backlog = self.queue.drain();
        let mut backlog = backlog.into_iter();
        while let Some(item) = backlog.next() {
            if let Some(text) = item.envelope().to_text() {
                if sink.send(Message::Text(text)).await.is_err() {
                    self.queue.push(item);
                    for remaining in backlog {
                        self.queue.push(remaining);
                    }
                    return SessionEnd::Broken(ChannelError::Transport(
                        "send failed during replay".into(),
                    ));
                }
            }
        }

        let mut last_rx = Instant::now();
        let mut ping_ticker = tokio::time::interval(self.config.ping_interval);
        ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_rx = Instant::now();
                        match envelope::decode(&text) {
                            Ok(env) => {
                                if events.send(ChannelEvent::Frame(env)).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Err(err) => {
                                warn!(event = "frame_rejected", error = %err);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_rx = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        return SessionEnd::Broken(ChannelError::Transport(
                            "server closed the connection".into(),
                        ));
                    }
                    Some(Ok(_)) => {
                        debug!(event = "frame_ignored", "non-text frame");
                    }
                    Some(Err(err)) => {
                        return SessionEnd::Broken(ChannelError::Transport(err.to_string()));
                    }
                    None => {
                        return SessionEnd::Broken(ChannelError::Transport("stream ended".into()));
                    }
                },
                item = outbound.recv() => match item {
                    Some(item) => {
                        let text = match item.envelope().to_text() {
                            Some(text) => text,
                            None => continue,
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            self.queue.push(item);
                            return SessionEnd::Broken(ChannelError::Transport("send failed".into()));
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },
                _ = ping_ticker.tick() => {
                    if last_rx.elapsed() > self.config.stale_after {
                        return SessionEnd::Broken(ChannelError::Transport(
                            "no traffic within the stale window".into(),
                        ));
                    }
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        return SessionEnd::Broken(ChannelError::Transport("ping failed".into()));
                    }
                }
            }
        }
    }
}

enum SessionEnd {
    /// The console is shutting down; do not reconnect.
    Shutdown,
    Broken(ChannelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routine(n: usize) -> Outbound {
        Outbound::Routine(Envelope::status(format!("frame {n}")))
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let delays: Vec<u64> = (0..6).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn backoff_survives_large_attempt_counts() {
        assert_eq!(backoff_delay(40), BACKOFF_CAP);
    }

    #[test]
    fn queue_drops_oldest_routine_when_full() {
        let mut queue = SendQueue::new(3);
        for n in 0..5 {
            queue.push(routine(n));
        }
        assert_eq!(queue.len(), 3);
        let kept = queue.drain();
        let first = kept[0].envelope().message.as_deref();
        assert_eq!(first, Some("frame 2"));
    }

    #[test]
    fn queue_never_evicts_critical_frames() {
        let mut queue = SendQueue::new(2);
        queue.push(Outbound::Critical(Envelope::approve("APR-0001", true)));
        queue.push(Outbound::Critical(Envelope::approve("APR-0002", false)));
        queue.push(routine(0));
        queue.push(routine(1));
        // Both decisions survive; the first routine frame was evicted to
        // make room for the second.
        let kept = queue.drain();
        assert_eq!(kept.len(), 3);
        assert!(kept[0].is_critical());
        assert!(kept[1].is_critical());
        assert_eq!(kept[2].envelope().message.as_deref(), Some("frame 1"));
    }

    #[tokio::test]
    async fn dropped_connection_surfaces_transport_error_then_lost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Complete the handshake, then hang up.
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        });

        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let mut config = ChannelConfig::new(url);
        config.max_reconnect_attempts = 1;
        let (_outbound_tx, outbound_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);

        let manager = ChannelManager::new(config);
        let state = manager.state_watch();
        let handle = tokio::spawn(manager.run(outbound_rx, event_tx));

        match event_rx.recv().await {
            Some(ChannelEvent::Connected) => {
                assert_eq!(*state.borrow(), ConnectionState::Open);
            }
            other => panic!("expected Connected, got {other:?}"),
        }
        match event_rx.recv().await {
            Some(ChannelEvent::Disconnected { reason }) => {
                assert!(matches!(reason, ChannelError::Transport(_)));
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
        match event_rx.recv().await {
            Some(ChannelEvent::Lost { attempts: 1 }) => {}
            other => panic!("expected Lost, got {other:?}"),
        }
        match handle.await.unwrap() {
            Err(ChannelError::ConnectionLost { attempts: 1 }) => {}
            other => panic!("expected ConnectionLost, got {other:?}"),
        }
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        // Nothing listens on this port, so every connect fails.
        let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
        let mut config = ChannelConfig::new(url);
        config.max_reconnect_attempts = 1;
        let (_outbound_tx, outbound_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);

        let result = ChannelManager::new(config).run(outbound_rx, event_tx).await;
        match result {
            Err(ChannelError::ConnectionLost { attempts }) => assert_eq!(attempts, 1),
            other => panic!("expected ConnectionLost, got {other:?}"),
        }
        match event_rx.recv().await {
            Some(ChannelEvent::Lost { attempts: 1 }) => {}
            other => panic!("expected Lost event, got {other:?}"),
        }
    }
}
