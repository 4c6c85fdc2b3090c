//! Per-owner status channel for processing progress.
//!
//! [`StatusChannel`] is the hub: the orchestrator publishes a [`StatusEvent`]
//! for a record's owner and every listener currently subscribed for that owner
//! receives it. Nothing is replayed; an owner with no listeners simply drops
//! the event and clients re-fetch current state on (re)connect.
//!
//! [`StatusConnection`] models one client transport. Subscriptions issued
//! while the transport is still handshaking wait in a pending queue and are
//! registered on the hub the moment the transport reports ready (or
//! reconnected), so a listener created in the same tick as the connection does
//! not miss the first progress update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ids::{UserId, VideoId};
use crate::media::ProcessingState;

/// Name of the real-time event carrying a [`StatusEvent`].
pub const STATUS_EVENT_NAME: &str = "statusUpdate";

// ---------------------------------------------------------------------------
// StatusEvent
// ---------------------------------------------------------------------------

/// Progress notification for a single video record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub record_id: VideoId,
    pub state: ProcessingState,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusEvent {
    /// An in-flight `processing` update.
    pub fn processing(record_id: VideoId, progress: u8) -> Self {
        Self {
            record_id,
            state: ProcessingState::Processing,
            progress,
            thumbnail_handle: None,
            duration_seconds: None,
            error_message: None,
        }
    }

    /// The final `completed` update.
    pub fn completed(
        record_id: VideoId,
        thumbnail_handle: Option<String>,
        duration_seconds: Option<f64>,
    ) -> Self {
        Self {
            record_id,
            state: ProcessingState::Completed,
            progress: 100,
            thumbnail_handle,
            duration_seconds,
            error_message: None,
        }
    }

    /// The terminal `failed` update.
    pub fn failed(record_id: VideoId, error_message: impl Into<String>) -> Self {
        Self {
            record_id,
            state: ProcessingState::Failed,
            progress: 0,
            thumbnail_handle: None,
            duration_seconds: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn with_thumbnail(mut self, handle: Option<String>) -> Self {
        self.thumbnail_handle = handle;
        self
    }

    pub fn with_duration(mut self, duration: Option<f64>) -> Self {
        self.duration_seconds = duration;
        self
    }
}

/// Receiving side handed to the channel by a subscriber.
pub type StatusListener = mpsc::UnboundedSender<StatusEvent>;

// ---------------------------------------------------------------------------
// StatusChannel
// ---------------------------------------------------------------------------

struct ListenerEntry {
    id: u64,
    tx: StatusListener,
}

/// Concurrency-safe publish/subscribe hub keyed by owner.
#[derive(Default)]
pub struct StatusChannel {
    listeners: RwLock<HashMap<UserId, Vec<ListenerEntry>>>,
    next_id: AtomicU64,
}

impl StatusChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every listener currently subscribed for `owner`.
    ///
    /// Returns the number of listeners that received it. Listeners whose
    /// receiving half has been dropped are pruned.
    pub fn publish(&self, owner: UserId, event: StatusEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let listeners = self.listeners.read();
            let Some(entries) = listeners.get(&owner) else {
                tracing::trace!(owner = %owner, record_id = %event.record_id, "No status listeners; event dropped");
                return 0;
            };
            for entry in entries {
                if entry.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(entry.id);
                }
            }
        }

        for id in closed {
            self.remove(owner, id);
        }

        delivered
    }

    /// Register `listener` for `owner` and return a handle that removes it.
    pub fn subscribe(self: &Arc<Self>, owner: UserId, listener: StatusListener) -> Subscription {
        let id = self.allocate_id();
        self.register(owner, id, listener);
        Subscription {
            channel: Arc::downgrade(self),
            owner,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Number of listeners currently registered for `owner`.
    pub fn subscriber_count(&self, owner: UserId) -> usize {
        self.listeners.read().get(&owner).map_or(0, Vec::len)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, owner: UserId, id: u64, tx: StatusListener) {
        self.listeners
            .write()
            .entry(owner)
            .or_default()
            .push(ListenerEntry { id, tx });
    }

    fn remove(&self, owner: UserId, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(&owner) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&owner);
        }
        removed
    }
}

/// Handle returned by [`StatusChannel::subscribe`].
///
/// Unsubscribing is idempotent and also happens on drop. Each handle removes
/// only its own listener, never a replacement registered for the same owner.
pub struct Subscription {
    channel: Weak<StatusChannel>,
    owner: UserId,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = self.channel.upgrade() {
            channel.remove(self.owner, self.id);
        }
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// StatusConnection
// ---------------------------------------------------------------------------

/// Lifecycle of a client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Handshake in progress; subscriptions are queued.
    Connecting,
    /// Subscriptions go straight to the hub.
    Ready,
    /// Transport dropped; subscriptions are parked until reconnect.
    Disconnected,
}

struct QueuedSubscription {
    id: u64,
    owner: UserId,
    tx: StatusListener,
}

struct ConnectionInner {
    state: TransportState,
    pending: Vec<QueuedSubscription>,
    active: Vec<QueuedSubscription>,
}

/// One client transport bound to a [`StatusChannel`].
pub struct StatusConnection {
    channel: Arc<StatusChannel>,
    inner: Mutex<ConnectionInner>,
}

impl StatusConnection {
    /// Create a connection in the [`TransportState::Connecting`] state.
    pub fn new(channel: Arc<StatusChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            inner: Mutex::new(ConnectionInner {
                state: TransportState::Connecting,
                pending: Vec::new(),
                active: Vec::new(),
            }),
        })
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().state
    }

    /// Number of subscriptions waiting for the transport.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Subscribe `listener` to `owner`'s events through this transport.
    ///
    /// When the transport is not ready the request is queued and flushed by
    /// [`mark_ready`](Self::mark_ready) or [`mark_reconnected`](Self::mark_reconnected).
    pub fn subscribe(
        self: &Arc<Self>,
        owner: UserId,
        listener: StatusListener,
    ) -> ConnectionSubscription {
        let id = self.channel.allocate_id();
        let mut inner = self.inner.lock();
        let queued = QueuedSubscription {
            id,
            owner,
            tx: listener,
        };
        if inner.state == TransportState::Ready {
            self.channel.register(owner, id, queued.tx.clone());
            inner.active.push(queued);
        } else {
            tracing::debug!(owner = %owner, "Transport not ready; queueing subscription");
            inner.pending.push(queued);
        }
        ConnectionSubscription {
            connection: Arc::downgrade(self),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Mark the transport ready and flush the pending queue.
    ///
    /// Returns the number of subscriptions flushed.
    pub fn mark_ready(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.state = TransportState::Ready;
        let pending = std::mem::take(&mut inner.pending);
        let flushed = pending.len();
        for queued in pending {
            self.channel.register(queued.owner, queued.id, queued.tx.clone());
            inner.active.push(queued);
        }
        flushed
    }

    /// Same as [`mark_ready`](Self::mark_ready); parked subscriptions are
    /// re-registered.
    pub fn mark_reconnected(&self) -> usize {
        self.mark_ready()
    }

    /// Mark the transport disconnected. Active subscriptions leave the hub
    /// and wait in the pending queue for a reconnect.
    pub fn mark_disconnected(&self) {
        let mut inner = self.inner.lock();
        inner.state = TransportState::Disconnected;
        let active = std::mem::take(&mut inner.active);
        for queued in active {
            self.channel.remove(queued.owner, queued.id);
            inner.pending.push(queued);
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.pending.retain(|q| q.id != id);
        if let Some(pos) = inner.active.iter().position(|q| q.id == id) {
            let queued = inner.active.remove(pos);
            self.channel.remove(queued.owner, queued.id);
        }
    }
}

/// Handle returned by [`StatusConnection::subscribe`].
///
/// Safe to unsubscribe repeatedly, after a disconnect, or after the connection
/// is gone. Also purges a still-pending request.
pub struct ConnectionSubscription {
    connection: Weak<StatusConnection>,
    id: u64,
    active: AtomicBool,
}

impl ConnectionSubscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.unsubscribe(self.id);
        }
    }
}

impl Drop for ConnectionSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Arc<StatusChannel> {
        Arc::new(StatusChannel::new())
    }

    #[test]
    fn publish_reaches_owner_only() {
        let ch = channel();
        let alice = UserId::new();
        let bob = UserId::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _sa = ch.subscribe(alice, tx_a);
        let _sb = ch.subscribe(bob, tx_b);

        let vid = VideoId::new();
        assert_eq!(ch.publish(alice, StatusEvent::processing(vid, 10)), 1);

        assert_eq!(rx_a.try_recv().unwrap().progress, 10);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn publish_without_listeners_is_dropped() {
        let ch = channel();
        assert_eq!(
            ch.publish(UserId::new(), StatusEvent::processing(VideoId::new(), 10)),
            0
        );
    }

    #[test]
    fn events_arrive_in_publish_order() {
        let ch = channel();
        let owner = UserId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = ch.subscribe(owner, tx);
        let vid = VideoId::new();
        for p in [10, 30, 80] {
            ch.publish(owner, StatusEvent::processing(vid, p));
        }
        ch.publish(owner, StatusEvent::completed(vid, None, None));

        let got: Vec<u8> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.progress)
            .collect();
        assert_eq!(got, vec![10, 30, 80, 100]);
    }

    #[test]
    fn unsubscribe_twice_keeps_replacement() {
        let ch = channel();
        let owner = UserId::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let first = ch.subscribe(owner, tx1);
        first.unsubscribe();

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _second = ch.subscribe(owner, tx2);
        first.unsubscribe();

        assert_eq!(ch.subscriber_count(owner), 1);
        ch.publish(owner, StatusEvent::processing(VideoId::new(), 10));
        assert!(rx2.try_recv().is_ok());
        assert!(rx2.try_recv().is_err(), "delivered exactly once");
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let ch = channel();
        let owner = UserId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let _sub = ch.subscribe(owner, tx);
        drop(rx);
        assert_eq!(ch.publish(owner, StatusEvent::processing(VideoId::new(), 10)), 0);
        assert_eq!(ch.subscriber_count(owner), 0);
    }

    #[test]
    fn subscription_drop_unsubscribes() {
        let ch = channel();
        let owner = UserId::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        {
            let _sub = ch.subscribe(owner, tx);
            assert_eq!(ch.subscriber_count(owner), 1);
        }
        assert_eq!(ch.subscriber_count(owner), 0);
    }

    #[test]
    fn subscribe_before_ready_receives_first_event() {
        let ch = channel();
        let owner = UserId::new();
        let conn = StatusConnection::new(ch.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = conn.subscribe(owner, tx);

        assert_eq!(conn.state(), TransportState::Connecting);
        assert_eq!(conn.pending_len(), 1);
        assert_eq!(ch.subscriber_count(owner), 0);

        assert_eq!(conn.mark_ready(), 1);
        let vid = VideoId::new();
        ch.publish(owner, StatusEvent::processing(vid, 10));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.record_id, vid);
        assert_eq!(first.progress, 10);
    }

    #[test]
    fn subscribe_when_ready_registers_immediately() {
        let ch = channel();
        let owner = UserId::new();
        let conn = StatusConnection::new(ch.clone());
        conn.mark_ready();
        let (tx, _rx) = mpsc::unbounded_channel();
        let _sub = conn.subscribe(owner, tx);
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(ch.subscriber_count(owner), 1);
    }

    #[test]
    fn unsubscribe_purges_pending_entry() {
        let ch = channel();
        let owner = UserId::new();
        let conn = StatusConnection::new(ch.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = conn.subscribe(owner, tx);
        sub.unsubscribe();
        assert_eq!(conn.pending_len(), 0);

        conn.mark_ready();
        assert_eq!(ch.subscriber_count(owner), 0);
    }

    #[test]
    fn disconnect_parks_and_reconnect_restores() {
        let ch = channel();
        let owner = UserId::new();
        let conn = StatusConnection::new(ch.clone());
        conn.mark_ready();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = conn.subscribe(owner, tx);

        conn.mark_disconnected();
        assert_eq!(ch.subscriber_count(owner), 0);
        assert_eq!(ch.publish(owner, StatusEvent::processing(VideoId::new(), 10)), 0);

        assert_eq!(conn.mark_reconnected(), 1);
        ch.publish(owner, StatusEvent::processing(VideoId::new(), 30));
        assert_eq!(rx.try_recv().unwrap().progress, 30);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(ch.subscriber_count(owner), 0);
    }

    #[test]
    fn unsubscribe_after_disconnect_does_not_panic() {
        let ch = channel();
        let owner = UserId::new();
        let conn = StatusConnection::new(ch.clone());
        conn.mark_ready();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = conn.subscribe(owner, tx);
        conn.mark_disconnected();
        sub.unsubscribe();
        assert_eq!(conn.pending_len(), 0);
        drop(conn);
        sub.unsubscribe();
    }

    #[test]
    fn event_json_shape() {
        let vid = VideoId::new();
        let json = serde_json::to_value(StatusEvent::completed(
            vid,
            Some("thumbnails/x.jpg".into()),
            Some(10.0),
        ))
        .unwrap();
        assert_eq!(json["recordId"], vid.to_string());
        assert_eq!(json["state"], "completed");
        assert_eq!(json["progress"], 100);
        assert_eq!(json["thumbnailHandle"], "thumbnails/x.jpg");
        assert_eq!(json["durationSeconds"], 10.0);
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn failed_event_carries_message() {
        let ev = StatusEvent::failed(VideoId::new(), "probe failed");
        assert_eq!(ev.state, ProcessingState::Failed);
        assert_eq!(ev.progress, 0);
        assert_eq!(ev.error_message.as_deref(), Some("probe failed"));
    }
}
