//! Server-side subscription registry.
//!
//! A subscription is an opaque id bound to a scope and a delivery queue.
//! Workspace-scoped subscriptions read the workspace's observed-event log;
//! conversation-scoped ones attach to a session multiplexer and receive its
//! output as `session-output` events.
//!
//! Catch-up is exact: replay of everything after the requested cursor and
//! registration for live delivery happen in one critical section, so nothing
//! published concurrently is missed or delivered twice.
//!
//! Every subscription of a connection shares one bounded [`DeliveryQueue`].
//! When a delivery does not fit, the queue is closed and all of its
//! subscriptions are dropped. The receiver drains what was already queued and
//! then ends, which is the client's signal to reconnect from the last cursor
//! it processed.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::StreamError,
    multiplexer::{AttachmentSink, SessionMultiplexer, SinkClosed},
    observed_log::{ObservedEntry, ObservedEventLog},
    protocol::{session_exit_event, session_output_event, StreamDelivery, SubscribeAck},
    session_pool::SessionPool,
    types::{AttachmentId, Cursor, SessionExit, StreamScope, SubscriptionId, WorkspaceKey},
};

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

/// Connection that owns a set of subscriptions, so they can be torn down
/// together.
pub type OwnerId = String;

/// Bounded delivery queue shared by every subscription of one connection.
///
/// Clones share the single underlying sender, so [`DeliveryQueue::close`]
/// ends the receiving side once its buffered deliveries are drained.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: Arc<Mutex<Option<mpsc::Sender<StreamDelivery>>>>,
}

impl DeliveryQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<StreamDelivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Free slots left; zero once closed.
    pub fn capacity(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, mpsc::Sender::capacity)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, mpsc::Sender::is_closed)
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Enqueue without waiting. A full or closed queue is closed for good and
    /// the delivery is refused.
    fn offer(&self, delivery: StreamDelivery) -> Result<(), SinkClosed> {
        let mut guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SinkClosed);
        };
        if tx.try_send(delivery).is_err() {
            guard.take();
            return Err(SinkClosed);
        }
        Ok(())
    }
}

enum Target {
    Workspace(WorkspaceKey),
    Conversation {
        session: Arc<SessionMultiplexer>,
        attachment_id: AttachmentId,
    },
}

struct Subscription {
    owner: Option<OwnerId>,
    queue: DeliveryQueue,
    target: Target,
}

#[derive(Default)]
struct ManagerState {
    logs: HashMap<WorkspaceKey, ObservedEventLog>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

pub struct SubscriptionManager {
    log_capacity: usize,
    sessions: SessionPool,
    state: Mutex<ManagerState>,
}

impl SubscriptionManager {
    pub fn new(log_capacity: usize, sessions: SessionPool) -> Self {
        Self {
            log_capacity,
            sessions,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn subscribe(
        &self,
        scope: &StreamScope,
        after_cursor: Option<Cursor>,
        queue: &DeliveryQueue,
        owner: Option<OwnerId>,
    ) -> Result<SubscribeAck, StreamError> {
        self.prune_closed();
        if queue.is_closed() {
            return Err(StreamError::QueueClosed);
        }
        let subscription_id = format!("sub_{}", Uuid::new_v4().simple());
        match &scope.conversation_id {
            None => self.subscribe_workspace(scope, after_cursor, queue, owner, subscription_id),
            Some(conversation_id) => self.subscribe_conversation(
                conversation_id,
                after_cursor,
                queue,
                owner,
                subscription_id,
            ),
        }
    }

    fn subscribe_workspace(
        &self,
        scope: &StreamScope,
        after_cursor: Option<Cursor>,
        queue: &DeliveryQueue,
        owner: Option<OwnerId>,
        subscription_id: SubscriptionId,
    ) -> Result<SubscribeAck, StreamError> {
        let key = scope.workspace_key();
        let mut state = self.state.lock();
        let log = state
            .logs
            .entry(key.clone())
            .or_insert_with(|| ObservedEventLog::new(self.log_capacity));
        let baseline = log.current_cursor();

        if let Some(after) = after_cursor {
            // A cursor past the log's end was issued by an earlier server.
            if after > baseline {
                return Err(StreamError::CursorAhead {
                    requested: after,
                    current: baseline,
                });
            }
            let (events, gap) = log.replay_since(after);
            if let Some(oldest) = gap {
                tracing::warn!(
                    target = "agent_mux::subscriptions",
                    workspace = %key.workspace_id,
                    after,
                    oldest_available = oldest,
                    "replay window no longer covers requested cursor"
                );
            }
            let requested = events.len();
            let capacity = queue.capacity();
            if requested > capacity {
                return Err(StreamError::ReplayOverflow {
                    requested,
                    capacity,
                });
            }
            for entry in events {
                let delivery = StreamDelivery {
                    subscription_id: subscription_id.clone(),
                    cursor: entry.cursor,
                    event: entry.event,
                };
                if queue.offer(delivery).is_err() {
                    return Err(StreamError::ReplayOverflow {
                        requested,
                        capacity,
                    });
                }
            }
        }

        state.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                owner,
                queue: queue.clone(),
                target: Target::Workspace(key),
            },
        );
        tracing::debug!(
            target = "agent_mux::subscriptions",
            subscription = %subscription_id,
            after = ?after_cursor,
            baseline,
            "workspace subscription registered"
        );
        Ok(SubscribeAck {
            subscription_id,
            cursor: Some(baseline),
        })
    }

    fn subscribe_conversation(
        &self,
        conversation_id: &str,
        after_cursor: Option<Cursor>,
        queue: &DeliveryQueue,
        owner: Option<OwnerId>,
        subscription_id: SubscriptionId,
    ) -> Result<SubscribeAck, StreamError> {
        let session = self
            .sessions
            .get(conversation_id)
            .ok_or_else(|| StreamError::UnknownConversation(conversation_id.to_string()))?;
        let since = after_cursor.unwrap_or_else(|| session.latest_cursor());

        let capacity = queue.capacity();
        let pending = session.retained_since(since);
        if pending > capacity {
            return Err(StreamError::ReplayOverflow {
                requested: pending,
                capacity,
            });
        }

        let forward = ConversationSink {
            subscription_id: subscription_id.clone(),
            session_id: conversation_id.to_string(),
            last_cursor: AtomicU64::new(since),
            queue: queue.clone(),
        };
        let Some(attached) = session.attach(Box::new(forward), since) else {
            if session.is_closed() {
                return Err(StreamError::UnknownConversation(conversation_id.to_string()));
            }
            return Err(StreamError::ReplayOverflow {
                requested: session.retained_since(since),
                capacity,
            });
        };

        self.state.lock().subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                owner,
                queue: queue.clone(),
                target: Target::Conversation {
                    session,
                    attachment_id: attached.attachment_id,
                },
            },
        );
        tracing::debug!(
            target = "agent_mux::subscriptions",
            subscription = %subscription_id,
            session = %conversation_id,
            since,
            replayed = attached.replayed,
            "conversation subscription registered"
        );
        Ok(SubscribeAck {
            subscription_id,
            cursor: Some(since),
        })
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self.state.lock().subscriptions.remove(subscription_id);
        match removed {
            Some(subscription) => {
                release(subscription);
                true
            }
            None => false,
        }
    }

    /// Drop every subscription held by `owner`. Returns how many were removed.
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let removed: Vec<Subscription> = {
            let mut state = self.state.lock();
            let ids: Vec<SubscriptionId> = state
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.owner.as_deref() == Some(owner))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.subscriptions.remove(id))
                .collect()
        };
        let count = removed.len();
        removed.into_iter().for_each(release);
        count
    }

    /// Append `event` to the workspace log and deliver it to every matching
    /// subscriber. Returns the cursor assigned to it.
    pub fn publish(&self, key: &WorkspaceKey, event: Value) -> Cursor {
        let mut state = self.state.lock();
        let cursor = state
            .logs
            .entry(key.clone())
            .or_insert_with(|| ObservedEventLog::new(self.log_capacity))
            .append(event.clone());

        for (subscription_id, subscription) in &state.subscriptions {
            let Target::Workspace(sub_key) = &subscription.target else {
                continue;
            };
            if sub_key != key {
                continue;
            }
            let delivery = StreamDelivery {
                subscription_id: subscription_id.clone(),
                cursor,
                event: event.clone(),
            };
            if subscription.queue.offer(delivery).is_err() {
                tracing::warn!(
                    target = "agent_mux::subscriptions",
                    subscription = %subscription_id,
                    cursor,
                    "subscriber queue full or closed; dropping connection"
                );
            }
        }
        let dropped = take_closed(&mut state);
        drop(state);
        dropped.into_iter().for_each(release);
        cursor
    }

    /// Remove subscriptions whose queue has been closed by a lagging delivery
    /// or a departed receiver.
    fn prune_closed(&self) {
        let dropped = take_closed(&mut self.state.lock());
        dropped.into_iter().for_each(release);
    }

    pub fn replay(&self, key: &WorkspaceKey, after: Cursor) -> (Vec<ObservedEntry>, Option<Cursor>) {
        self.state
            .lock()
            .logs
            .get(key)
            .map(|log| log.replay_since(after))
            .unwrap_or_default()
    }

    pub fn current_cursor(&self, key: &WorkspaceKey) -> Cursor {
        self.state
            .lock()
            .logs
            .get(key)
            .map(ObservedEventLog::current_cursor)
            .unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.prune_closed();
        self.state.lock().subscriptions.len()
    }
}

fn take_closed(state: &mut ManagerState) -> Vec<Subscription> {
    let closed: Vec<SubscriptionId> = state
        .subscriptions
        .iter()
        .filter(|(_, sub)| sub.queue.is_closed())
        .map(|(id, _)| id.clone())
        .collect();
    closed
        .iter()
        .filter_map(|id| state.subscriptions.remove(id))
        .collect()
}

fn release(subscription: Subscription) {
    if let Target::Conversation {
        session,
        attachment_id,
    } = subscription.target
    {
        session.detach(attachment_id);
    }
}

/// Forwards one session's output onto a subscriber queue.
struct ConversationSink {
    subscription_id: SubscriptionId,
    session_id: String,
    last_cursor: AtomicU64,
    queue: DeliveryQueue,
}

impl AttachmentSink for ConversationSink {
    fn on_data(&self, cursor: Cursor, chunk: &[u8]) -> Result<(), SinkClosed> {
        self.queue.offer(StreamDelivery {
            subscription_id: self.subscription_id.clone(),
            cursor,
            event: session_output_event(&self.session_id, chunk),
        })?;
        self.last_cursor.store(cursor, Ordering::Relaxed);
        Ok(())
    }

    /// The exit follows the last chunk at the next cursor.
    fn on_exit(&self, exit: &SessionExit) {
        let _ = self.queue.offer(StreamDelivery {
            subscription_id: self.subscription_id.clone(),
            cursor: self.last_cursor.load(Ordering::Relaxed) + 1,
            event: session_exit_event(&self.session_id, exit),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{DeliveryQueue, SubscriptionManager};
    use crate::{
        error::StreamError,
        multiplexer::{BacklogPolicy, SessionMultiplexer},
        protocol::{decode_session_chunk, StreamDelivery},
        session_pool::SessionPool,
        terminal_buffer::PlainTextBuffer,
        types::{SessionExit, StreamScope},
    };

    fn scope() -> StreamScope {
        StreamScope::workspace("t1", "u1", "w1")
    }

    fn drain(rx: &mut mpsc::Receiver<StreamDelivery>) -> Vec<StreamDelivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            out.push(delivery);
        }
        out
    }

    #[tokio::test]
    async fn from_now_subscription_reports_tail_and_skips_history() {
        let manager = SubscriptionManager::new(100, SessionPool::new(BacklogPolicy::default()));
        let key = scope().workspace_key();
        manager.publish(&key, json!({"type": "task-deleted", "taskId": "a"}));
        manager.publish(&key, json!({"type": "task-deleted", "taskId": "b"}));

        let (tx, mut rx) = DeliveryQueue::bounded(16);
        let ack = manager.subscribe(&scope(), None, &tx, None).unwrap();
        assert_eq!(ack.cursor, Some(2));
        assert!(ack.subscription_id.starts_with("sub_"));
        assert!(drain(&mut rx).is_empty());

        assert_eq!(manager.publish(&key, json!({"type": "task-deleted", "taskId": "c"})), 3);
        let live = drain(&mut rx);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].cursor, 3);
        assert_eq!(live[0].subscription_id, ack.subscription_id);
    }

    #[tokio::test]
    async fn numeric_cursor_replays_then_goes_live() {
        let manager = SubscriptionManager::new(100, SessionPool::new(BacklogPolicy::default()));
        let key = scope().workspace_key();
        for id in ["a", "b", "c"] {
            manager.publish(&key, json!({"type": "task-deleted", "taskId": id}));
        }

        let (tx, mut rx) = DeliveryQueue::bounded(16);
        manager.subscribe(&scope(), Some(1), &tx, None).unwrap();
        manager.publish(&key, json!({"type": "task-deleted", "taskId": "d"}));
        let cursors: Vec<_> = drain(&mut rx).iter().map(|d| d.cursor).collect();
        assert_eq!(cursors, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn other_workspaces_are_isolated() {
        let manager = SubscriptionManager::new(100, SessionPool::new(BacklogPolicy::default()));
        let (tx, mut rx) = DeliveryQueue::bounded(16);
        manager.subscribe(&scope(), None, &tx, None).unwrap();
        let other = StreamScope::workspace("t1", "u1", "w2").workspace_key();
        assert_eq!(manager.publish(&other, json!({"type": "x"})), 1);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(manager.current_cursor(&scope().workspace_key()), 0);
    }

    #[tokio::test]
    async fn replay_larger_than_queue_is_rejected() {
        let manager = SubscriptionManager::new(100, SessionPool::new(BacklogPolicy::default()));
        let key = scope().workspace_key();
        for _ in 0..5 {
            manager.publish(&key, json!({"type": "x"}));
        }
        let (tx, _rx) = DeliveryQueue::bounded(2);
        let err = manager.subscribe(&scope(), Some(0), &tx, None).unwrap_err();
        assert!(matches!(err, StreamError::ReplayOverflow { requested: 5, capacity: 2 }));
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped_but_others_keep_receiving() {
        let manager = SubscriptionManager::new(100, SessionPool::new(BacklogPolicy::default()));
        let key = scope().workspace_key();
        let (slow_tx, mut slow_rx) = DeliveryQueue::bounded(1);
        let (fast_tx, mut fast_rx) = DeliveryQueue::bounded(16);
        manager.subscribe(&scope(), None, &slow_tx, None).unwrap();
        manager.subscribe(&scope(), None, &fast_tx, None).unwrap();

        manager.publish(&key, json!({"n": 1}));
        manager.publish(&key, json!({"n": 2}));
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(drain(&mut fast_rx).len(), 2);

        // The slow receiver keeps what was queued, then sees the end.
        assert_eq!(slow_rx.recv().await.map(|d| d.cursor), Some(1));
        assert!(slow_rx.recv().await.is_none());
        assert!(slow_tx.is_closed());
        let err = manager.subscribe(&scope(), None, &slow_tx, None).unwrap_err();
        assert!(matches!(err, StreamError::QueueClosed));
    }

    #[tokio::test]
    async fn cursor_past_the_log_end_is_rejected() {
        let manager = SubscriptionManager::new(100, SessionPool::new(BacklogPolicy::default()));
        manager.publish(&scope().workspace_key(), json!({"type": "x"}));
        let (tx, _rx) = DeliveryQueue::bounded(16);
        let err = manager.subscribe(&scope(), Some(7), &tx, None).unwrap_err();
        assert!(matches!(err, StreamError::CursorAhead { requested: 7, current: 1 }));
        assert_eq!(err.code(), "cursor_ahead");
        assert!(manager.subscribe(&scope(), Some(1), &tx, None).is_ok());
    }

    #[tokio::test]
    async fn failed_conversation_sink_is_pruned() {
        let pool = SessionPool::new(BacklogPolicy::default());
        let mux = Arc::new(SessionMultiplexer::new(
            "c1",
            None,
            BacklogPolicy::UNBOUNDED,
            Box::new(PlainTextBuffer::new(80, 24)),
        ));
        pool.adopt(mux.clone(), "agent").unwrap();

        let manager = SubscriptionManager::new(100, pool);
        let (tx, rx) = DeliveryQueue::bounded(4);
        manager
            .subscribe(&scope().with_conversation("c1"), None, &tx, None)
            .unwrap();
        assert_eq!(manager.subscription_count(), 1);

        drop(rx);
        mux.write(b"lost");
        assert_eq!(mux.attachment_count(), 0);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_and_owner_teardown() {
        let manager = SubscriptionManager::new(100, SessionPool::new(BacklogPolicy::default()));
        let (tx, _rx) = DeliveryQueue::bounded(16);
        let a = manager.subscribe(&scope(), None, &tx, Some("conn-1".into())).unwrap();
        manager.subscribe(&scope(), None, &tx, Some("conn-1".into())).unwrap();
        manager.subscribe(&scope(), None, &tx, Some("conn-2".into())).unwrap();

        assert!(manager.unsubscribe(&a.subscription_id));
        assert!(!manager.unsubscribe(&a.subscription_id));
        assert_eq!(manager.unsubscribe_owner("conn-1"), 1);
        assert_eq!(manager.subscription_count(), 1);
    }

    #[tokio::test]
    async fn conversation_scope_forwards_session_output() {
        let pool = SessionPool::new(BacklogPolicy::default());
        let mux = Arc::new(SessionMultiplexer::new(
            "c1",
            None,
            BacklogPolicy::UNBOUNDED,
            Box::new(PlainTextBuffer::new(80, 24)),
        ));
        pool.adopt(mux.clone(), "agent").unwrap();
        mux.write(b"one");
        mux.write(b"two");

        let manager = SubscriptionManager::new(100, pool);
        let (tx, mut rx) = DeliveryQueue::bounded(16);
        let ack = manager
            .subscribe(&scope().with_conversation("c1"), Some(1), &tx, Some("conn".into()))
            .unwrap();
        assert_eq!(ack.cursor, Some(1));

        mux.write(b"three");
        mux.emit_exit(SessionExit { code: Some(0), signal: None });
        let deliveries = drain(&mut rx);
        let chunks: Vec<Vec<u8>> = deliveries
            .iter()
            .filter_map(|d| decode_session_chunk(&d.event))
            .collect();
        assert_eq!(chunks, vec![b"two".to_vec(), b"three".to_vec()]);
        let exit = deliveries.last().unwrap();
        assert_eq!(exit.event["type"], "session-exit");
        assert_eq!(exit.cursor, 4);

        assert_eq!(manager.unsubscribe_owner("conn"), 1);
        assert_eq!(mux.attachment_count(), 0);
    }

    #[tokio::test]
    async fn unknown_conversation_is_an_error() {
        let manager = SubscriptionManager::new(100, SessionPool::new(BacklogPolicy::default()));
        let (tx, _rx) = DeliveryQueue::bounded(16);
        let err = manager
            .subscribe(&scope().with_conversation("nope"), None, &tx, None)
            .unwrap_err();
        assert!(matches!(err, StreamError::UnknownConversation(ref id) if id == "nope"));
    }
}
