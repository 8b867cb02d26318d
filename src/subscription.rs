use crate::error::{ControlError, Result};
use crate::mirror::ClientEventKind;
use crate::types::{Client, ClientId, Endpoint, Group, ServerStatus, Stream};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    /// The server closed the stream
    EndOfStream,
    /// Socket or framing error
    Io(String),
    /// The connection was never established
    ConnectFailed(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "disconnect requested"),
            DisconnectReason::EndOfStream => write!(f, "connection closed by server"),
            DisconnectReason::Io(e) => write!(f, "I/O error: {}", e),
            DisconnectReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
        }
    }
}

/// Connection lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connecting(Endpoint),
    Connected(Endpoint),
    Disconnected {
        endpoint: Endpoint,
        reason: DisconnectReason,
    },
}

/// Change to the mirrored server state
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// The whole state was replaced (full status or `Server.OnUpdate`)
    StatusReplaced(Arc<ServerStatus>),

    /// A client was inserted or replaced
    ClientChanged {
        client: Box<Client>,
        kind: ClientEventKind,
    },

    /// A group's own settings or membership changed
    GroupChanged(Box<Group>),

    /// A stream was inserted or replaced
    StreamChanged(Box<Stream>),

    /// A client was removed from the mirror
    ClientPurged(ClientId),

    /// Raw server notification, forwarded whether or not it changed anything
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Handle for a handler registered with [`EventBus::subscribe_fn`]
///
/// Ids are unique across all buses of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(0);

/// Fan-out of events to any number of subscribers
///
/// Publishing never blocks: each subscriber has its own buffer of
/// `capacity` events and falls behind on its own if it is slow.
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
    handlers: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
}

impl<T> EventBus<T>
where
    T: Clone + Send + 'static,
{
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver an event to all current subscribers
    pub fn publish(&self, event: T) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    /// Subscribe with a receiver the caller polls
    pub fn subscribe(&self) -> EventReceiver<T> {
        EventReceiver::new(self.tx.subscribe())
    }

    /// Subscribe with a callback
    ///
    /// The callback runs on its own task, so it never delays the publisher.
    /// A panic inside the callback is logged and the subscription keeps
    /// going. Must be called from within a tokio runtime.
    pub fn subscribe_fn<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                            tracing::error!("Event handler {:?} panicked", id);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Event handler {:?} lagged by {} events", id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        id
    }

    /// Remove a callback subscription; returns false if it was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let handle = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Receiver for events of one kind
pub struct EventReceiver<T> {
    rx: broadcast::Receiver<T>,
}

/// Receiver for connection lifecycle events
pub type LifecycleReceiver = EventReceiver<LifecycleEvent>;

/// Receiver for state changes
pub type StateReceiver = EventReceiver<StateEvent>;

impl<T: Clone> EventReceiver<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Fails with [`ControlError::ChannelError`] if this receiver fell
    /// behind (the missed events are gone, later ones still arrive) or the
    /// session was dropped.
    pub async fn recv(&mut self) -> Result<T> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => {
                ControlError::ChannelError("event channel closed".to_string())
            }
            broadcast::error::RecvError::Lagged(n) => {
                ControlError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive an event without waiting
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => {
                Err(ControlError::ChannelError("event channel closed".to_string()))
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(ControlError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_publish_reaches_every_receiver() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(1u32);
        bus.publish(2u32);

        assert_eq!(a.recv().await.unwrap(), 1);
        assert_eq!(a.recv().await.unwrap(), 2);
        assert_eq!(b.recv().await.unwrap(), 1);
        assert_eq!(b.try_recv().unwrap(), Some(2));
        assert_eq!(b.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(1);
        bus.publish("nobody listens");
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let panicking_calls = calls.clone();
        bus.subscribe_fn(move |event: u32| {
            panicking_calls.fetch_add(1, Ordering::SeqCst);
            if event == 1 {
                panic!("subscriber bug");
            }
        });
        bus.subscribe_fn(move |event: u32| {
            let _ = tx.send(event);
        });

        bus.publish(1);
        bus.publish(2);

        let wait = Duration::from_secs(1);
        assert_eq!(timeout(wait, rx.recv()).await.unwrap(), Some(1));
        assert_eq!(timeout(wait, rx.recv()).await.unwrap(), Some(2));

        // the panicking subscriber survived its panic and saw the second event
        timeout(wait, async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.subscribe_fn(move |event: u32| {
            let _ = tx.send(event);
        });

        bus.publish(1);
        assert_eq!(
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap(),
            Some(1)
        );

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(2);

        // the handler task is gone, so its sender is dropped
        assert_eq!(
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_slow_receiver_reports_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5u32 {
            bus.publish(i);
        }

        assert!(matches!(rx.recv().await, Err(ControlError::ChannelError(_))));
        assert_eq!(rx.recv().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_lagging_handler_skips_oldest_and_continues() {
        let bus = EventBus::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn(move |event: u32| {
            let _ = tx.send(event);
        });

        // single-threaded runtime: the handler task cannot run before we yield
        for i in 0..5u32 {
            bus.publish(i);
        }

        let wait = Duration::from_secs(1);
        assert_eq!(timeout(wait, rx.recv()).await.unwrap(), Some(3));
        assert_eq!(timeout(wait, rx.recv()).await.unwrap(), Some(4));

        bus.publish(5);
        assert_eq!(timeout(wait, rx.recv()).await.unwrap(), Some(5));
    }
}
