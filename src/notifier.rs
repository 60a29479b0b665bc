//! Subscriber adapters binding one live connection to the hub.
//!
//! A [`Subscriber`] registers itself on [`Subscriber::connect`] and must be
//! closed on every exit path of the connection that owns it. Writes to one
//! connection are serialized by a per-subscriber lock. A failed write is
//! reported to the owner through [`Subscriber::transport_failed`].

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::events::{DomainEvent, WireFrame};
use crate::hub::{Hub, Notifier, SubscriberId};

/// Write side of one real-time connection.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, frame: WireFrame) -> Result<(), DeliveryError>;

    /// Release the connection. Errors are ignored, the peer may already be gone.
    async fn close(&mut self);
}

/// Text frames over the write half of a WebSocket.
pub struct WebSocketTransport {
    sink: SplitSink<WebSocket, Message>,
    write_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>, write_timeout: Duration) -> Self {
        Self {
            sink,
            write_timeout,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.write_timeout, self.sink.send(Message::Text(frame.text)))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeliveryError::transport(e.to_string())),
            Err(_) => Err(DeliveryError::Timeout(self.write_timeout)),
        }
    }

    async fn close(&mut self) {
        let _ = tokio::time::timeout(self.write_timeout, self.sink.close()).await;
    }
}

/// Frames pushed into a channel, drained by a response stream (SSE).
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<WireFrame>>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WireFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), DeliveryError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| DeliveryError::Closed),
            None => Err(DeliveryError::Closed),
        }
    }

    async fn close(&mut self) {
        // Dropping the sender ends the receiving stream.
        self.tx.take();
    }
}

/// One live connection registered with the hub.
pub struct Subscriber<T: Transport> {
    id: SubscriberId,
    hub: Hub,
    transport: Mutex<T>,
    closed: AtomicBool,
    failed: Notify,
}

impl<T: Transport> Subscriber<T> {
    /// Wrap an established connection and register it.
    ///
    /// The returned subscriber is already a hub member.
    pub async fn connect(hub: &Hub, transport: T) -> Arc<Self> {
        let subscriber = Arc::new(Self {
            id: SubscriberId::new(),
            hub: hub.clone(),
            transport: Mutex::new(transport),
            closed: AtomicBool::new(false),
            failed: Notify::new(),
        });

        hub.register(subscriber.clone()).await;
        debug!(subscriber = %subscriber.id, "Subscriber connected");

        subscriber
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Serialize and write one event to this connection.
    pub async fn deliver(&self, event: &DomainEvent) -> Result<(), DeliveryError> {
        let frame = event.to_frame()?;

        let mut transport = self.transport.lock().await;
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }

        let result = transport.send(frame).await;
        if result.is_err() {
            self.failed.notify_one();
        }
        result
    }

    /// Resolves once a write to the transport has failed. The owner should
    /// then close the subscriber.
    pub async fn transport_failed(&self) {
        self.failed.notified().await
    }

    /// Unregister from the hub, then release the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.hub.unregister(self.id).await;
        self.transport.lock().await.close().await;
        debug!(subscriber = %self.id, "Subscriber closed");
    }

    /// Guard that closes the subscriber when dropped, for owners that cannot
    /// await on teardown (e.g. a response stream).
    pub fn close_on_drop(self: &Arc<Self>) -> CloseGuard<T> {
        CloseGuard {
            subscriber: Some(Arc::clone(self)),
        }
    }
}

#[async_trait]
impl<T: Transport> Notifier for Subscriber<T> {
    fn id(&self) -> SubscriberId {
        self.id
    }

    async fn notify(&self, event: &DomainEvent) -> Result<(), DeliveryError> {
        self.deliver(event).await
    }
}

/// Closes its subscriber on drop unless it was already closed.
pub struct CloseGuard<T: Transport> {
    subscriber: Option<Arc<Subscriber<T>>>,
}

impl<T: Transport> Drop for CloseGuard<T> {
    fn drop(&mut self) {
        let Some(subscriber) = self.subscriber.take() else {
            return;
        };
        if subscriber.is_closed() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { subscriber.close().await });
            }
            Err(_) => {
                warn!(
                    subscriber = %subscriber.id,
                    "No runtime available, subscriber left registered"
                );
            }
        }
    }
}
