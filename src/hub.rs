//! In-process broadcast hub for run change notifications.
//!
//! ```text
//! publish(event)                     dispatch loop
//!   handler 1 ──┐                        │
//!   handler 2 ──┼──► [ingress queue] ────┤ snapshot members under read lock
//!   handler N ──┘     (unbounded)        │
//!                                        ├──► [member queue] ──► worker ──► notifier.notify()
//!                                        ├──► [member queue] ──► worker ──► notifier.notify()
//!                                        └──► [member queue] ──► worker ──► notifier.notify()
//! ```
//!
//! - Publishing never waits on a subscriber.
//! - Each member has its own worker, so a slow or broken connection only
//!   stalls its own queue. Delivery per member is FIFO; there is no ordering
//!   across members.
//! - The hub never evicts a failing member. The owning connection notices the
//!   broken transport and unregisters itself.
//! - Once `unregister` returns, no further delivery starts for that member.
//! - Published events and failed deliveries are counted for `/metrics`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, PublishError};
use crate::events::DomainEvent;

/// Identity of one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something the hub can deliver events to.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn id(&self) -> SubscriberId;

    async fn notify(&self, event: &DomainEvent) -> Result<(), DeliveryError>;
}

/// Hub bookkeeping for one registered notifier.
struct Member {
    queue: mpsc::UnboundedSender<Arc<DomainEvent>>,
    /// Held by the worker around each delivery; `false` once unregistered.
    open: Arc<Mutex<bool>>,
}

type Members = Arc<RwLock<HashMap<SubscriberId, Member>>>;

/// Counters shared by every hub clone and member worker.
#[derive(Debug, Default)]
struct HubCounters {
    events_published: AtomicU64,
    deliveries_failed: AtomicU64,
}

/// Point-in-time view of hub activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub events_published: u64,
    pub deliveries_failed: u64,
}

/// Central broadcast point. Cheap to clone; all clones share one membership
/// set and one ingress queue.
#[derive(Clone)]
pub struct Hub {
    members: Members,
    ingress: mpsc::UnboundedSender<DomainEvent>,
    counters: Arc<HubCounters>,
}

impl Hub {
    /// Create the hub and spawn its dispatch loop.
    ///
    /// The loop ends once every clone of the hub has been dropped and the
    /// queue is drained; the returned handle resolves at that point.
    pub fn start() -> (Self, JoinHandle<()>) {
        let (ingress, rx) = mpsc::unbounded_channel();
        let members: Members = Arc::new(RwLock::new(HashMap::new()));
        let handle = tokio::spawn(dispatch(members.clone(), rx));

        let hub = Self {
            members,
            ingress,
            counters: Arc::new(HubCounters::default()),
        };
        (hub, handle)
    }

    /// Add a notifier to the membership set. Registering an id that is
    /// already present is a no-op.
    pub async fn register(&self, notifier: Arc<dyn Notifier>) {
        let id = notifier.id();
        let mut members = self.members.write().await;
        if members.contains_key(&id) {
            debug!(subscriber = %id, "Subscriber already registered");
            return;
        }

        let (queue, rx) = mpsc::unbounded_channel();
        let open = Arc::new(Mutex::new(true));
        tokio::spawn(deliver(notifier, rx, open.clone(), self.counters.clone()));

        members.insert(id, Member { queue, open });
        debug!(subscriber = %id, total = members.len(), "Subscriber registered");
    }

    /// Remove a notifier from the membership set; no-op if absent.
    ///
    /// Waits for an in-flight delivery to this notifier, never for others.
    pub async fn unregister(&self, id: SubscriberId) {
        let removed = self.members.write().await.remove(&id);
        let Some(member) = removed else {
            return;
        };

        drop(member.queue);
        *member.open.lock().await = false;
        debug!(subscriber = %id, "Subscriber unregistered");
    }

    /// Queue an event for delivery to every current subscriber.
    pub fn publish(&self, event: DomainEvent) -> Result<(), PublishError> {
        self.ingress
            .send(event)
            .map_err(|_| PublishError::QueueClosed)?;
        self.counters.events_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn subscriber_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.subscriber_count().await,
            events_published: self.counters.events_published.load(Ordering::Relaxed),
            deliveries_failed: self.counters.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}

/// Dispatch loop: hands each event to every member's queue.
async fn dispatch(members: Members, mut rx: mpsc::UnboundedReceiver<DomainEvent>) {
    while let Some(event) = rx.recv().await {
        let event = Arc::new(event);
        let members = members.read().await;
        debug!(
            event = %event.kind,
            subscribers = members.len(),
            "Dispatching event"
        );

        for member in members.values() {
            // Fails only if the worker died; the member is still unregistered
            // by its connection.
            let _ = member.queue.send(Arc::clone(&event));
        }
    }

    debug!("Dispatch loop stopped");
}

/// Per-member worker: delivers queued events one at a time.
async fn deliver(
    notifier: Arc<dyn Notifier>,
    mut rx: mpsc::UnboundedReceiver<Arc<DomainEvent>>,
    open: Arc<Mutex<bool>>,
    counters: Arc<HubCounters>,
) {
    let id = notifier.id();

    while let Some(event) = rx.recv().await {
        let gate = open.lock().await;
        if !*gate {
            break;
        }

        if let Err(e) = notifier.notify(&event).await {
            counters.deliveries_failed.fetch_add(1, Ordering::Relaxed);
            warn!(subscriber = %id, event = %event.kind, "Delivery failed: {}", e);
        }
    }
}
