use crate::{ResourceDescriptor, Result};
use kube_gateway_k8s_api::{DynamicObject, ResourceExt};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::Notify,
    time::{self, Duration},
};
use tracing::trace;


/// A change notification for a watched kind.
#[derive(Clone, Debug)]
pub enum Notification {
    Add {
        object: DynamicObject,

        /// Set when the object is replayed as part of the initial state rather
        /// than newly created.
        initial: bool,
    },
    Update {
        old: DynamicObject,
        new: DynamicObject,
    },
    Delete {
        object: DynamicObject,
    },
}

/// Receives notifications from a subscription source.
///
/// Handlers are invoked inline by the source and must never block.
pub trait HandleNotification: Send + Sync + 'static {
    fn handle(&self, notification: &Notification);
}

/// Identifies a registered handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Models the cluster's change-notification source.
#[async_trait::async_trait]
pub trait Subscribe: Send + Sync {
    /// Registers `handler` for notifications about the descriptor's kind.
    async fn subscribe(
        &self,
        resource: &ResourceDescriptor,
        handler: Arc<dyn HandleNotification>,
    ) -> Result<SubscriptionId>;

    async fn deregister(&self, id: SubscriptionId) -> Result<()>;
}

/// A single-slot wake-up flag.
///
/// Any number of posts before the next `take` collapse into one wake. Posting
/// never blocks.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: AtomicBool,
    notify: Notify,
}

/// Restricts notifications to a namespace and/or a name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// Translates notifications into wake-ups for a single watch stream.
#[derive(Debug)]
pub struct SubscriptionHandler {
    filter: Filter,
    wake: Arc<WakeSignal>,
    first_delivery_pending: AtomicBool,
}

/// Bounds the retries of a failed deregistration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeregisterBackoff {
    pub min: Duration,
    pub max: Duration,
    pub max_attempts: usize,
}

// === impl WakeSignal ===

impl WakeSignal {
    pub fn post(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Consumes a pending wake, if any.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits until a wake is posted or `idle` elapses.
    pub async fn wait(&self, idle: Duration) {
        if self.is_pending() {
            return;
        }
        let _ = time::timeout(idle, self.notify.notified()).await;
    }
}

// === impl Filter ===

impl Filter {
    pub fn for_resource(resource: &ResourceDescriptor) -> Self {
        Self {
            namespace: resource.namespace.clone(),
            name: resource.name.clone(),
        }
    }

    pub fn matches(&self, object: &DynamicObject) -> bool {
        if let Some(name) = self.name.as_deref() {
            if object.metadata.name.as_deref() != Some(name) {
                return false;
            }
        }
        if let Some(ns) = self.namespace.as_deref() {
            if object.metadata.namespace.as_deref() != Some(ns) {
                return false;
            }
        }
        true
    }
}

// === impl SubscriptionHandler ===

impl SubscriptionHandler {
    pub fn new(filter: Filter, wake: Arc<WakeSignal>) -> Self {
        Self {
            filter,
            wake,
            first_delivery_pending: AtomicBool::new(true),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.first_delivery_pending.load(Ordering::Acquire)
    }
}

impl HandleNotification for SubscriptionHandler {
    fn handle(&self, notification: &Notification) {
        match notification {
            Notification::Add { object, initial } => {
                if !self.filter.matches(object) {
                    return;
                }
                // The first add always produces a snapshot, even when it is
                // only a replay of existing state.
                let first = self.first_delivery_pending.swap(false, Ordering::AcqRel);
                if first || !*initial {
                    trace!(name = %object.name_any(), first, initial, "Added");
                    self.wake.post();
                }
            }
            Notification::Update { old, new } => {
                if !self.filter.matches(old) {
                    return;
                }
                if old.resource_version() != new.resource_version() {
                    trace!(name = %new.name_any(), "Updated");
                    self.first_delivery_pending.store(false, Ordering::Release);
                    self.wake.post();
                }
            }
            Notification::Delete { object } => {
                if !self.filter.matches(object) {
                    return;
                }
                trace!(name = %object.name_any(), "Deleted");
                self.first_delivery_pending.store(false, Ordering::Release);
                self.wake.post();
            }
        }
    }
}

// === impl DeregisterBackoff ===

impl Default for DeregisterBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(5),
            max_attempts: 8,
        }
    }
}

impl DeregisterBackoff {
    /// The delays to wait after each failed attempt but the last.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max = self.max;
        std::iter::successors(Some(self.min.min(max)), move |d| Some((*d * 2).min(max)))
            .take(self.max_attempts.saturating_sub(1))
    }
}
