use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kube_gateway_core::{
    watch::{HandleNotification, Notification, Subscribe, SubscriptionId},
    Error, ResourceDescriptor, Result,
};
use kube_gateway_k8s_api::{self as k8s, watcher, Api, DynamicObject, Event, ResourceExt, Watch};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument};


/// Identifies a watched kind by group, version, and plural resource name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KindKey {
    pub group: String,
    pub version: String,
    pub resource: String,
}

type SharedInformer = Arc<RwLock<Informer>>;
type ObjectKey = (Option<String>, String);

/// Holds one shared informer per watched kind.
///
/// Informers are started lazily, on the first subscription to their kind, and
/// are kept running for the life of the process so that later subscriptions
/// are served from the cached state.
pub struct Informers {
    client: k8s::Client,
    registry: Mutex<Registry>,
}

/// Tracks the informers of each kind and the subscriptions registered with
/// them.
#[derive(Default)]
struct Registry {
    kinds: HashMap<KindKey, SharedInformer>,
    registrations: HashMap<SubscriptionId, KindKey>,
    next_id: u64,
}

/// The cached state of a single kind, along with the handlers that observe
/// it.
#[derive(Default)]
pub struct Informer {
    objects: HashMap<ObjectKey, DynamicObject>,
    handlers: HashMap<SubscriptionId, Arc<dyn HandleNotification>>,

    /// Set once the first full listing has been observed. Objects seen before
    /// then are reported as part of the initial state.
    synced: bool,

    /// The keys observed during an in-progress (re)listing.
    relisting: Option<HashSet<ObjectKey>>,
}

// === impl KindKey ===

impl KindKey {
    pub fn for_resource(resource: &ResourceDescriptor) -> Self {
        Self {
            group: resource.group.clone(),
            version: resource.version.clone(),
            resource: resource.resource.clone(),
        }
    }
}

impl std::fmt::Display for KindKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

// === impl Informers ===

impl Informers {
    pub fn new(client: k8s::Client) -> Self {
        Self {
            client,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Returns the informer for `resource`'s kind, starting it if necessary.
    fn informer(&self, resource: &ResourceDescriptor) -> (KindKey, SharedInformer) {
        let key = KindKey::for_resource(resource);
        let mut registry = self.registry.lock();
        if let Some(informer) = registry.kinds.get(&key) {
            return (key, informer.clone());
        }

        let informer = SharedInformer::default();
        let api = Api::<DynamicObject>::all_with(self.client.clone(), &resource.api_resource());
        let span = info_span!("informer", kind = %key);
        let watch = Watch::from(watcher(api, watcher::Config::default())).instrument(span.clone());
        tokio::spawn(run(informer.clone(), watch).instrument(span));
        info!(kind = %key, "Started informer");

        registry.kinds.insert(key.clone(), informer.clone());
        (key, informer)
    }
}

#[async_trait::async_trait]
impl Subscribe for Informers {
    async fn subscribe(
        &self,
        resource: &ResourceDescriptor,
        handler: Arc<dyn HandleNotification>,
    ) -> Result<SubscriptionId> {
        let (key, informer) = self.informer(resource);
        let id = self.registry.lock().register(key);
        informer.write().register(id, handler);
        Ok(id)
    }

    async fn deregister(&self, id: SubscriptionId) -> Result<()> {
        let informer = self.registry.lock().deregister(id)?;
        informer.write().deregister(id);
        Ok(())
    }
}

async fn run(informer: SharedInformer, mut watch: Watch<DynamicObject>) {
    while let Some(event) = watch.recv().await {
        informer.write().process(event);
    }
    info!("Watch ended");
}

// === impl Registry ===

impl Registry {
    fn register(&mut self, key: KindKey) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.registrations.insert(id, key);
        id
    }

    fn deregister(&mut self, id: SubscriptionId) -> Result<SharedInformer> {
        let key = self
            .registrations
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("subscription {}", id.0)))?;
        self.kinds
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("informer {key}")))
    }
}

// === impl Informer ===

impl Informer {
    /// Registers a handler, replaying every cached object to it as part of
    /// the initial state.
    pub fn register(&mut self, id: SubscriptionId, handler: Arc<dyn HandleNotification>) {
        for object in self.objects.values() {
            handler.handle(&Notification::Add {
                object: object.clone(),
                initial: true,
            });
        }
        self.handlers.insert(id, handler);
        debug!(id = id.0, handlers = self.handlers.len(), "Registered");
    }

    pub fn deregister(&mut self, id: SubscriptionId) -> bool {
        let removed = self.handlers.remove(&id).is_some();
        debug!(id = id.0, handlers = self.handlers.len(), "Deregistered");
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Applies a watch event to the cached state and notifies every handler
    /// of the resulting changes.
    pub fn process(&mut self, event: Event<DynamicObject>) {
        for notification in self.apply(event) {
            for handler in self.handlers.values() {
                handler.handle(&notification);
            }
        }
    }

    fn apply(&mut self, event: Event<DynamicObject>) -> Vec<Notification> {
        match event {
            Event::Init => {
                self.relisting = Some(HashSet::new());
                Vec::new()
            }

            Event::InitApply(object) => {
                let key = object_key(&object);
                if let Some(relisting) = self.relisting.as_mut() {
                    relisting.insert(key.clone());
                }
                let initial = !self.synced;
                vec![self.upsert(key, object, initial)]
            }

            Event::InitDone => {
                self.synced = true;
                let Some(seen) = self.relisting.take() else {
                    return Vec::new();
                };
                let stale = self
                    .objects
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect::<Vec<_>>();
                stale
                    .into_iter()
                    .filter_map(|k| self.objects.remove(&k))
                    .map(|object| Notification::Delete { object })
                    .collect()
            }

            Event::Apply(object) => {
                let key = object_key(&object);
                vec![self.upsert(key, object, false)]
            }

            Event::Delete(object) => {
                let key = object_key(&object);
                let object = self.objects.remove(&key).unwrap_or(object);
                vec![Notification::Delete { object }]
            }
        }
    }

    fn upsert(&mut self, key: ObjectKey, object: DynamicObject, initial: bool) -> Notification {
        match self.objects.insert(key, object.clone()) {
            Some(old) => Notification::Update { old, new: object },
            None => Notification::Add { object, initial },
        }
    }
}

fn object_key(object: &DynamicObject) -> ObjectKey {
    (object.namespace(), object.name_any())
}
