use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{pin_mut, StreamExt};
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Event};
use kube::Resource;
use serde::de::DeserializeOwned;
use stopper::Stopper;
use tokio::sync::watch;

use crate::clock::Clock;

/// Typed informer callbacks. Handlers run on the watch task; keep them cheap
/// (enqueue and return).
pub struct EventHandlers<K> {
    pub on_add: Option<Box<dyn Fn(Arc<K>) + Send + Sync>>,
    pub on_update: Option<Box<dyn Fn(Arc<K>, Arc<K>) + Send + Sync>>,
    pub on_delete: Option<Box<dyn Fn(Arc<K>) + Send + Sync>>,
    /// Invoked for every cached object on each resync tick.
    pub on_resync: Option<Box<dyn Fn(Arc<K>) + Send + Sync>>,
}

impl<K> Default for EventHandlers<K> {
    fn default() -> Self {
        Self {
            on_add: None,
            on_update: None,
            on_delete: None,
            on_resync: None,
        }
    }
}

/// Cache-backed informer over a single watched resource type. Wraps a
/// reflector store (the lister) and turns raw watch events into typed
/// add/update/delete callbacks; relists surface as adds, updates and deletes
/// against the last seen objects, so handlers never observe untyped
/// tombstones.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    api: Api<K>,
    reader: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    resync: Duration,
    ready_tx: Arc<watch::Sender<bool>>,
    ready_rx: watch::Receiver<bool>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>, resync: Duration) -> Self {
        let (reader, writer) = reflector::store();
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            api,
            reader,
            writer: Mutex::new(Some(writer)),
            resync,
            ready_tx: Arc::new(ready_tx),
            ready_rx,
        }
    }

    /// Cache-backed lister.
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Spawns the watch and resync loops. Both stop once the interrupt fires.
    pub fn run(&self, handlers: EventHandlers<K>, clock: Arc<dyn Clock>, interrupt: &Stopper) {
        let Some(writer) = self.writer.lock().unwrap().take() else {
            tracing::warn!("informer already running");
            return;
        };
        let handlers = Arc::new(handlers);

        let api = self.api.clone();
        let ready_tx = self.ready_tx.clone();
        let watch_handlers = handlers.clone();
        let watch_interrupt = interrupt.clone();
        tokio::spawn(async move {
            let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()));
            let stream = watch_interrupt.stop_stream(Box::pin(stream));
            pin_mut!(stream);

            let mut last_seen: HashMap<String, Arc<K>> = HashMap::new();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(Event::Applied(object)) => {
                        dispatch_apply(&watch_handlers, &mut last_seen, Arc::new(object));
                    }
                    Ok(Event::Deleted(object)) => {
                        let object = Arc::new(object);
                        if let Some(name) = object.meta().name.clone() {
                            last_seen.remove(&name);
                        }
                        if let Some(on_delete) = &watch_handlers.on_delete {
                            on_delete(object);
                        }
                    }
                    Ok(Event::Restarted(objects)) => {
                        dispatch_restart(&watch_handlers, &mut last_seen, objects);
                        let _ = ready_tx.send(true);
                    }
                    Err(error) => tracing::warn!(%error, "watch stream error"),
                }
            }
            tracing::debug!("informer watch loop stopped");
        });

        let reader = self.reader.clone();
        let resync = self.resync;
        let resync_interrupt = interrupt.clone();
        tokio::spawn(async move {
            while resync_interrupt.stop_future(clock.sleep(resync)).await.is_some() {
                if let Some(on_resync) = &handlers.on_resync {
                    for object in reader.state() {
                        on_resync(object);
                    }
                }
            }
        });
    }

    /// Resolves true once the initial list has populated the cache; false when
    /// the interrupt fires first.
    pub async fn wait_for_cache_sync(&self, interrupt: &Stopper) -> bool {
        let mut ready = self.ready_rx.clone();
        let synced = async move {
            loop {
                if *ready.borrow() {
                    return;
                }
                if ready.changed().await.is_err() {
                    return;
                }
            }
        };
        interrupt.stop_future(synced).await.is_some()
    }
}

fn dispatch_apply<K>(
    handlers: &EventHandlers<K>,
    last_seen: &mut HashMap<String, Arc<K>>,
    object: Arc<K>,
) where
    K: Resource<DynamicType = ()>,
{
    let Some(name) = object.meta().name.clone() else {
        return;
    };
    match last_seen.insert(name, object.clone()) {
        None => {
            if let Some(on_add) = &handlers.on_add {
                on_add(object);
            }
        }
        Some(old) => {
            // skip same versions here
            if old.meta().resource_version == object.meta().resource_version {
                return;
            }
            if let Some(on_update) = &handlers.on_update {
                on_update(old, object);
            }
        }
    }
}

fn dispatch_restart<K>(
    handlers: &EventHandlers<K>,
    last_seen: &mut HashMap<String, Arc<K>>,
    objects: Vec<K>,
) where
    K: Resource<DynamicType = ()>,
{
    let mut next_seen = HashMap::with_capacity(objects.len());
    for object in objects {
        let object = Arc::new(object);
        let Some(name) = object.meta().name.clone() else {
            continue;
        };
        next_seen.insert(name.clone(), object.clone());
        match last_seen.get(&name) {
            None => {
                if let Some(on_add) = &handlers.on_add {
                    on_add(object);
                }
            }
            Some(old) if old.meta().resource_version != object.meta().resource_version => {
                if let Some(on_update) = &handlers.on_update {
                    on_update(old.clone(), object);
                }
            }
            Some(_) => {}
        }
    }

    // objects that vanished while the watch was down
    for (name, old) in last_seen.iter() {
        if !next_seen.contains_key(name) {
            if let Some(on_delete) = &handlers.on_delete {
                on_delete(old.clone());
            }
        }
    }
    *last_seen = next_seen;
}
