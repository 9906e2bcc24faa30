//! Resource host: serves discovery, observe, get and set for locally defined
//! resources, and pushes a notification to every observer on each change.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use oic_core::discovery::DiscoveryQuery;
use oic_core::protocol::PROTOCOL_VERSION;
use oic_core::{
    AttributeMap, AttributeStore, AttributeValue, Endpoint, Error, Message, PresenceStatus,
    ResourceRecord, ResponseCode, Result,
};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{MuxEvent, MuxEvents, TransportMultiplexer};

/// What to host: identity, discovery metadata and initial attributes.
#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    pub uri: String,
    pub types: Vec<String>,
    pub interfaces: Vec<String>,
    pub observable: bool,
    pub attributes: AttributeStore,
}

impl ResourceDefinition {
    pub fn new(uri: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            types: vec![resource_type.into()],
            interfaces: Vec::new(),
            observable: true,
            attributes: AttributeStore::new(),
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn observable(mut self, observable: bool) -> Self {
        self.observable = observable;
        self
    }

    pub fn with_attributes(mut self, attributes: AttributeStore) -> Self {
        self.attributes = attributes;
        self
    }
}

struct Observer {
    endpoint: Endpoint,
    token: u64,
    next_nonce: u64,
}

/// A resource being served. Shared with automation jobs.
pub struct HostedResource {
    record: ResourceRecord,
    store: Mutex<AttributeStore>,
    observers: Mutex<Vec<Observer>>,
    alive: AtomicBool,
    mux: Arc<TransportMultiplexer>,
}

impl HostedResource {
    pub fn uri(&self) -> &str {
        &self.record.uri
    }

    pub fn record(&self) -> &ResourceRecord {
        &self.record
    }

    /// False once removed from its host.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn attributes(&self) -> AttributeMap {
        self.store.lock().snapshot()
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.store.lock().get(name).cloned()
    }

    /// Read access to the declarations (constraints included).
    pub fn with_store<R>(&self, f: impl FnOnce(&AttributeStore) -> R) -> R {
        f(&self.store.lock())
    }

    /// Local update path. Observers are notified when the value actually changed.
    pub fn update_local_attribute(
        &self,
        name: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<bool> {
        let mut store = self.store.lock();
        let changed = store.set(name, value.into())?;
        if changed {
            self.notify(&store, PresenceStatus::Ok);
        }
        Ok(changed)
    }

    /// All-or-nothing update, as applied for a remote set.
    pub fn set_attributes(&self, values: &AttributeMap) -> Result<AttributeMap> {
        let mut store = self.store.lock();
        let accepted = store.set_all(values)?;
        if !accepted.is_empty() {
            self.notify(&store, PresenceStatus::Ok);
        }
        Ok(accepted)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    fn add_observer(&self, endpoint: Endpoint, token: u64) {
        let mut observers = self.observers.lock();
        observers.retain(|o| !(o.endpoint == endpoint && o.token == token));
        observers.push(Observer {
            endpoint,
            token,
            next_nonce: 1,
        });
    }

    fn remove_observer(&self, endpoint: &Endpoint, token: u64) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|o| !(o.endpoint == *endpoint && o.token == token));
        observers.len() != before
    }

    /// Called with the store still locked, so nonce order matches the order
    /// in which updates were applied.
    fn notify(&self, store: &AttributeStore, status: PresenceStatus) {
        let attributes = store.snapshot();
        let mut observers = self.observers.lock();
        for observer in observers.iter_mut() {
            let nonce = observer.next_nonce;
            observer.next_nonce += 1;
            let msg = Message::Notify {
                token: observer.token,
                uri: self.record.uri.clone(),
                nonce,
                status,
                attributes: attributes.clone(),
            };
            if let Err(e) = self.mux.send(&observer.endpoint, &msg) {
                warn!(uri = %self.record.uri, observer = %observer.endpoint, error = %e, "notify failed");
            }
        }
    }

    fn retire(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let store = self.store.lock();
            self.notify(&store, PresenceStatus::Stopped);
            self.observers.lock().clear();
        }
    }
}

struct HostInner {
    device_id: Uuid,
    mux: Arc<TransportMultiplexer>,
    resources: RwLock<BTreeMap<String, Arc<HostedResource>>>,
}

impl HostInner {
    fn resource(&self, uri: &str) -> Option<Arc<HostedResource>> {
        self.resources.read().get(uri).cloned()
    }

    fn reply(&self, target: &Endpoint, msg: Message) {
        if let Err(e) = self.mux.send(target, &msg) {
            warn!(kind = msg.kind(), %target, error = %e, "reply failed");
        }
    }

    fn on_event(&self, event: MuxEvent) {
        match event {
            MuxEvent::Frame(frame) => match frame.decode() {
                Ok(msg) => self.on_message(&frame.source, msg),
                Err(e) => warn!(source = %frame.source, error = %e, "dropping frame"),
            },
            MuxEvent::AdapterState {
                connectivity,
                enabled,
            } => {
                self.mux.apply_adapter_state(connectivity, enabled);
            }
        }
    }

    fn on_message(&self, source: &Endpoint, msg: Message) {
        debug!(kind = msg.kind(), %source, "host request");
        match msg {
            Message::DiscoveryRequest {
                protocol_version,
                token,
                query,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(%source, protocol_version, "discovery request with unsupported version");
                    return;
                }
                let query = match DiscoveryQuery::parse(&query) {
                    Ok(q) => q,
                    Err(e) => {
                        debug!(%source, error = %e, "ignoring discovery request");
                        return;
                    }
                };
                let resources: Vec<ResourceRecord> = self
                    .resources
                    .read()
                    .values()
                    .map(|r| r.record.clone())
                    .filter(|r| query.matches(r))
                    .collect();
                if resources.is_empty() {
                    return;
                }
                self.reply(
                    source,
                    Message::DiscoveryResponse {
                        protocol_version: PROTOCOL_VERSION,
                        token,
                        device_id: self.device_id,
                        resources,
                    },
                );
            }
            Message::Observe { token, uri } => {
                let accepted = match self.resource(&uri) {
                    Some(r) if r.record.observable => {
                        r.add_observer(source.clone(), token);
                        true
                    }
                    _ => false,
                };
                self.reply(
                    source,
                    Message::ObserveAck {
                        token,
                        uri,
                        accepted,
                    },
                );
            }
            Message::CancelObserve { token, uri } => {
                if let Some(r) = self.resource(&uri) {
                    r.remove_observer(source, token);
                }
            }
            Message::GetAttributes { token, uri } => {
                let result = self
                    .resource(&uri)
                    .map(|r| r.attributes())
                    .ok_or(ResponseCode::ResourceNotFound(uri));
                self.reply(source, Message::GetResponse { token, result });
            }
            Message::SetAttributes {
                token,
                uri,
                attributes,
            } => {
                let result = match self.resource(&uri) {
                    Some(r) => r.set_attributes(&attributes).map_err(ResponseCode::from),
                    None => Err(ResponseCode::ResourceNotFound(uri)),
                };
                self.reply(source, Message::SetResponse { token, result });
            }
            other => debug!(kind = other.kind(), %source, "ignored"),
        }
    }
}

/// Serves hosted resources over one multiplexer.
pub struct ResourceHost {
    inner: Arc<HostInner>,
    router: JoinHandle<()>,
}

impl ResourceHost {
    /// Start the host router. Must be called from within a tokio runtime.
    pub fn start(mux: Arc<TransportMultiplexer>, mut events: MuxEvents) -> Self {
        let inner = Arc::new(HostInner {
            device_id: Uuid::new_v4(),
            mux,
            resources: RwLock::new(BTreeMap::new()),
        });
        let router = {
            let inner = inner.clone();
            Handle::current().spawn(async move {
                while let Some(event) = events.recv().await {
                    inner.on_event(event);
                }
                debug!("host router stopped");
            })
        };
        info!(device_id = %inner.device_id, "resource host started");
        Self { inner, router }
    }

    pub fn device_id(&self) -> Uuid {
        self.inner.device_id
    }

    /// Start serving a resource. A resource already at the same URI is replaced.
    pub fn add_resource(&self, definition: ResourceDefinition) -> Result<Arc<HostedResource>> {
        if !definition.uri.starts_with('/') {
            return Err(Error::InvalidResource(format!(
                "uri {:?} is not absolute",
                definition.uri
            )));
        }
        if definition.types.is_empty() {
            return Err(Error::InvalidResource(format!(
                "{} has no resource type",
                definition.uri
            )));
        }
        let resource = Arc::new(HostedResource {
            record: ResourceRecord {
                uri: definition.uri.clone(),
                types: definition.types,
                interfaces: definition.interfaces,
                observable: definition.observable,
            },
            store: Mutex::new(definition.attributes),
            observers: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            mux: self.inner.mux.clone(),
        });
        let previous = self
            .inner
            .resources
            .write()
            .insert(definition.uri.clone(), resource.clone());
        if let Some(old) = previous {
            old.retire();
        }
        info!(uri = %definition.uri, "resource added");
        Ok(resource)
    }

    /// Stop serving a resource. Its observers get a Stopped notification.
    pub fn remove_resource(&self, uri: &str) -> Option<Arc<HostedResource>> {
        let removed = self.inner.resources.write().remove(uri);
        if let Some(r) = &removed {
            r.retire();
            info!(uri, "resource removed");
        }
        removed
    }

    pub fn resource(&self, uri: &str) -> Option<Arc<HostedResource>> {
        self.inner.resource(uri)
    }

    pub fn resources(&self) -> Vec<Arc<HostedResource>> {
        self.inner.resources.read().values().cloned().collect()
    }

    /// Retire every resource and stop the router.
    pub fn shutdown(&self) {
        let resources: Vec<_> = std::mem::take(&mut *self.inner.resources.write())
            .into_values()
            .collect();
        for r in resources {
            r.retire();
        }
        self.router.abort();
        info!("resource host stopped");
    }
}

impl Drop for ResourceHost {
    fn drop(&mut self) {
        self.router.abort();
    }
}
