//! Resource client: discovery, monitoring, caching and remote get/set over a
//! transport multiplexer. Callbacks run on the client's dispatcher task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use oic_core::{
    AttributeMap, AttributeValue, ConnectivityType, Error, Message, ObservationCore,
    ObserverAction, ResourceDescriptor, ResourceKey, ResourceState, Result,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryEngine, DiscoveryHandle};
use crate::transport::{MuxEvent, MuxEvents, ReplyReceiver, TransportMultiplexer};

/// Timing knobs of a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub discovery_timeout: Duration,
    /// Time a subscribe may stay unanswered before the resource reports Timeout.
    pub subscribe_timeout: Duration,
    pub request_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(500),
        }
    }
}

impl ClientConfig {
    fn subscribe_timeout_ticks(&self) -> u64 {
        let tick = self.tick_interval.as_millis().max(1);
        let ticks = (self.subscribe_timeout.as_millis() + tick - 1) / tick;
        ticks.max(1) as u64
    }
}

type StateCallback = Arc<dyn Fn(ResourceState) + Send + Sync>;
type CacheCallback = Arc<dyn Fn(AttributeMap) + Send + Sync>;
type CompletionCallback = Box<dyn FnOnce(Result<AttributeMap>) + Send>;

enum Delivery {
    State(ResourceKey, ResourceState),
    Cache(ResourceKey, AttributeMap),
    Complete(CompletionCallback, Result<AttributeMap>),
}

struct ClientInner {
    config: ClientConfig,
    mux: Arc<TransportMultiplexer>,
    discovery: DiscoveryEngine,
    core: Mutex<ObservationCore>,
    state_callbacks: Mutex<HashMap<ResourceKey, StateCallback>>,
    cache_callbacks: Mutex<HashMap<ResourceKey, CacheCallback>>,
    /// Remote sets awaiting a response, by token.
    pending_sets: Mutex<HashMap<u64, ResourceKey>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl ClientInner {
    fn apply(&self, actions: Vec<ObserverAction>) {
        for action in actions {
            match action {
                ObserverAction::Send(target, msg) => {
                    if let Err(e) = self.mux.send(&target, &msg) {
                        warn!(kind = msg.kind(), %target, error = %e, "send failed");
                    }
                }
                ObserverAction::StateChanged(key, state) => {
                    let _ = self.deliveries.send(Delivery::State(key, state));
                }
                ObserverAction::CacheUpdated(key, snapshot) => {
                    let _ = self.deliveries.send(Delivery::Cache(key, snapshot));
                }
            }
        }
    }

    fn on_event(&self, event: MuxEvent) {
        match event {
            MuxEvent::Frame(frame) => {
                let msg = match frame.decode() {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(source = %frame.source, error = %e, "dropping frame");
                        return;
                    }
                };
                // Merge an accepted set in wire order, before later notifications.
                if let Message::SetResponse {
                    token,
                    result: Ok(accepted),
                } = &msg
                {
                    let key = self.pending_sets.lock().remove(token);
                    if let Some(key) = key {
                        self.core.lock().on_set_acknowledged(&key, accepted);
                    }
                }
                let Some(msg) = self.mux.complete(msg) else {
                    return;
                };
                let Some(msg) = self.discovery.route(&frame.source, msg) else {
                    return;
                };
                match msg {
                    Message::ObserveAck { .. } | Message::Notify { .. } => {
                        let actions = self.core.lock().on_message(&frame.source, &msg);
                        self.apply(actions);
                    }
                    other => debug!(kind = other.kind(), source = %frame.source, "ignored"),
                }
            }
            MuxEvent::AdapterState {
                connectivity,
                enabled,
            } => {
                if self.mux.apply_adapter_state(connectivity, enabled) && !enabled {
                    let actions = self.core.lock().on_transport_down(connectivity);
                    self.apply(actions);
                }
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::State(key, state) => {
                let callback = self.state_callbacks.lock().get(&key).cloned();
                if let Some(cb) = callback {
                    cb(state);
                }
            }
            Delivery::Cache(key, snapshot) => {
                let callback = self.cache_callbacks.lock().get(&key).cloned();
                if let Some(cb) = callback {
                    cb(snapshot);
                }
            }
            Delivery::Complete(cb, result) => cb(result),
        }
    }

    fn ensure_available(&self, connectivity: ConnectivityType) -> Result<()> {
        if self.mux.is_available(connectivity) {
            Ok(())
        } else {
            Err(Error::TransportUnavailable(connectivity))
        }
    }
}

/// Handle to a running client. Dropping it stops its tasks.
pub struct ResourceClient {
    inner: Arc<ClientInner>,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceClient {
    /// Start the router, ticker and dispatcher tasks. Must be called from within a tokio runtime.
    pub fn start(config: ClientConfig, mux: Arc<TransportMultiplexer>, mut events: MuxEvents) -> Self {
        let runtime = Handle::current();
        let (deliveries, mut delivery_rx) = mpsc::unbounded_channel();
        let mut core = ObservationCore::new();
        core.set_subscribe_timeout(config.subscribe_timeout_ticks());
        let inner = Arc::new(ClientInner {
            discovery: DiscoveryEngine::new(runtime.clone()),
            config,
            mux,
            core: Mutex::new(core),
            state_callbacks: Mutex::new(HashMap::new()),
            cache_callbacks: Mutex::new(HashMap::new()),
            pending_sets: Mutex::new(HashMap::new()),
            deliveries,
        });

        let router = {
            let inner = inner.clone();
            runtime.spawn(async move {
                while let Some(event) = events.recv().await {
                    inner.on_event(event);
                }
                debug!("client router stopped");
            })
        };
        let ticker = {
            let inner = inner.clone();
            let period = inner.config.tick_interval;
            runtime.spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let actions = inner.core.lock().tick();
                    inner.apply(actions);
                }
            })
        };
        let dispatcher = {
            let inner = inner.clone();
            runtime.spawn(async move {
                while let Some(delivery) = delivery_rx.recv().await {
                    inner.deliver(delivery);
                }
            })
        };
        info!("resource client started");
        Self {
            inner,
            runtime,
            tasks: Mutex::new(vec![router, ticker, dispatcher]),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Discover resources matching `query` with the configured timeout.
    pub fn discover(&self, query: &str, connectivity: ConnectivityType) -> Result<DiscoveryHandle> {
        self.discover_with_timeout(query, connectivity, self.inner.config.discovery_timeout)
    }

    pub fn discover_with_timeout(
        &self,
        query: &str,
        connectivity: ConnectivityType,
        timeout: Duration,
    ) -> Result<DiscoveryHandle> {
        self.inner
            .discovery
            .discover(&self.inner.mux, query, connectivity, timeout)
    }

    /// Subscribe to a resource and report its state changes.
    pub fn start_monitoring<F>(&self, resource: &ResourceDescriptor, on_state_changed: F) -> Result<()>
    where
        F: Fn(ResourceState) + Send + Sync + 'static,
    {
        self.inner.ensure_available(resource.connectivity())?;
        let key = resource.key();
        let token = self.inner.mux.next_token();
        let actions = self.inner.core.lock().start_monitoring(resource, token)?;
        self.inner
            .state_callbacks
            .lock()
            .insert(key, Arc::new(on_state_changed));
        self.inner.apply(actions);
        Ok(())
    }

    /// No-op when not monitoring.
    pub fn stop_monitoring(&self, resource: &ResourceDescriptor) {
        let key = resource.key();
        self.inner.state_callbacks.lock().remove(&key);
        let actions = self.inner.core.lock().stop_monitoring(&key);
        self.inner.apply(actions);
    }

    /// Keep a local copy of the resource's attributes, refreshed by every notification.
    pub fn start_caching<F>(&self, resource: &ResourceDescriptor, on_cache_updated: F) -> Result<()>
    where
        F: Fn(AttributeMap) + Send + Sync + 'static,
    {
        self.inner.ensure_available(resource.connectivity())?;
        let key = resource.key();
        let token = self.inner.mux.next_token();
        let actions = self.inner.core.lock().start_caching(resource, token)?;
        self.inner
            .cache_callbacks
            .lock()
            .insert(key, Arc::new(on_cache_updated));
        self.inner.apply(actions);
        Ok(())
    }

    pub fn stop_caching(&self, resource: &ResourceDescriptor) {
        let key = resource.key();
        self.inner.cache_callbacks.lock().remove(&key);
        let actions = self.inner.core.lock().stop_caching(&key);
        self.inner.apply(actions);
    }

    pub fn cached_attributes(&self, resource: &ResourceDescriptor) -> Result<AttributeMap> {
        self.inner.core.lock().cached_attributes(&resource.key())
    }

    pub fn cached_attribute(
        &self,
        resource: &ResourceDescriptor,
        name: &str,
    ) -> Result<Option<AttributeValue>> {
        self.inner.core.lock().cached_attribute(&resource.key(), name)
    }

    pub fn resource_state(&self, resource: &ResourceDescriptor) -> Option<ResourceState> {
        self.inner.core.lock().state(&resource.key())
    }

    pub fn is_monitoring(&self, resource: &ResourceDescriptor) -> bool {
        self.inner.core.lock().is_monitoring(&resource.key())
    }

    pub fn is_caching(&self, resource: &ResourceDescriptor) -> bool {
        self.inner.core.lock().is_caching(&resource.key())
    }

    pub fn last_error(&self, resource: &ResourceDescriptor) -> Option<Error> {
        self.inner.core.lock().last_error(&resource.key())
    }

    /// Ask the host to apply `attributes` all-or-nothing. Returns immediately;
    /// `on_complete` receives the accepted map or the error exactly once.
    pub fn set_remote_attributes<F>(
        &self,
        resource: &ResourceDescriptor,
        attributes: AttributeMap,
        on_complete: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<AttributeMap>) + Send + 'static,
    {
        let token = self.inner.mux.next_token();
        let request = Message::SetAttributes {
            token,
            uri: resource.uri().to_string(),
            attributes,
        };
        self.request(resource, request, Box::new(on_complete))
    }

    /// One-shot read of the host's current attributes.
    pub fn get_remote_attributes<F>(&self, resource: &ResourceDescriptor, on_complete: F) -> Result<()>
    where
        F: FnOnce(Result<AttributeMap>) + Send + 'static,
    {
        let token = self.inner.mux.next_token();
        let request = Message::GetAttributes {
            token,
            uri: resource.uri().to_string(),
        };
        self.request(resource, request, Box::new(on_complete))
    }

    fn request(
        &self,
        resource: &ResourceDescriptor,
        request: Message,
        on_complete: CompletionCallback,
    ) -> Result<()> {
        self.inner.ensure_available(resource.connectivity())?;
        let token = request.token();
        let key = resource.key();
        let is_set = matches!(request, Message::SetAttributes { .. });
        if is_set {
            self.inner.pending_sets.lock().insert(token, key.clone());
        }
        let reply = match self.inner.mux.request(resource.endpoint(), &request) {
            Ok(reply) => reply,
            Err(e) => {
                self.inner.pending_sets.lock().remove(&token);
                return Err(e);
            }
        };
        let inner = self.inner.clone();
        let connectivity = resource.connectivity();
        self.runtime.spawn(async move {
            let result = await_reply(&inner, token, connectivity, reply).await;
            if is_set {
                inner.pending_sets.lock().remove(&token);
            }
            if let Err(e) = &result {
                debug!(token, resource = %key, error = %e, "request failed");
            }
            let _ = inner.deliveries.send(Delivery::Complete(on_complete, result));
        });
        Ok(())
    }

    /// Release everything held for a resource, cached snapshot included.
    pub fn destroy(&self, resource: &ResourceDescriptor) {
        let key = resource.key();
        self.inner.state_callbacks.lock().remove(&key);
        self.inner.cache_callbacks.lock().remove(&key);
        let actions = self.inner.core.lock().destroy(&key);
        self.inner.apply(actions);
    }

    /// Cancel every subscription and stop the client's tasks.
    pub fn shutdown(&self) {
        let keys = self.inner.core.lock().keys();
        for key in keys {
            self.inner.state_callbacks.lock().remove(&key);
            self.inner.cache_callbacks.lock().remove(&key);
            let actions = self.inner.core.lock().destroy(&key);
            self.inner.apply(actions);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("resource client stopped");
    }
}

impl Drop for ResourceClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn await_reply(
    inner: &ClientInner,
    token: u64,
    connectivity: ConnectivityType,
    reply: ReplyReceiver,
) -> Result<AttributeMap> {
    match tokio::time::timeout(inner.config.request_timeout, reply).await {
        Err(_) => {
            inner.mux.cancel_request(token);
            Err(Error::RequestTimeout)
        }
        Ok(Err(_)) => Err(Error::TransportUnavailable(connectivity)),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Ok(Ok(Message::GetResponse { result, .. })))
        | Ok(Ok(Ok(Message::SetResponse { result, .. }))) => result.map_err(Error::from),
        Ok(Ok(Ok(other))) => Err(Error::MalformedResponse(format!(
            "unexpected {} for request {token}",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_timeout_rounds_up_to_ticks() {
        let config = ClientConfig {
            subscribe_timeout: Duration::from_millis(1001),
            tick_interval: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        assert_eq!(config.subscribe_timeout_ticks(), 3);
        let config = ClientConfig {
            subscribe_timeout: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert_eq!(config.subscribe_timeout_ticks(), 1);
        assert_eq!(ClientConfig::default().subscribe_timeout_ticks(), 20);
    }

    #[tokio::test]
    async fn calls_on_a_down_transport_fail_synchronously() {
        use oic_core::ResourceRecord;
        use uuid::Uuid;

        let (mux, events) = TransportMultiplexer::new();
        let client = ResourceClient::start(ClientConfig::default(), mux, events);
        let light = ResourceDescriptor::from_record(
            ResourceRecord {
                uri: "/a/light".into(),
                types: vec!["core.light".into()],
                interfaces: vec![],
                observable: true,
            },
            &oic_core::Endpoint::ip("coap://10.0.0.5:5683"),
            Uuid::nil(),
        )
        .unwrap();
        let unavailable = Err(Error::TransportUnavailable(ConnectivityType::IP));
        assert_eq!(client.start_monitoring(&light, |_| {}), unavailable);
        assert_eq!(client.start_caching(&light, |_| {}), unavailable);
        assert_eq!(
            client.set_remote_attributes(&light, AttributeMap::new(), |_| {}),
            unavailable
        );
        assert!(matches!(
            client.cached_attributes(&light),
            Err(Error::NotCached(_))
        ));
        // Stopping what never started is harmless.
        client.stop_monitoring(&light);
        client.stop_monitoring(&light);
        assert_eq!(client.resource_state(&light), None);
        client.shutdown();
    }

    #[tokio::test]
    async fn set_ack_does_not_overwrite_a_later_notification() {
        use crate::transport::tests::RecordingTransport;
        use oic_core::wire::{decode_frame, encode_frame};
        use oic_core::{Endpoint, PresenceStatus, ResourceRecord};
        use tokio::sync::oneshot;
        use uuid::Uuid;

        let (mux, events) = TransportMultiplexer::new();
        let sink = mux.frame_sink();
        let recorder = Arc::new(RecordingTransport::default());
        mux.register(recorder.clone(), true);
        let client = ResourceClient::start(ClientConfig::default(), mux, events);
        let host = Endpoint::ip("coap://10.0.0.5:5683");
        let thermostat = ResourceDescriptor::from_record(
            ResourceRecord {
                uri: "/a/thermostat".into(),
                types: vec!["oic.r.temperature".into()],
                interfaces: vec![],
                observable: true,
            },
            &host,
            Uuid::nil(),
        )
        .unwrap();

        client.start_caching(&thermostat, |_| {}).unwrap();
        let mut wanted = AttributeMap::new();
        wanted.insert("Temperature".into(), AttributeValue::Int(30));
        let (tx, rx) = oneshot::channel();
        client
            .set_remote_attributes(&thermostat, wanted.clone(), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        let sent: Vec<Message> = recorder
            .sent
            .lock()
            .drain(..)
            .map(|(_, frame)| decode_frame(&frame).unwrap().0)
            .collect();
        let observe_token = sent
            .iter()
            .find_map(|m| match m {
                Message::Observe { token, .. } => Some(*token),
                _ => None,
            })
            .unwrap();
        let set_token = sent
            .iter()
            .find_map(|m| match m {
                Message::SetAttributes { token, .. } => Some(*token),
                _ => None,
            })
            .unwrap();

        let notify = |nonce: u64, value: i64| {
            let mut attributes = AttributeMap::new();
            attributes.insert("Temperature".into(), AttributeValue::Int(value));
            Message::Notify {
                token: observe_token,
                uri: "/a/thermostat".into(),
                nonce,
                status: PresenceStatus::Ok,
                attributes,
            }
        };
        // The host applies the set, notifies, answers, then changes the value again.
        for msg in [
            Message::ObserveAck {
                token: observe_token,
                uri: "/a/thermostat".into(),
                accepted: true,
            },
            notify(1, 30),
            Message::SetResponse {
                token: set_token,
                result: Ok(wanted.clone()),
            },
            notify(2, 31),
        ] {
            sink.frame(host.clone(), encode_frame(&msg).unwrap());
        }

        assert_eq!(rx.await.unwrap(), Ok(wanted));
        let latest = Ok(Some(AttributeValue::Int(31)));
        for _ in 0..50 {
            if client.cached_attribute(&thermostat, "Temperature") == latest {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.cached_attribute(&thermostat, "Temperature"), latest);
        client.shutdown();
    }
}
