//! Host-driven observation core: subscriptions, nonce filtering and the attribute cache.
//! The host passes descriptors, inbound messages and ticks; the core returns actions.

use std::collections::HashMap;

use crate::attributes::{AttributeMap, AttributeValue};
use crate::connectivity::{ConnectivityType, Endpoint};
use crate::error::{Error, Result};
use crate::presence::{PresenceStatus, PresenceSubscription};
use crate::protocol::Message;
use crate::resource::{ResourceDescriptor, ResourceKey, ResourceState};

/// Default ticks to wait for the first response to a subscribe.
pub const DEFAULT_SUBSCRIBE_TIMEOUT_TICKS: u64 = 20;

/// Subscription phase of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservePhase {
    NotObserving,
    Observing,
    Error,
}

/// Work for the host: frames to send and callbacks to deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverAction {
    Send(Endpoint, Message),
    StateChanged(ResourceKey, ResourceState),
    CacheUpdated(ResourceKey, AttributeMap),
}

struct Observation {
    descriptor: ResourceDescriptor,
    phase: ObservePhase,
    state: ResourceState,
    subscription: Option<PresenceSubscription>,
    /// Tick by which the host must have answered the subscribe.
    ack_deadline: Option<u64>,
    monitoring: bool,
    caching: bool,
    /// None until caching is started; kept across stop so the last snapshot stays readable.
    cache: Option<AttributeMap>,
    last_error: Option<Error>,
}

impl Observation {
    fn new(descriptor: ResourceDescriptor) -> Self {
        Self {
            descriptor,
            phase: ObservePhase::NotObserving,
            state: ResourceState::Discovered,
            subscription: None,
            ack_deadline: None,
            monitoring: false,
            caching: false,
            cache: None,
            last_error: None,
        }
    }
}

/// Per-resource observation state machine {NotObserving, Observing, Error} plus cache.
pub struct ObservationCore {
    observations: HashMap<ResourceKey, Observation>,
    /// Observe token -> resource, for routing acks and notifications.
    tokens: HashMap<u64, ResourceKey>,
    tick_count: u64,
    subscribe_timeout_ticks: u64,
}

impl Default for ObservationCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationCore {
    pub fn new() -> Self {
        Self {
            observations: HashMap::new(),
            tokens: HashMap::new(),
            tick_count: 0,
            subscribe_timeout_ticks: DEFAULT_SUBSCRIBE_TIMEOUT_TICKS,
        }
    }

    /// Set custom subscribe timeout in ticks (minimum 1).
    pub fn set_subscribe_timeout(&mut self, ticks: u64) {
        self.subscribe_timeout_ticks = ticks.max(1);
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Start delivering state changes for `descriptor`. Subscribes unless a
    /// subscription is already active (e.g. because caching started first).
    pub fn start_monitoring(
        &mut self,
        descriptor: &ResourceDescriptor,
        token: u64,
    ) -> Result<Vec<ObserverAction>> {
        self.enable(descriptor, token, true)
    }

    /// Start caching notifications for `descriptor`, sharing the monitoring subscription.
    pub fn start_caching(
        &mut self,
        descriptor: &ResourceDescriptor,
        token: u64,
    ) -> Result<Vec<ObserverAction>> {
        self.enable(descriptor, token, false)
    }

    fn enable(
        &mut self,
        descriptor: &ResourceDescriptor,
        token: u64,
        monitoring: bool,
    ) -> Result<Vec<ObserverAction>> {
        let key = descriptor.key();
        if !descriptor.is_observable() {
            return Err(Error::NotObservable(key.to_string()));
        }
        let obs = self
            .observations
            .entry(key.clone())
            .or_insert_with(|| Observation::new(descriptor.clone()));
        if monitoring {
            obs.monitoring = true;
        } else {
            obs.caching = true;
            obs.cache.get_or_insert_with(AttributeMap::new);
        }
        if obs.phase == ObservePhase::Observing {
            return Ok(Vec::new());
        }

        if let Some(old) = obs.subscription.take() {
            self.tokens.remove(&old.token());
        }
        let endpoint = descriptor.endpoint().clone();
        obs.subscription = Some(PresenceSubscription::new(
            endpoint.clone(),
            descriptor.uri(),
            token,
        ));
        obs.phase = ObservePhase::Observing;
        obs.state = ResourceState::Observing;
        obs.last_error = None;
        obs.ack_deadline = Some(self.tick_count + self.subscribe_timeout_ticks);
        self.tokens.insert(token, key);
        Ok(vec![ObserverAction::Send(
            endpoint,
            Message::Observe {
                token,
                uri: descriptor.uri().to_string(),
            },
        )])
    }

    /// Stop state-change delivery. No-op if not monitoring. The subscription is
    /// released only when caching is off as well.
    pub fn stop_monitoring(&mut self, key: &ResourceKey) -> Vec<ObserverAction> {
        match self.observations.get_mut(key) {
            Some(obs) if obs.monitoring => {
                obs.monitoring = false;
                if obs.caching {
                    return Vec::new();
                }
            }
            _ => return Vec::new(),
        }
        self.release(key)
    }

    /// Stop cache updates. No-op if not caching. The last snapshot stays readable.
    pub fn stop_caching(&mut self, key: &ResourceKey) -> Vec<ObserverAction> {
        match self.observations.get_mut(key) {
            Some(obs) if obs.caching => {
                obs.caching = false;
                if obs.monitoring {
                    return Vec::new();
                }
            }
            _ => return Vec::new(),
        }
        self.release(key)
    }

    /// Release everything held for a resource, cache included.
    pub fn destroy(&mut self, key: &ResourceKey) -> Vec<ObserverAction> {
        let actions = self.release(key);
        self.observations.remove(key);
        actions
    }

    fn release(&mut self, key: &ResourceKey) -> Vec<ObserverAction> {
        let Some(obs) = self.observations.get_mut(key) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        if let Some(sub) = obs.subscription.take() {
            self.tokens.remove(&sub.token());
            if obs.phase == ObservePhase::Observing {
                actions.push(ObserverAction::Send(
                    sub.host().clone(),
                    Message::CancelObserve {
                        token: sub.token(),
                        uri: sub.uri().to_string(),
                    },
                ));
            }
        }
        obs.phase = ObservePhase::NotObserving;
        obs.state = ResourceState::Stopped;
        obs.ack_deadline = None;
        actions
    }

    /// Process an inbound observe ack or notification from `source`.
    pub fn on_message(&mut self, source: &Endpoint, msg: &Message) -> Vec<ObserverAction> {
        match msg {
            Message::ObserveAck {
                token, accepted, ..
            } => self.on_ack(source, *token, *accepted),
            Message::Notify {
                token,
                nonce,
                status,
                attributes,
                ..
            } => self.on_notify(source, *token, *nonce, *status, attributes),
            _ => Vec::new(),
        }
    }

    fn on_ack(&mut self, source: &Endpoint, token: u64, accepted: bool) -> Vec<ObserverAction> {
        let Some(key) = self.tokens.get(&token).cloned() else {
            return Vec::new();
        };
        let Some(obs) = self.observations.get_mut(&key) else {
            return Vec::new();
        };
        let from_host = obs
            .subscription
            .as_ref()
            .map_or(false, |s| s.is_from_host(source));
        if !from_host || obs.phase != ObservePhase::Observing {
            return Vec::new();
        }
        obs.ack_deadline = None;
        if accepted {
            return Vec::new();
        }
        if let Some(sub) = obs.subscription.as_mut() {
            sub.set_status(PresenceStatus::Stopped);
        }
        self.tokens.remove(&token);
        obs.phase = ObservePhase::Error;
        obs.state = ResourceState::Stopped;
        obs.last_error = Some(Error::NotObservable(key.to_string()));
        vec![ObserverAction::StateChanged(key, ResourceState::Stopped)]
    }

    fn on_notify(
        &mut self,
        source: &Endpoint,
        token: u64,
        nonce: u64,
        status: PresenceStatus,
        attributes: &AttributeMap,
    ) -> Vec<ObserverAction> {
        let Some(key) = self.tokens.get(&token).cloned() else {
            return Vec::new();
        };
        let Some(obs) = self.observations.get_mut(&key) else {
            return Vec::new();
        };
        if obs.phase != ObservePhase::Observing {
            return Vec::new();
        }
        let Some(sub) = obs.subscription.as_mut() else {
            return Vec::new();
        };
        if !sub.is_from_host(source) || !sub.accept(nonce) {
            return Vec::new();
        }
        sub.set_status(status);
        obs.ack_deadline = None;

        match status {
            PresenceStatus::Ok => {
                if obs.caching {
                    let cache = obs.cache.get_or_insert_with(AttributeMap::new);
                    cache.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
                    let snapshot = cache.clone();
                    obs.state = ResourceState::Cached;
                    vec![
                        ObserverAction::StateChanged(key.clone(), ResourceState::Cached),
                        ObserverAction::CacheUpdated(key, snapshot),
                    ]
                } else {
                    obs.state = ResourceState::Observing;
                    vec![ObserverAction::StateChanged(key, ResourceState::Observing)]
                }
            }
            PresenceStatus::Stopped => {
                obs.subscription = None;
                self.tokens.remove(&token);
                obs.phase = ObservePhase::NotObserving;
                obs.state = ResourceState::Stopped;
                vec![ObserverAction::StateChanged(key, ResourceState::Stopped)]
            }
            PresenceStatus::Timeout => {
                self.tokens.remove(&token);
                obs.phase = ObservePhase::Error;
                obs.state = ResourceState::Timeout;
                obs.last_error = Some(Error::SubscriptionTimeout(key.to_string()));
                vec![ObserverAction::StateChanged(key, ResourceState::Timeout)]
            }
        }
    }

    /// Periodic tick: subscriptions still waiting for their first response past
    /// the deadline move to Error and report Timeout.
    pub fn tick(&mut self) -> Vec<ObserverAction> {
        self.tick_count = self.tick_count.saturating_add(1);
        let mut actions = Vec::new();
        for (key, obs) in self.observations.iter_mut() {
            if obs.phase != ObservePhase::Observing {
                continue;
            }
            match obs.ack_deadline {
                Some(deadline) if self.tick_count >= deadline => {}
                _ => continue,
            }
            obs.ack_deadline = None;
            obs.phase = ObservePhase::Error;
            obs.state = ResourceState::Timeout;
            obs.last_error = Some(Error::SubscriptionTimeout(key.to_string()));
            if let Some(sub) = obs.subscription.as_mut() {
                sub.set_status(PresenceStatus::Timeout);
                self.tokens.remove(&sub.token());
                actions.push(ObserverAction::Send(
                    sub.host().clone(),
                    Message::CancelObserve {
                        token: sub.token(),
                        uri: sub.uri().to_string(),
                    },
                ));
            }
            actions.push(ObserverAction::StateChanged(
                key.clone(),
                ResourceState::Timeout,
            ));
        }
        actions
    }

    /// A transport went down: every active subscription over it loses its signal.
    pub fn on_transport_down(&mut self, connectivity: ConnectivityType) -> Vec<ObserverAction> {
        let mut actions = Vec::new();
        for (key, obs) in self.observations.iter_mut() {
            if obs.phase != ObservePhase::Observing
                || obs.descriptor.connectivity() != connectivity
            {
                continue;
            }
            if let Some(sub) = obs.subscription.as_ref() {
                self.tokens.remove(&sub.token());
            }
            obs.ack_deadline = None;
            obs.phase = ObservePhase::Error;
            obs.state = ResourceState::LostSignal;
            obs.last_error = Some(Error::TransportUnavailable(connectivity));
            actions.push(ObserverAction::StateChanged(
                key.clone(),
                ResourceState::LostSignal,
            ));
        }
        actions
    }

    /// Merge attributes a host acknowledged for a remote set into the cache. No callback.
    pub fn on_set_acknowledged(&mut self, key: &ResourceKey, accepted: &AttributeMap) {
        if let Some(obs) = self.observations.get_mut(key) {
            if !obs.caching {
                return;
            }
            if let Some(cache) = obs.cache.as_mut() {
                cache.extend(accepted.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
    }

    pub fn state(&self, key: &ResourceKey) -> Option<ResourceState> {
        self.observations.get(key).map(|o| o.state)
    }

    pub fn phase(&self, key: &ResourceKey) -> ObservePhase {
        self.observations
            .get(key)
            .map_or(ObservePhase::NotObserving, |o| o.phase)
    }

    pub fn is_monitoring(&self, key: &ResourceKey) -> bool {
        self.observations.get(key).map_or(false, |o| o.monitoring)
    }

    pub fn is_caching(&self, key: &ResourceKey) -> bool {
        self.observations.get(key).map_or(false, |o| o.caching)
    }

    /// Error that moved the resource into the Error phase (or rejected its subscribe).
    pub fn last_error(&self, key: &ResourceKey) -> Option<Error> {
        self.observations.get(key).and_then(|o| o.last_error.clone())
    }

    pub fn subscription(&self, key: &ResourceKey) -> Option<&PresenceSubscription> {
        self.observations
            .get(key)
            .and_then(|o| o.subscription.as_ref())
    }

    /// Copy of the last cached snapshot.
    pub fn cached_attributes(&self, key: &ResourceKey) -> Result<AttributeMap> {
        self.observations
            .get(key)
            .and_then(|o| o.cache.clone())
            .ok_or_else(|| Error::NotCached(key.to_string()))
    }

    pub fn cached_attribute(&self, key: &ResourceKey, name: &str) -> Result<Option<AttributeValue>> {
        let cache = self
            .observations
            .get(key)
            .and_then(|o| o.cache.as_ref())
            .ok_or_else(|| Error::NotCached(key.to_string()))?;
        Ok(cache.get(name).cloned())
    }

    /// Resources with an observation entry.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.observations.keys().cloned().collect()
    }
}
