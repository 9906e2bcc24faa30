//! Automation engine: one task per job, walking a value sequence through the
//! hosted resource's local-update path, one value per interval.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use oic_core::automation::{AutomationRegistry, AutomationScope, AutomationSequence};
use oic_core::{AutomationId, AutomationStatus, AutomationType, Result};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::host::HostedResource;

type Jobs = Arc<Mutex<HashMap<AutomationId, watch::Sender<bool>>>>;

pub struct AutomationEngine {
    interval: Duration,
    registry: Arc<Mutex<AutomationRegistry>>,
    jobs: Jobs,
    runtime: Handle,
}

impl AutomationEngine {
    /// Must be called from within a tokio runtime.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            registry: Arc::new(Mutex::new(AutomationRegistry::new())),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            runtime: Handle::current(),
        }
    }

    /// Cycle every attribute of `resource` through its value sequence.
    /// At most one resource-level job per resource.
    pub fn start_resource_automation<F>(
        &self,
        resource: &Arc<HostedResource>,
        kind: AutomationType,
        on_complete: F,
    ) -> Result<AutomationId>
    where
        F: FnOnce(AutomationId, AutomationStatus) + Send + 'static,
    {
        let sequence = resource.with_store(|store| AutomationSequence::for_resource(store, kind));
        self.spawn(resource, AutomationScope::Resource, sequence, on_complete)
    }

    /// Cycle one attribute. Jobs on different attributes run independently.
    pub fn start_attribute_automation<F>(
        &self,
        resource: &Arc<HostedResource>,
        attribute: &str,
        kind: AutomationType,
        on_complete: F,
    ) -> Result<AutomationId>
    where
        F: FnOnce(AutomationId, AutomationStatus) + Send + 'static,
    {
        let sequence =
            resource.with_store(|store| AutomationSequence::for_attribute(store, attribute, kind))?;
        self.spawn(
            resource,
            AutomationScope::Attribute(attribute.to_string()),
            sequence,
            on_complete,
        )
    }

    fn spawn<F>(
        &self,
        resource: &Arc<HostedResource>,
        scope: AutomationScope,
        sequence: AutomationSequence,
        on_complete: F,
    ) -> Result<AutomationId>
    where
        F: FnOnce(AutomationId, AutomationStatus) + Send + 'static,
    {
        let id = self.registry.lock().register(resource.uri(), scope)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        self.jobs.lock().insert(id, stop_tx);
        info!(id, uri = resource.uri(), steps = sequence.len(), kind = ?sequence.kind(), "automation started");

        let job = Job {
            id,
            resource: Arc::downgrade(resource),
            sequence,
            interval: self.interval,
            stop: stop_rx,
        };
        let registry = self.registry.clone();
        let jobs = self.jobs.clone();
        self.runtime.spawn(async move {
            let status = job.run().await;
            registry.lock().unregister(id);
            jobs.lock().remove(&id);
            info!(id, ?status, "automation finished");
            on_complete(id, status);
        });
        Ok(id)
    }

    /// Request a job to stop; it completes with Stopped. Unknown ids are ignored.
    pub fn stop_automation(&self, id: AutomationId) {
        match self.jobs.lock().get(&id) {
            Some(stop) => {
                let _ = stop.send(true);
            }
            None => debug!(id, "stop for unknown automation"),
        }
    }

    pub fn stop_all(&self) {
        for stop in self.jobs.lock().values() {
            let _ = stop.send(true);
        }
    }

    pub fn is_active(&self, id: AutomationId) -> bool {
        self.registry.lock().is_active(id)
    }

    pub fn active(&self) -> Vec<AutomationId> {
        self.registry.lock().ids()
    }
}

impl Drop for AutomationEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

struct Job {
    id: AutomationId,
    resource: Weak<HostedResource>,
    sequence: AutomationSequence,
    interval: Duration,
    stop: watch::Receiver<bool>,
}

impl Job {
    async fn run(mut self) -> AutomationStatus {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            if *self.stop.borrow() {
                return AutomationStatus::Stopped;
            }
            let Some(step) = self.sequence.next_step() else {
                return AutomationStatus::Success;
            };
            let resource = match self.resource.upgrade() {
                Some(r) if r.is_alive() => r,
                _ => return AutomationStatus::Stopped,
            };
            if let Err(e) = resource.update_local_attribute(&step.attribute, step.value) {
                warn!(id = self.id, attribute = %step.attribute, error = %e, "skipping value");
            }
            drop(resource);
            tokio::select! {
                _ = ticker.tick() => {}
                // The flag only ever flips to true.
                _ = self.stop.changed() => return AutomationStatus::Stopped,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ResourceDefinition, ResourceHost};
    use crate::transport::tests::RecordingTransport;
    use crate::transport::TransportMultiplexer;
    use oic_core::wire::{decode_frame, encode_frame};
    use oic_core::{AttributeStore, AttributeValue, Constraint, Endpoint, Error, Message};
    use tokio::sync::oneshot;

    fn light_host() -> (ResourceHost, Arc<HostedResource>) {
        let (host, resource, _) = observed_light_host();
        (host, resource)
    }

    /// Light host on a recording transport, with an Observe already queued to its router.
    fn observed_light_host() -> (ResourceHost, Arc<HostedResource>, Arc<RecordingTransport>) {
        let (mux, events) = TransportMultiplexer::new();
        let recorder = Arc::new(RecordingTransport::default());
        mux.register(recorder.clone(), true);
        let sink = mux.frame_sink();
        let host = ResourceHost::start(mux, events);
        let mut store = AttributeStore::new();
        store
            .declare(
                "power",
                "off",
                Constraint::AllowedValues(vec!["on".into(), "off".into()]),
            )
            .unwrap();
        store
            .declare("level", 1, Constraint::Range { min: 1.0, max: 3.0 })
            .unwrap();
        store.declare("name", "lamp", Constraint::None).unwrap();
        store
            .declare("mode", 1, Constraint::AllowedValues(vec![]))
            .unwrap();
        let resource = host
            .add_resource(ResourceDefinition::new("/a/light", "core.light").with_attributes(store))
            .unwrap();
        let observe = Message::Observe {
            token: 4,
            uri: "/a/light".into(),
        };
        sink.frame(
            Endpoint::ip("coap://10.0.0.9:5683"),
            encode_frame(&observe).unwrap(),
        );
        (host, resource, recorder)
    }

    async fn wait_for_observer(resource: &HostedResource) {
        for _ in 0..100 {
            if resource.observer_count() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("observer never registered");
    }

    fn notifications(recorder: &RecordingTransport) -> usize {
        recorder
            .sent
            .lock()
            .iter()
            .filter(|(_, frame)| {
                matches!(decode_frame(frame), Ok((Message::Notify { .. }, _)))
            })
            .count()
    }

    fn completion() -> (
        impl FnOnce(AutomationId, AutomationStatus) + Send + 'static,
        oneshot::Receiver<(AutomationId, AutomationStatus)>,
    ) {
        let (tx, rx) = oneshot::channel();
        (
            move |id: AutomationId, status: AutomationStatus| {
                let _ = tx.send((id, status));
            },
            rx,
        )
    }

    #[tokio::test]
    async fn one_shot_walks_the_sequence_once() {
        let (_host, light) = light_host();
        let engine = AutomationEngine::new(Duration::from_millis(5));
        let (done, rx) = completion();
        let id = engine
            .start_attribute_automation(&light, "level", AutomationType::OneShot, done)
            .unwrap();
        assert_eq!(rx.await.unwrap(), (id, AutomationStatus::Success));
        assert_eq!(light.attribute("level"), Some(AttributeValue::Int(3)));
        assert!(!engine.is_active(id));
    }

    #[tokio::test]
    async fn empty_sequence_succeeds_without_updates() {
        let (_host, light, recorder) = observed_light_host();
        wait_for_observer(&light).await;
        let engine = AutomationEngine::new(Duration::from_millis(5));
        for name in ["mode", "name"] {
            let (done, rx) = completion();
            let id = engine
                .start_attribute_automation(&light, name, AutomationType::OneShot, done)
                .unwrap();
            assert_eq!(rx.await.unwrap(), (id, AutomationStatus::Success));
        }
        assert_eq!(light.attribute("mode"), Some(AttributeValue::Int(1)));
        assert_eq!(light.attribute("name"), Some(AttributeValue::from("lamp")));
        assert_eq!(notifications(&recorder), 0);
    }

    #[tokio::test]
    async fn second_resource_job_conflicts_until_stopped() {
        let (_host, light) = light_host();
        let engine = AutomationEngine::new(Duration::from_millis(5));
        let (done, rx) = completion();
        let id = engine
            .start_resource_automation(&light, AutomationType::Recurring, done)
            .unwrap();
        assert!(matches!(
            engine.start_resource_automation(&light, AutomationType::OneShot, |_, _| {}),
            Err(Error::AutomationAlreadyInProgress(_))
        ));
        let attr = engine
            .start_attribute_automation(&light, "power", AutomationType::Recurring, |_, _| {})
            .unwrap();
        assert_eq!(engine.active(), vec![id, attr]);

        engine.stop_automation(id);
        engine.stop_automation(9999);
        assert_eq!(rx.await.unwrap(), (id, AutomationStatus::Stopped));
        let (done, rx) = completion();
        let again = engine
            .start_resource_automation(&light, AutomationType::Recurring, done)
            .unwrap();
        engine.stop_all();
        assert_eq!(rx.await.unwrap(), (again, AutomationStatus::Stopped));
    }

    #[tokio::test]
    async fn removing_the_resource_stops_its_jobs() {
        let (host, light) = light_host();
        let engine = AutomationEngine::new(Duration::from_millis(5));
        let (done, rx) = completion();
        let id = engine
            .start_attribute_automation(&light, "power", AutomationType::Recurring, done)
            .unwrap();
        host.remove_resource("/a/light");
        assert_eq!(rx.await.unwrap(), (id, AutomationStatus::Stopped));
    }

    #[tokio::test]
    async fn unknown_attribute_is_rejected() {
        let (_host, light) = light_host();
        let engine = AutomationEngine::new(Duration::from_millis(5));
        assert!(matches!(
            engine.start_attribute_automation(&light, "color", AutomationType::OneShot, |_, _| {}),
            Err(Error::UnknownAttribute(_))
        ));
        assert!(engine.active().is_empty());
    }
}
