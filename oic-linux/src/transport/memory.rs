//! In-process network joining endpoints of any connectivity type. Used for
//! simulation and tests; each endpoint can be switched on and off like an adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use oic_core::{ConnectivityType, Endpoint, Error, Result};
use parking_lot::Mutex;
use tracing::debug;

use super::{FrameSink, Transport};

struct Node {
    sink: FrameSink,
    enabled: Arc<AtomicBool>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<Endpoint, Node>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `endpoint`; frames addressed to it are pushed into `sink`.
    pub fn attach(&self, endpoint: Endpoint, sink: FrameSink) -> Arc<MemoryTransport> {
        let enabled = Arc::new(AtomicBool::new(true));
        self.nodes.lock().insert(
            endpoint.clone(),
            Node {
                sink: sink.clone(),
                enabled: enabled.clone(),
            },
        );
        Arc::new(MemoryTransport {
            network: self.clone(),
            endpoint,
            enabled,
            sink,
        })
    }

    pub fn detach(&self, endpoint: &Endpoint) {
        self.nodes.lock().remove(endpoint);
    }

    fn deliver(&self, source: &Endpoint, target: &Endpoint, frame: Vec<u8>) -> bool {
        let nodes = self.nodes.lock();
        match nodes.get(target) {
            Some(node) if node.enabled.load(Ordering::SeqCst) => {
                node.sink.frame(source.clone(), frame);
                true
            }
            _ => {
                debug!(%source, %target, "memory frame dropped");
                false
            }
        }
    }

    fn broadcast(&self, source: &Endpoint, frame: &[u8]) {
        let nodes = self.nodes.lock();
        for (endpoint, node) in nodes.iter() {
            if endpoint == source
                || endpoint.connectivity != source.connectivity
                || !node.enabled.load(Ordering::SeqCst)
            {
                continue;
            }
            node.sink.frame(source.clone(), frame.to_vec());
        }
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoint: Endpoint,
    enabled: Arc<AtomicBool>,
    sink: FrameSink,
}

impl MemoryTransport {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Simulate the adapter being switched on or off. Reports the change to the owning engine.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            self.sink.adapter_state(self.endpoint.connectivity, enabled);
        }
    }

    fn check_enabled(&self) -> Result<()> {
        if self.enabled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::TransportUnavailable(self.endpoint.connectivity))
        }
    }
}

impl Transport for MemoryTransport {
    fn connectivity(&self) -> ConnectivityType {
        self.endpoint.connectivity
    }

    /// Frames to unknown or disabled endpoints are lost, as on a real link.
    fn send_to(&self, target: &Endpoint, frame: Vec<u8>) -> Result<()> {
        self.check_enabled()?;
        self.network.deliver(&self.endpoint, target, frame);
        Ok(())
    }

    fn multicast(&self, frame: Vec<u8>) -> Result<()> {
        self.check_enabled()?;
        self.network.broadcast(&self.endpoint, &frame);
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.detach(&self.endpoint);
    }
}
