//! Resource model: wire records, immutable descriptors, lifecycle state.

use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connectivity::{ConnectivityType, Endpoint};
use crate::error::{Error, Result};

/// Default interface every OIC resource exposes.
pub const BASELINE_INTERFACE: &str = "oic.if.baseline";

/// Resource entry as carried in a discovery response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub uri: String,
    pub types: Vec<String>,
    pub interfaces: Vec<String>,
    pub observable: bool,
}

/// Identity of a discovered resource: (URI, host address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub uri: String,
    pub host: String,
}

impl ResourceKey {
    pub fn new(uri: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.uri)
    }
}

/// A discovered resource. Built once from a discovery response; never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    uri: String,
    endpoint: Endpoint,
    device_id: Uuid,
    types: BTreeSet<String>,
    interfaces: BTreeSet<String>,
    observable: bool,
    discovered_at: SystemTime,
}

impl ResourceDescriptor {
    /// Validate a wire record received from `source` and build the descriptor.
    pub fn from_record(record: ResourceRecord, source: &Endpoint, device_id: Uuid) -> Result<Self> {
        if !record.uri.starts_with('/') {
            return Err(Error::MalformedResponse(format!(
                "resource uri {:?} from {} is not absolute",
                record.uri, source
            )));
        }
        if record.types.is_empty() {
            return Err(Error::MalformedResponse(format!(
                "resource {} from {} has no resource type",
                record.uri, source
            )));
        }
        let mut interfaces: BTreeSet<String> = record.interfaces.into_iter().collect();
        if interfaces.is_empty() {
            interfaces.insert(BASELINE_INTERFACE.to_string());
        }
        Ok(Self {
            uri: record.uri,
            endpoint: source.clone(),
            device_id,
            types: record.types.into_iter().collect(),
            interfaces,
            observable: record.observable,
            discovered_at: SystemTime::now(),
        })
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.uri, &self.endpoint.address)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn host(&self) -> &str {
        &self.endpoint.address
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connectivity(&self) -> ConnectivityType {
        self.endpoint.connectivity
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn types(&self) -> &BTreeSet<String> {
        &self.types
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    pub fn has_type(&self, resource_type: &str) -> bool {
        self.types.contains(resource_type)
    }

    pub fn is_observable(&self) -> bool {
        self.observable
    }

    pub fn discovered_at(&self) -> SystemTime {
        self.discovered_at
    }
}

/// Lifecycle of a resource as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Delivered by discovery; nobody is observing it.
    Discovered,
    /// Subscription requested or active, no cache entry yet.
    Observing,
    /// A notification landed in the cache.
    Cached,
    /// Released by the caller or the host stopped presence.
    Stopped,
    /// Subscribe got no response in time (or the host reported a timeout).
    Timeout,
    /// The transport carrying the subscription went down.
    LostSignal,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Discovered => "DISCOVERED",
            ResourceState::Observing => "OBSERVING",
            ResourceState::Cached => "CACHED",
            ResourceState::Stopped => "STOPPED",
            ResourceState::Timeout => "TIMEOUT",
            ResourceState::LostSignal => "LOST_SIGNAL",
        };
        f.write_str(s)
    }
}
