//! OIC resource runtime for Linux: transports, discovery, observation, hosting and automation
//! on top of the host-driven `oic-core`.

pub mod automation;
pub mod client;
pub mod config;
pub mod discovery;
pub mod host;
pub mod transport;

pub use automation::AutomationEngine;
pub use client::{ClientConfig, ResourceClient};
pub use discovery::{DiscoveryEngine, DiscoveryHandle};
pub use host::{HostedResource, ResourceDefinition, ResourceHost};
pub use transport::{FrameSink, MuxEvent, MuxEvents, Transport, TransportMultiplexer};
