//! OIC resource client core.
//! Host-driven: no I/O; host passes descriptors, frames and ticks, and receives actions.

pub mod attributes;
pub mod automation;
pub mod connectivity;
pub mod discovery;
pub mod error;
pub mod observer;
pub mod presence;
pub mod protocol;
pub mod resource;
pub mod wire;

pub use attributes::{AttributeMap, AttributeStore, AttributeValue, Constraint};
pub use automation::{AutomationId, AutomationStatus, AutomationType};
pub use connectivity::{ConnectivityType, Endpoint};
pub use discovery::{DiscoveryQuery, DiscoverySession};
pub use error::{Error, Result};
pub use observer::{ObservationCore, ObservePhase, ObserverAction};
pub use presence::{PresenceStatus, PresenceSubscription};
pub use protocol::{Message, ResponseCode, PROTOCOL_VERSION};
pub use resource::{ResourceDescriptor, ResourceKey, ResourceRecord, ResourceState};
pub use wire::{decode_frame, encode_frame, FrameBuffer, FrameDecodeError, FrameEncodeError};
