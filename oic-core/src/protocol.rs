//! OIC wire protocol: message types and version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attributes::AttributeMap;
use crate::presence::PresenceStatus;
use crate::resource::ResourceRecord;

/// Current protocol version. Carried in discovery messages.
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known discovery resource.
pub const DISCOVERY_URI: &str = "/oic/res";

/// Result code returned by a host for a rejected request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseCode {
    ResourceNotFound(String),
    NotObservable(String),
    InvalidAttributeValue { key: String, reason: String },
    UnknownAttribute(String),
    /// Any other host-side failure, carried as text.
    Internal(String),
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
/// Every request carries a token that the matching response echoes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Multicast `/oic/res` query with an optional `rt=` / `if=` filter.
    DiscoveryRequest {
        protocol_version: u8,
        token: u64,
        query: String,
    },
    /// Unicast reply listing the responder's matching resources.
    DiscoveryResponse {
        protocol_version: u8,
        token: u64,
        device_id: Uuid,
        resources: Vec<ResourceRecord>,
    },
    /// Register for change notifications on a resource.
    Observe { token: u64, uri: String },
    ObserveAck {
        token: u64,
        uri: String,
        accepted: bool,
    },
    /// Release an observe registration.
    CancelObserve { token: u64, uri: String },
    /// Change notification. `nonce` increases by one per notification per observer.
    Notify {
        token: u64,
        uri: String,
        nonce: u64,
        status: PresenceStatus,
        attributes: AttributeMap,
    },
    GetAttributes { token: u64, uri: String },
    GetResponse {
        token: u64,
        result: Result<AttributeMap, ResponseCode>,
    },
    SetAttributes {
        token: u64,
        uri: String,
        attributes: AttributeMap,
    },
    /// Accepted attribute map, or the reason nothing was applied.
    SetResponse {
        token: u64,
        result: Result<AttributeMap, ResponseCode>,
    },
}

impl Message {
    pub fn token(&self) -> u64 {
        match self {
            Message::DiscoveryRequest { token, .. }
            | Message::DiscoveryResponse { token, .. }
            | Message::Observe { token, .. }
            | Message::ObserveAck { token, .. }
            | Message::CancelObserve { token, .. }
            | Message::Notify { token, .. }
            | Message::GetAttributes { token, .. }
            | Message::GetResponse { token, .. }
            | Message::SetAttributes { token, .. }
            | Message::SetResponse { token, .. } => *token,
        }
    }

    /// Responses completed through the request table rather than routed to an engine.
    pub fn is_request_response(&self) -> bool {
        matches!(
            self,
            Message::GetResponse { .. } | Message::SetResponse { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::DiscoveryRequest { .. } => "discovery-request",
            Message::DiscoveryResponse { .. } => "discovery-response",
            Message::Observe { .. } => "observe",
            Message::ObserveAck { .. } => "observe-ack",
            Message::CancelObserve { .. } => "cancel-observe",
            Message::Notify { .. } => "notify",
            Message::GetAttributes { .. } => "get",
            Message::GetResponse { .. } => "get-response",
            Message::SetAttributes { .. } => "set",
            Message::SetResponse { .. } => "set-response",
        }
    }
}
