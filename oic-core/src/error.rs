//! Error taxonomy shared by the client, host and automation engines.

use crate::connectivity::ConnectivityType;
use crate::protocol::ResponseCode;
use crate::wire::{FrameDecodeError, FrameEncodeError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The transport for this connectivity is down or not registered.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(ConnectivityType),

    /// None of the requested connectivity types could carry the operation.
    #[error("no transport available for {0}")]
    NoTransportAvailable(ConnectivityType),

    /// Cache read on a resource that never had caching started.
    #[error("resource {0} is not cached")]
    NotCached(String),

    #[error("invalid value for attribute '{key}': {reason}")]
    InvalidAttributeValue { key: String, reason: String },

    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("automation already in progress on {0}")]
    AutomationAlreadyInProgress(String),

    #[error("subscription to {0} timed out")]
    SubscriptionTimeout(String),

    #[error("request timed out")]
    RequestTimeout,

    /// Wire payload failed to parse or carried an invalid record.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid discovery query: {0}")]
    InvalidQuery(String),

    #[error("resource {0} is not observable")]
    NotObservable(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    /// Hosted resource definition without an absolute URI or a resource type.
    #[error("invalid resource definition: {0}")]
    InvalidResource(String),

    /// The host failed the request for a reason outside the attribute model.
    #[error("host error: {0}")]
    Host(String),
}

impl Error {
    pub fn invalid_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidAttributeValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<FrameEncodeError> for Error {
    fn from(e: FrameEncodeError) -> Self {
        Error::MalformedResponse(e.to_string())
    }
}

impl From<FrameDecodeError> for Error {
    fn from(e: FrameDecodeError) -> Self {
        Error::MalformedResponse(e.to_string())
    }
}

impl From<ResponseCode> for Error {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::ResourceNotFound(uri) => Error::ResourceNotFound(uri),
            ResponseCode::NotObservable(uri) => Error::NotObservable(uri),
            ResponseCode::InvalidAttributeValue { key, reason } => {
                Error::InvalidAttributeValue { key, reason }
            }
            ResponseCode::UnknownAttribute(key) => Error::UnknownAttribute(key),
            ResponseCode::Internal(reason) => Error::Host(reason),
        }
    }
}

impl From<Error> for ResponseCode {
    /// Host side: map a store/lookup failure onto the wire code sent back.
    fn from(e: Error) -> Self {
        match e {
            Error::NotObservable(uri) => ResponseCode::NotObservable(uri),
            Error::InvalidAttributeValue { key, reason } => {
                ResponseCode::InvalidAttributeValue { key, reason }
            }
            Error::UnknownAttribute(key) => ResponseCode::UnknownAttribute(key),
            Error::ResourceNotFound(uri) => ResponseCode::ResourceNotFound(uri),
            Error::Host(reason) => ResponseCode::Internal(reason),
            other => ResponseCode::Internal(other.to_string()),
        }
    }
}
