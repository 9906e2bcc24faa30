//! Presence subscriptions: per-subscription nonce ordering and status.

use serde::{Deserialize, Serialize};

use crate::connectivity::Endpoint;

/// Presence status carried by a notification and kept on the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Ok,
    Stopped,
    Timeout,
}

/// Client side of one observe registration.
#[derive(Debug, Clone)]
pub struct PresenceSubscription {
    host: Endpoint,
    uri: String,
    token: u64,
    last_nonce: u64,
    status: PresenceStatus,
}

impl PresenceSubscription {
    pub fn new(host: Endpoint, uri: impl Into<String>, token: u64) -> Self {
        Self {
            host,
            uri: uri.into(),
            token,
            last_nonce: 0,
            status: PresenceStatus::Ok,
        }
    }

    pub fn host(&self) -> &Endpoint {
        &self.host
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn last_nonce(&self) -> u64 {
        self.last_nonce
    }

    pub fn status(&self) -> PresenceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: PresenceStatus) {
        self.status = status;
    }

    /// Whether a frame from `source` belongs to this subscription's host filter.
    pub fn is_from_host(&self, source: &Endpoint) -> bool {
        self.host == *source
    }

    /// Accept a nonce if it is newer than everything seen so far.
    /// Duplicates and out-of-order nonces return false and leave the counter unchanged.
    pub fn accept(&mut self, nonce: u64) -> bool {
        if nonce <= self.last_nonce {
            return false;
        }
        self.last_nonce = nonce;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub() -> PresenceSubscription {
        PresenceSubscription::new(Endpoint::ip("coap://10.0.0.5:5683"), "/a/light", 9)
    }

    #[test]
    fn nonces_must_strictly_increase() {
        let mut s = sub();
        assert!(s.accept(1));
        assert!(!s.accept(1));
        assert!(s.accept(3));
        assert!(!s.accept(2));
        assert!(!s.accept(0));
        assert_eq!(s.last_nonce(), 3);
    }

    #[test]
    fn host_filter() {
        let s = sub();
        assert!(s.is_from_host(&Endpoint::ip("coap://10.0.0.5:5683")));
        assert!(!s.is_from_host(&Endpoint::ip("coap://10.0.0.6:5683")));
    }
}
