//! Connectivity types (IP, Bluetooth classic, BLE) and transport endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Bitmask of transport adapters. A single flag names one transport; a union
    /// names the set of transports a query or resource is reachable over.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ConnectivityType: u32 {
        /// UDP/IP: multicast discovery, unicast request/response.
        const IP = 1 << 0;
        /// Bluetooth classic (RFCOMM-like stream).
        const BT = 1 << 1;
        /// Bluetooth Low Energy (GATT characteristic writes/notifications).
        const BLE = 1 << 2;
    }
}

impl fmt::Display for ConnectivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join("|"))
    }
}

/// Address of a peer on one transport. IP endpoints use `coap://<ip>:<port>`,
/// paired transports use the device MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub connectivity: ConnectivityType,
    pub address: String,
}

impl Endpoint {
    pub fn new(connectivity: ConnectivityType, address: impl Into<String>) -> Self {
        Self {
            connectivity,
            address: address.into(),
        }
    }

    pub fn ip(address: impl Into<String>) -> Self {
        Self::new(ConnectivityType::IP, address)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.connectivity)
    }
}
