//! Device-paired transports (Bluetooth classic, BLE GATT). The platform drives
//! them through [`PlatformEventSink`] and drains outbound packets from a channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use oic_core::wire::fragment;
use oic_core::{ConnectivityType, Endpoint, Error, FrameBuffer, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{FrameSink, Transport};

/// Default GATT payload (ATT MTU 23 minus the 3-byte header).
pub const DEFAULT_BLE_MTU: usize = 20;
/// RFCOMM is a stream; frames are written in chunks of this size.
pub const DEFAULT_BT_CHUNK: usize = 990;

/// Platform connectivity callbacks.
pub trait PlatformEventSink: Send + Sync {
    fn on_adapter_state_changed(&self, enabled: bool);

    fn on_bond_state_changed(&self, address: &str, bonded: bool);

    /// A characteristic value (BLE) or stream chunk (BT) arrived from `address`.
    fn on_characteristic_changed(&self, address: &str, value: &[u8]);

    fn on_write_complete(&self, address: &str, success: bool);
}

/// One chunk the platform must write to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub address: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct PairedState {
    enabled: bool,
    bonded: HashSet<String>,
    assemblers: HashMap<String, FrameBuffer>,
}

pub struct PairedTransport {
    connectivity: ConnectivityType,
    mtu: usize,
    sink: FrameSink,
    outbox: mpsc::UnboundedSender<OutboundPacket>,
    state: Mutex<PairedState>,
}

impl PairedTransport {
    /// Transport for `connectivity` starting with the adapter disabled; the
    /// platform reports the real state through the event sink.
    pub fn new(
        connectivity: ConnectivityType,
        mtu: usize,
        sink: FrameSink,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundPacket>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            connectivity,
            mtu: mtu.max(1),
            sink,
            outbox,
            state: Mutex::new(PairedState::default()),
        });
        (transport, rx)
    }

    pub fn bluetooth(sink: FrameSink) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundPacket>) {
        Self::new(ConnectivityType::BT, DEFAULT_BT_CHUNK, sink)
    }

    pub fn ble(sink: FrameSink, mtu: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundPacket>) {
        Self::new(ConnectivityType::BLE, mtu, sink)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn bonded_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.state.lock().bonded.iter().cloned().collect();
        devices.sort();
        devices
    }

    fn write(&self, address: &str, frame: &[u8]) -> Result<()> {
        for chunk in fragment(frame, self.mtu) {
            self.outbox
                .send(OutboundPacket {
                    address: address.to_string(),
                    payload: chunk,
                })
                .map_err(|_| Error::TransportUnavailable(self.connectivity))?;
        }
        Ok(())
    }
}

impl Transport for PairedTransport {
    fn connectivity(&self) -> ConnectivityType {
        self.connectivity
    }

    fn send_to(&self, target: &Endpoint, frame: Vec<u8>) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::TransportUnavailable(self.connectivity));
        }
        self.write(&target.address, &frame)
    }

    /// Paired links have no broadcast; every bonded device gets a copy.
    fn multicast(&self, frame: Vec<u8>) -> Result<()> {
        let devices = {
            let state = self.state.lock();
            if !state.enabled {
                return Err(Error::TransportUnavailable(self.connectivity));
            }
            state.bonded.iter().cloned().collect::<Vec<_>>()
        };
        for address in devices {
            self.write(&address, &frame)?;
        }
        Ok(())
    }
}

impl PlatformEventSink for PairedTransport {
    fn on_adapter_state_changed(&self, enabled: bool) {
        {
            let mut state = self.state.lock();
            if state.enabled == enabled {
                return;
            }
            state.enabled = enabled;
            if !enabled {
                state.assemblers.clear();
            }
        }
        info!(connectivity = %self.connectivity, enabled, "adapter state");
        self.sink.adapter_state(self.connectivity, enabled);
    }

    fn on_bond_state_changed(&self, address: &str, bonded: bool) {
        let mut state = self.state.lock();
        if bonded {
            state.bonded.insert(address.to_string());
        } else {
            state.bonded.remove(address);
            state.assemblers.remove(address);
        }
        debug!(connectivity = %self.connectivity, address, bonded, "bond state");
    }

    fn on_characteristic_changed(&self, address: &str, value: &[u8]) {
        let frames = {
            let mut state = self.state.lock();
            if !state.enabled {
                return;
            }
            let buffer = state.assemblers.entry(address.to_string()).or_default();
            match buffer.push(value) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(connectivity = %self.connectivity, address, error = %e, "dropping malformed stream");
                    return;
                }
            }
        };
        for frame in frames {
            self.sink
                .frame(Endpoint::new(self.connectivity, address), frame);
        }
    }

    fn on_write_complete(&self, address: &str, success: bool) {
        if success {
            debug!(connectivity = %self.connectivity, address, "write complete");
        } else {
            warn!(connectivity = %self.connectivity, address, "write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MuxEvent, TransportMultiplexer};
    use oic_core::wire::{decode_frame, encode_frame};
    use oic_core::Message;

    fn observe() -> Message {
        Message::Observe {
            token: 77,
            uri: "/a/thermostat/with/a/long/uri".into(),
        }
    }

    #[test]
    fn ble_fragments_outbound_frames() {
        let (mux, _events) = TransportMultiplexer::new();
        let (ble, mut outbox) = PairedTransport::ble(mux.frame_sink(), DEFAULT_BLE_MTU);
        let target = Endpoint::new(ConnectivityType::BLE, "AA:BB");
        assert_eq!(
            ble.send_to(&target, vec![1]),
            Err(Error::TransportUnavailable(ConnectivityType::BLE))
        );
        ble.on_adapter_state_changed(true);
        let frame = encode_frame(&observe()).unwrap();
        ble.send_to(&target, frame.clone()).unwrap();
        let mut joined = Vec::new();
        while let Ok(packet) = outbox.try_recv() {
            assert_eq!(packet.address, "AA:BB");
            assert!(packet.payload.len() <= DEFAULT_BLE_MTU);
            joined.extend(packet.payload);
        }
        assert_eq!(joined, frame);
    }

    #[test]
    fn ble_reassembles_inbound_values() {
        let (mux, mut events) = TransportMultiplexer::new();
        let (ble, _outbox) = PairedTransport::ble(mux.frame_sink(), DEFAULT_BLE_MTU);
        ble.on_adapter_state_changed(true);
        assert!(matches!(
            events.try_recv(),
            Ok(MuxEvent::AdapterState { enabled: true, .. })
        ));
        let frame = encode_frame(&observe()).unwrap();
        let chunks = fragment(&frame, 7);
        for chunk in &chunks[..chunks.len() - 1] {
            ble.on_characteristic_changed("AA:BB", chunk);
        }
        assert!(events.try_recv().is_err());
        ble.on_characteristic_changed("AA:BB", &chunks[chunks.len() - 1]);
        match events.try_recv() {
            Ok(MuxEvent::Frame(inbound)) => {
                assert_eq!(
                    inbound.source,
                    Endpoint::new(ConnectivityType::BLE, "AA:BB")
                );
                let (msg, _) = decode_frame(&inbound.payload).unwrap();
                assert_eq!(msg, observe());
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn multicast_reaches_bonded_devices() {
        let (mux, _events) = TransportMultiplexer::new();
        let (bt, mut outbox) = PairedTransport::bluetooth(mux.frame_sink());
        bt.on_adapter_state_changed(true);
        bt.on_bond_state_changed("11:22", true);
        bt.on_bond_state_changed("33:44", true);
        bt.on_bond_state_changed("33:44", false);
        bt.on_bond_state_changed("55:66", true);
        assert_eq!(bt.bonded_devices(), vec!["11:22", "55:66"]);
        bt.multicast(vec![0, 0, 0, 0]).unwrap();
        let mut targets = Vec::new();
        while let Ok(packet) = outbox.try_recv() {
            targets.push(packet.address);
        }
        targets.sort();
        assert_eq!(targets, vec!["11:22", "55:66"]);
    }

    #[test]
    fn adapter_events_are_forwarded_once() {
        let (mux, mut events) = TransportMultiplexer::new();
        let (bt, _outbox) = PairedTransport::bluetooth(mux.frame_sink());
        bt.on_adapter_state_changed(false);
        assert!(events.try_recv().is_err());
        bt.on_adapter_state_changed(true);
        bt.on_adapter_state_changed(true);
        bt.on_adapter_state_changed(false);
        let mut seen = Vec::new();
        while let Ok(MuxEvent::AdapterState { enabled, .. }) = events.try_recv() {
            seen.push(enabled);
        }
        assert_eq!(seen, vec![true, false]);
    }
}
