//! Transport multiplexer: one send/receive surface over IP, Bluetooth classic and BLE,
//! with token-correlated requests that fail when their transport goes down.

pub mod memory;
pub mod paired;
pub mod udp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use oic_core::wire::{decode_frame, encode_frame};
use oic_core::{ConnectivityType, Endpoint, Error, Message, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Raw frame received by a transport.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub source: Endpoint,
    pub payload: Vec<u8>,
}

impl InboundFrame {
    /// Decode the frame's message. A datagram/reassembled frame carries exactly one message.
    pub fn decode(&self) -> Result<Message> {
        let (msg, _) = decode_frame(&self.payload)?;
        Ok(msg)
    }
}

/// Everything an engine router consumes from its multiplexer.
#[derive(Debug)]
pub enum MuxEvent {
    Frame(InboundFrame),
    AdapterState {
        connectivity: ConnectivityType,
        enabled: bool,
    },
}

pub type MuxEvents = mpsc::UnboundedReceiver<MuxEvent>;

/// Handed to each transport: pushes inbound frames and adapter changes to the owning engine.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<MuxEvent>,
}

impl FrameSink {
    pub fn frame(&self, source: Endpoint, payload: Vec<u8>) {
        let _ = self
            .tx
            .send(MuxEvent::Frame(InboundFrame { source, payload }));
    }

    pub fn adapter_state(&self, connectivity: ConnectivityType, enabled: bool) {
        let _ = self.tx.send(MuxEvent::AdapterState {
            connectivity,
            enabled,
        });
    }
}

/// One concrete transport. Sends never block: frames are queued to a writer
/// task or to the platform outbox.
pub trait Transport: Send + Sync {
    fn connectivity(&self) -> ConnectivityType;

    fn send_to(&self, target: &Endpoint, frame: Vec<u8>) -> Result<()>;

    fn multicast(&self, frame: Vec<u8>) -> Result<()>;
}

struct Slot {
    transport: Arc<dyn Transport>,
    enabled: bool,
}

struct PendingRequest {
    connectivity: ConnectivityType,
    reply: oneshot::Sender<Result<Message>>,
}

pub type ReplyReceiver = oneshot::Receiver<Result<Message>>;

pub struct TransportMultiplexer {
    slots: RwLock<HashMap<ConnectivityType, Slot>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_token: AtomicU64,
    sink: FrameSink,
}

impl TransportMultiplexer {
    /// Create a multiplexer and the event stream its owner must drain.
    pub fn new() -> (Arc<Self>, MuxEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Arc::new(Self {
            slots: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(rand::random::<u32>() as u64 + 1),
            sink: FrameSink { tx },
        });
        (mux, rx)
    }

    pub fn frame_sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Register the transport for its connectivity type, replacing any previous one.
    pub fn register(&self, transport: Arc<dyn Transport>, enabled: bool) {
        let connectivity = transport.connectivity();
        info!(%connectivity, enabled, "transport registered");
        self.slots.write().insert(
            connectivity,
            Slot {
                transport,
                enabled,
            },
        );
    }

    pub fn is_available(&self, connectivity: ConnectivityType) -> bool {
        self.slots
            .read()
            .get(&connectivity)
            .map_or(false, |s| s.enabled)
    }

    /// Union of every enabled transport.
    pub fn available(&self) -> ConnectivityType {
        self.slots
            .read()
            .iter()
            .filter(|(_, s)| s.enabled)
            .fold(ConnectivityType::empty(), |acc, (c, _)| acc | *c)
    }

    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn transport(&self, connectivity: ConnectivityType) -> Result<Arc<dyn Transport>> {
        match self.slots.read().get(&connectivity) {
            Some(slot) if slot.enabled => Ok(slot.transport.clone()),
            _ => Err(Error::TransportUnavailable(connectivity)),
        }
    }

    /// Encode and queue `msg` for `target` on the target's transport.
    pub fn send(&self, target: &Endpoint, msg: &Message) -> Result<()> {
        let transport = self.transport(target.connectivity)?;
        let frame = encode_frame(msg)?;
        debug!(kind = msg.kind(), token = msg.token(), to = %target, "send");
        transport.send_to(target, frame)
    }

    /// Encode and multicast `msg` on one transport.
    pub fn multicast(&self, connectivity: ConnectivityType, msg: &Message) -> Result<()> {
        let transport = self.transport(connectivity)?;
        let frame = encode_frame(msg)?;
        debug!(kind = msg.kind(), token = msg.token(), %connectivity, "multicast");
        transport.multicast(frame)
    }

    /// Send a request and register for the response carrying the same token.
    pub fn request(&self, target: &Endpoint, msg: &Message) -> Result<ReplyReceiver> {
        let token = msg.token();
        let (reply, rx) = oneshot::channel();
        self.pending.lock().insert(
            token,
            PendingRequest {
                connectivity: target.connectivity,
                reply,
            },
        );
        if let Err(e) = self.send(target, msg) {
            self.pending.lock().remove(&token);
            return Err(e);
        }
        Ok(rx)
    }

    /// Drop a pending request (e.g. after a timeout). Returns false if it already completed.
    pub fn cancel_request(&self, token: u64) -> bool {
        self.pending.lock().remove(&token).is_some()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Complete a pending request with `msg`. Returns the message back when it
    /// answers no pending request, so the caller can route it elsewhere.
    pub fn complete(&self, msg: Message) -> Option<Message> {
        if !msg.is_request_response() {
            return Some(msg);
        }
        match self.pending.lock().remove(&msg.token()) {
            Some(pending) => {
                let _ = pending.reply.send(Ok(msg));
                None
            }
            None => Some(msg),
        }
    }

    /// Apply an adapter state change. A transport going down fails every
    /// request pending on it with `TransportUnavailable`. Returns true if the state changed.
    pub fn apply_adapter_state(&self, connectivity: ConnectivityType, enabled: bool) -> bool {
        {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get_mut(&connectivity) else {
                return false;
            };
            if slot.enabled == enabled {
                return false;
            }
            slot.enabled = enabled;
        }
        info!(%connectivity, enabled, "adapter state changed");
        if !enabled {
            let failed: Vec<PendingRequest> = {
                let mut pending = self.pending.lock();
                let tokens: Vec<u64> = pending
                    .iter()
                    .filter(|(_, p)| p.connectivity == connectivity)
                    .map(|(t, _)| *t)
                    .collect();
                tokens
                    .into_iter()
                    .filter_map(|t| pending.remove(&t))
                    .collect()
            };
            for p in failed {
                let _ = p.reply.send(Err(Error::TransportUnavailable(connectivity)));
            }
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use oic_core::AttributeMap;

    /// Transport that records what it was asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub connectivity: Option<ConnectivityType>,
        pub sent: Mutex<Vec<(Option<Endpoint>, Vec<u8>)>>,
    }

    impl Transport for RecordingTransport {
        fn connectivity(&self) -> ConnectivityType {
            self.connectivity.unwrap_or(ConnectivityType::IP)
        }

        fn send_to(&self, target: &Endpoint, frame: Vec<u8>) -> Result<()> {
            self.sent.lock().push((Some(target.clone()), frame));
            Ok(())
        }

        fn multicast(&self, frame: Vec<u8>) -> Result<()> {
            self.sent.lock().push((None, frame));
            Ok(())
        }
    }

    fn get(token: u64) -> Message {
        Message::GetAttributes {
            token,
            uri: "/a/light".into(),
        }
    }

    #[test]
    fn send_requires_enabled_transport() {
        let (mux, _events) = TransportMultiplexer::new();
        let target = Endpoint::ip("coap://10.0.0.5:5683");
        assert_eq!(
            mux.send(&target, &get(1)),
            Err(Error::TransportUnavailable(ConnectivityType::IP))
        );
        let t = Arc::new(RecordingTransport::default());
        mux.register(t.clone(), false);
        assert!(mux.send(&target, &get(1)).is_err());
        assert!(mux.apply_adapter_state(ConnectivityType::IP, true));
        assert!(!mux.apply_adapter_state(ConnectivityType::IP, true));
        mux.send(&target, &get(1)).unwrap();
        mux.multicast(ConnectivityType::IP, &get(2)).unwrap();
        let sent = t.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0.as_ref(), Some(&target));
        assert!(sent[1].0.is_none());
        let (msg, _) = decode_frame(&sent[0].1).unwrap();
        assert_eq!(msg, get(1));
    }

    #[test]
    fn available_is_union_of_enabled() {
        let (mux, _events) = TransportMultiplexer::new();
        mux.register(Arc::new(RecordingTransport::default()), true);
        mux.register(
            Arc::new(RecordingTransport {
                connectivity: Some(ConnectivityType::BLE),
                ..Default::default()
            }),
            false,
        );
        assert_eq!(mux.available(), ConnectivityType::IP);
        mux.apply_adapter_state(ConnectivityType::BLE, true);
        assert_eq!(
            mux.available(),
            ConnectivityType::IP | ConnectivityType::BLE
        );
    }

    #[tokio::test]
    async fn response_completes_pending_request() {
        let (mux, _events) = TransportMultiplexer::new();
        mux.register(Arc::new(RecordingTransport::default()), true);
        let token = mux.next_token();
        let rx = mux
            .request(&Endpoint::ip("coap://10.0.0.5:5683"), &get(token))
            .unwrap();
        assert_eq!(mux.pending_requests(), 1);
        let response = Message::GetResponse {
            token,
            result: Ok(AttributeMap::new()),
        };
        assert!(mux.complete(response.clone()).is_none());
        assert_eq!(rx.await.unwrap(), Ok(response));
        // Unknown token and non-response messages are handed back.
        assert!(mux.complete(get(token)).is_some());
        assert!(mux
            .complete(Message::GetResponse {
                token: token + 100,
                result: Ok(AttributeMap::new()),
            })
            .is_some());
    }

    #[tokio::test]
    async fn adapter_down_fails_only_its_requests() {
        let (mux, _events) = TransportMultiplexer::new();
        mux.register(Arc::new(RecordingTransport::default()), true);
        mux.register(
            Arc::new(RecordingTransport {
                connectivity: Some(ConnectivityType::BLE),
                ..Default::default()
            }),
            true,
        );
        let ip = mux
            .request(&Endpoint::ip("coap://10.0.0.5:5683"), &get(10))
            .unwrap();
        let ble = mux
            .request(
                &Endpoint::new(ConnectivityType::BLE, "AA:BB:CC:DD:EE:FF"),
                &get(11),
            )
            .unwrap();
        assert!(mux.apply_adapter_state(ConnectivityType::BLE, false));
        assert_eq!(
            ble.await.unwrap(),
            Err(Error::TransportUnavailable(ConnectivityType::BLE))
        );
        assert_eq!(mux.pending_requests(), 1);
        assert!(mux.cancel_request(10));
        assert!(ip.await.is_err());
    }

    #[test]
    fn tokens_increase() {
        let (mux, _events) = TransportMultiplexer::new();
        let a = mux.next_token();
        let b = mux.next_token();
        assert!(b > a);
    }
}
