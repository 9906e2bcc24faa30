//! UDP/IP transport: joins the CoAP multicast group for discovery, unicast for everything else.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use oic_core::{ConnectivityType, Endpoint, Error, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{FrameSink, Transport};

/// All-CoAP-nodes IPv4 group.
pub const COAP_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);
pub const COAP_PORT: u16 = 5683;

const MAX_DATAGRAM: usize = 65_507;

enum Outbound {
    Unicast(SocketAddr, Vec<u8>),
    Multicast(Vec<u8>),
}

pub struct UdpTransport {
    outbox: mpsc::UnboundedSender<Outbound>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind on `port` (0 picks an ephemeral port), join the CoAP group and start
    /// the writer and reader tasks. Multicast sends go to the group on `multicast_port`.
    pub async fn bind(port: u16, multicast_port: u16, sink: FrameSink) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(make_multicast_socket(port)?);
        let local_addr = socket.local_addr()?;
        let (outbox, rx) = mpsc::unbounded_channel();
        tokio::spawn(send_loop(socket.clone(), rx, multicast_port));
        tokio::spawn(recv_loop(socket, sink));
        info!(%local_addr, group = %COAP_MULTICAST_GROUP, "udp transport bound");
        Ok(Arc::new(Self { outbox, local_addr }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn queue(&self, out: Outbound) -> Result<()> {
        self.outbox
            .send(out)
            .map_err(|_| Error::TransportUnavailable(ConnectivityType::IP))
    }
}

impl Transport for UdpTransport {
    fn connectivity(&self) -> ConnectivityType {
        ConnectivityType::IP
    }

    fn send_to(&self, target: &Endpoint, frame: Vec<u8>) -> Result<()> {
        let addr = parse_coap_address(&target.address)
            .ok_or_else(|| Error::InvalidEndpoint(target.address.clone()))?;
        self.queue(Outbound::Unicast(addr, frame))
    }

    fn multicast(&self, frame: Vec<u8>) -> Result<()> {
        self.queue(Outbound::Multicast(frame))
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&COAP_MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    multicast_port: u16,
) {
    let group = SocketAddr::V4(SocketAddrV4::new(COAP_MULTICAST_GROUP, multicast_port));
    while let Some(out) = rx.recv().await {
        let (dest, bytes) = match out {
            Outbound::Unicast(addr, bytes) => (addr, bytes),
            Outbound::Multicast(bytes) => (group, bytes),
        };
        if let Err(e) = socket.send_to(&bytes, dest).await {
            warn!(%dest, error = %e, "udp send failed");
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, sink: FrameSink) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                debug!(%from, len = n, "udp datagram");
                sink.frame(Endpoint::ip(coap_address(from)), buf[..n].to_vec());
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!(error = %e, "udp icmp error ignored");
            }
            Err(e) => {
                warn!(error = %e, "udp receive failed; transport down");
                sink.adapter_state(ConnectivityType::IP, false);
                return;
            }
        }
    }
}

/// `coap://ip:port` address of a socket.
pub fn coap_address(addr: SocketAddr) -> String {
    format!("coap://{addr}")
}

/// Accepts `coap://ip:port` or a bare `ip:port`.
pub fn parse_coap_address(address: &str) -> Option<SocketAddr> {
    address
        .strip_prefix("coap://")
        .unwrap_or(address)
        .trim_end_matches('/')
        .parse()
        .ok()
}
