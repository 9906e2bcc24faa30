//! Discovery sessions: multicast a query on each requested transport and stream
//! de-duplicated descriptors until timeout or cancel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use oic_core::protocol::PROTOCOL_VERSION;
use oic_core::{
    ConnectivityType, DiscoveryQuery, DiscoverySession, Endpoint, Error, Message,
    ResourceDescriptor, ResourceRecord, Result,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::TransportMultiplexer;

struct DiscoveryReply {
    source: Endpoint,
    device_id: Uuid,
    resources: Vec<ResourceRecord>,
}

type SessionTable = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<DiscoveryReply>>>>;

/// Routes discovery responses to the session whose token they echo.
pub struct DiscoveryEngine {
    sessions: SessionTable,
    runtime: Handle,
}

impl DiscoveryEngine {
    pub fn new(runtime: Handle) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            runtime,
        }
    }

    /// Start a session. Fails synchronously on a malformed query, or with
    /// `NoTransportAvailable` when no requested transport accepted the query.
    pub fn discover(
        &self,
        mux: &TransportMultiplexer,
        query: &str,
        connectivity: ConnectivityType,
        timeout: Duration,
    ) -> Result<DiscoveryHandle> {
        let query = DiscoveryQuery::parse(query)?;
        let token = mux.next_token();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.sessions.lock().insert(token, reply_tx);

        let request = Message::DiscoveryRequest {
            protocol_version: PROTOCOL_VERSION,
            token,
            query: query.to_query_string(),
        };
        let mut sent = 0usize;
        for ct in connectivity.iter() {
            if !mux.is_available(ct) {
                debug!(connectivity = %ct, "skipping unavailable transport");
                continue;
            }
            match mux.multicast(ct, &request) {
                Ok(()) => sent += 1,
                Err(e) => warn!(connectivity = %ct, error = %e, "discovery send failed"),
            }
        }
        if sent == 0 {
            self.sessions.lock().remove(&token);
            return Err(Error::NoTransportAvailable(connectivity));
        }
        info!(token, query = %request_query(&request), %connectivity, "discovery started");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.runtime.spawn(run_session(
            token,
            DiscoverySession::new(query),
            timeout,
            reply_rx,
            cancel_rx,
            out_tx,
            self.sessions.clone(),
        ));
        Ok(DiscoveryHandle {
            token,
            results: out_rx,
            cancel: cancel_tx,
            cancelled: false,
        })
    }

    /// Hand a discovery response to its session. Any other message is returned to the caller.
    pub fn route(&self, source: &Endpoint, msg: Message) -> Option<Message> {
        let Message::DiscoveryResponse {
            protocol_version,
            token,
            device_id,
            resources,
        } = msg
        else {
            return Some(msg);
        };
        if protocol_version != PROTOCOL_VERSION {
            warn!(%source, protocol_version, "discovery response with unsupported version");
            return None;
        }
        match self.sessions.lock().get(&token) {
            Some(session) => {
                let _ = session.send(DiscoveryReply {
                    source: source.clone(),
                    device_id,
                    resources,
                });
            }
            None => debug!(token, %source, "discovery response for closed session"),
        }
        None
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn request_query(msg: &Message) -> &str {
    match msg {
        Message::DiscoveryRequest { query, .. } => query,
        _ => "",
    }
}

async fn run_session(
    token: u64,
    mut session: DiscoverySession,
    timeout: Duration,
    mut replies: mpsc::UnboundedReceiver<DiscoveryReply>,
    mut cancel: watch::Receiver<bool>,
    out: mpsc::UnboundedSender<ResourceDescriptor>,
    sessions: SessionTable,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = cancel.changed() => break,
            reply = replies.recv() => {
                let Some(reply) = reply else { break };
                for record in reply.resources {
                    if !session.query().matches(&record) {
                        debug!(token, source = %reply.source, uri = %record.uri, "record outside query dropped");
                        continue;
                    }
                    match session.accept(record, &reply.source, reply.device_id) {
                        Ok(Some(descriptor)) => {
                            if out.send(descriptor).is_err() {
                                break;
                            }
                        }
                        Ok(None) => debug!(token, source = %reply.source, "duplicate resource dropped"),
                        Err(e) => warn!(token, source = %reply.source, error = %e, "dropping record"),
                    }
                }
                if out.is_closed() {
                    break;
                }
            }
        }
    }
    sessions.lock().remove(&token);
    info!(token, delivered = session.delivered(), "discovery finished");
}

/// Lazy, finite stream of discovered resources. Ends on timeout or [`cancel`](Self::cancel).
pub struct DiscoveryHandle {
    token: u64,
    results: mpsc::UnboundedReceiver<ResourceDescriptor>,
    cancel: watch::Sender<bool>,
    cancelled: bool,
}

impl DiscoveryHandle {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Next descriptor, or `None` once the session has ended.
    pub async fn next(&mut self) -> Option<ResourceDescriptor> {
        if self.cancelled {
            return None;
        }
        self.results.recv().await
    }

    /// Stop the session. Descriptors already buffered are discarded.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        let _ = self.cancel.send(true);
        self.results.close();
    }

    /// Drain the session until it ends.
    pub async fn collect(mut self) -> Vec<ResourceDescriptor> {
        let mut out = Vec::new();
        while let Some(d) = self.next().await {
            out.push(d);
        }
        out
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}
