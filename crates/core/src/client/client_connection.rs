use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use atp_client_api_messages::MessageType;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use super::ClientActorId;

/// A reply on its way back to the transport.
#[derive(Clone, Debug)]
pub struct ReplyMessage {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl ReplyMessage {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }
}

/// Transport counters for one connection. The transport glue bumps the
/// receive side; the reply path bumps the send side; the stats reporter
/// samples both.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    last_heard_ms: AtomicU64,
}

/// Point-in-time copy of [`ConnectionCounters`], in the shape the stats
/// sink serializes.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ConnectionSample {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub last_heard_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

impl ConnectionCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Relaxed);
        self.last_heard_ms.store(now_ms(), Relaxed);
    }

    pub fn sample(&self) -> ConnectionSample {
        ConnectionSample {
            packets_sent: self.packets_sent.load(Relaxed),
            bytes_sent: self.bytes_sent.load(Relaxed),
            packets_received: self.packets_received.load(Relaxed),
            bytes_received: self.bytes_received.load(Relaxed),
            last_heard_ms: self.last_heard_ms.load(Relaxed),
        }
    }
}

/// Cheap-to-clone handle for pushing replies at one client. The
/// transport owns the receiving end and writes each [`ReplyMessage`]
/// out as a framed datagram.
#[derive(Clone, Debug)]
pub struct ClientConnectionSender {
    pub id: ClientActorId,
    sendtx: mpsc::UnboundedSender<ReplyMessage>,
    counters: Arc<ConnectionCounters>,
}

impl ClientConnectionSender {
    pub fn new(id: ClientActorId, sendtx: mpsc::UnboundedSender<ReplyMessage>) -> Self {
        Self {
            id,
            sendtx,
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    /// Construct a sender along with the receiving end of its channel,
    /// for tests and in-process callers.
    pub fn dummy_with_channel(id: ClientActorId) -> (Self, mpsc::UnboundedReceiver<ReplyMessage>) {
        let (sendtx, rx) = mpsc::unbounded_channel();
        (Self::new(id, sendtx), rx)
    }

    /// Queue a reply. A closed channel just means the client is gone;
    /// the datagram would have been lost on the wire the same way.
    pub fn send(&self, message: ReplyMessage) {
        self.counters.record_sent(message.payload.len());
        if self.sendtx.send(message).is_err() {
            log::debug!("Dropping reply to disconnected client {}", self.id);
        }
    }

    pub fn counters(&self) -> &Arc<ConnectionCounters> {
        &self.counters
    }
}

/// The set of live connections, shared between the transport glue
/// (which registers and unregisters) and the stats reporter (which
/// samples).
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientActorId, ClientConnectionSender>>,
}

impl ClientRegistry {
    pub fn add(&self, sender: ClientConnectionSender) {
        self.clients.lock().unwrap().insert(sender.id, sender);
    }

    pub fn remove(&self, id: &ClientActorId) {
        self.clients.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_all(&self) -> Vec<(ClientActorId, ConnectionSample)> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .map(|(id, sender)| (*id, sender.counters.sample()))
            .collect()
    }
}
