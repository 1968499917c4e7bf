pub mod client_connection;
pub mod message_handlers;

use std::fmt;

use atp_client_api_messages::MessageType;
use bytes::Bytes;
use uuid::Uuid;

pub use client_connection::{ClientConnectionSender, ClientRegistry, ConnectionCounters, ReplyMessage};

/// Identity of a connected client actor: the transport-level node id
/// plus a per-process connection ordinal.
#[derive(PartialEq, Eq, Clone, Copy, Hash, Debug)]
pub struct ClientActorId {
    pub identity: Uuid,
    pub name: u64,
}

impl fmt::Display for ClientActorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClientActorId({}/{})", self.identity, self.name)
    }
}

/// One framed datagram as handed over by the transport: the type tag
/// and the undecoded body.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub message_type: MessageType,
    pub payload: Bytes,
}
