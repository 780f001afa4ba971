use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Routing header shared by every outbound message kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: String,
    pub source: String,
    pub destination: String,
}

impl MessageHeader {
    pub fn new(
        message_id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn counterparties(&self) -> CounterpartyKey {
        CounterpartyKey {
            source: self.source.clone(),
            destination: self.destination.clone(),
        }
    }
}

/// The (source, destination) pair a replay is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterpartyKey {
    pub source: String,
    pub destination: String,
}

impl Display for CounterpartyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.source, self.destination)
    }
}

/// Messages the outbound pipeline knows how to send.
///
/// Only `Authenticated` messages are point-to-point with delivery acknowledgement and
/// therefore tracked until acked. `Unauthenticated` ones are fire-and-forget and pass
/// through the tracker untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Authenticated {
        header: MessageHeader,
        payload: Bytes,
    },
    Unauthenticated {
        header: MessageHeader,
        payload: Bytes,
    },
}

impl OutboundMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            OutboundMessage::Authenticated { header, .. }
            | OutboundMessage::Unauthenticated { header, .. } => header,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.header().message_id
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            OutboundMessage::Authenticated { payload, .. }
            | OutboundMessage::Unauthenticated { payload, .. } => payload,
        }
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, OutboundMessage::Authenticated { .. })
    }

    /// Bytes this message pins in memory, used for the cache size bound.
    pub fn approximate_size(&self) -> usize {
        let header = self.header();
        self.payload().len()
            + header.message_id.len()
            + header.source.len()
            + header.destination.len()
    }
}

/// Delivery acknowledgement received from the counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub message_id: String,
}

impl AckMessage {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
        }
    }
}
