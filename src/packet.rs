//! # MQTT Packet Data
//!
//! Borrowed views of the MQTT 5 control packets that travel through the event
//! pipeline. Requests flow outbound to the [`MqttTransport`](crate::transport::MqttTransport),
//! notifications flow inbound from it. Wire encoding is left to the transport.

use core::cell::Cell;
use core::fmt;

use crate::error::{ConnectReasonCode, FailureClass};

/// Identifier the transport assigns to a publish, subscribe or unsubscribe.
pub type PacketId = u16;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// The MQTT 5 message properties the RPC protocol relies on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Properties<'a> {
    pub correlation_data: Option<&'a [u8]>,
    pub response_topic: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub user_properties: &'a [(&'a str, &'a str)],
}

impl<'a> Properties<'a> {
    /// Returns the value of the first user property named `key`.
    pub fn user_property(&self, key: &str) -> Option<&'a str> {
        self.user_properties
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| *value)
    }
}

/// One set of connection secrets.
#[derive(Clone, Copy, Default)]
pub struct Credential<'a> {
    pub certificate: &'a [u8],
    pub private_key: &'a [u8],
    pub password: Option<&'a str>,
}

impl fmt::Debug for Credential<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("certificate", &self.certificate.len())
            .field("private_key", &"..")
            .field("password", &self.password.map(|_| ".."))
            .finish()
    }
}

// --- CONNECT ---
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub host: &'a str,
    pub port: u16,
    pub client_id: &'a str,
    pub username: &'a str,
    pub credential: Credential<'a>,
    pub keep_alive_secs: u16,
    pub clean_start: bool,
}

// --- CONNACK ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: ConnectReasonCode,
}

// --- DISCONNECT notification ---
/// Why the transport reports the session as closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// The client asked for the disconnect.
    Requested,
    /// The network connection dropped or could not be opened.
    Network,
    /// The TLS handshake or client authentication failed.
    Security,
    /// The broker sent a DISCONNECT with this reason code.
    Server(u8),
}

impl DisconnectReason {
    /// Classifies the disconnect. Returns `None` for a requested disconnect.
    pub fn failure_class(self) -> Option<FailureClass> {
        match self {
            Self::Requested => None,
            Self::Network => Some(FailureClass::Network),
            Self::Security => Some(FailureClass::Security),
            Self::Server(0x87) => Some(FailureClass::Security),
            Self::Server(0x89 | 0x8B | 0x97 | 0x9F) => Some(FailureClass::Service),
            Self::Server(_) => Some(FailureClass::Network),
        }
    }
}

// --- PUBLISH (outbound) ---
/// A publish handed to the transport.
///
/// `out_id` is filled in with the packet id the transport assigned.
#[derive(Debug)]
pub struct PublishRequest<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties<'a>,
    pub out_id: Cell<Option<PacketId>>,
}

impl<'a> PublishRequest<'a> {
    pub fn new(topic: &'a str, payload: &'a [u8], qos: QoS) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain: false,
            properties: Properties::default(),
            out_id: Cell::new(None),
        }
    }

    pub fn with_properties(mut self, properties: Properties<'a>) -> Self {
        self.properties = properties;
        self
    }
}

// --- PUBLISH (inbound) ---
#[derive(Debug, Clone, Copy)]
pub struct ReceivedPublish<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub packet_id: Option<PacketId>,
    pub properties: Properties<'a>,
}

// --- SUBSCRIBE / UNSUBSCRIBE ---
#[derive(Debug)]
pub struct SubscribeRequest<'a> {
    pub topic_filter: &'a str,
    pub qos: QoS,
    pub out_id: Cell<Option<PacketId>>,
}

impl<'a> SubscribeRequest<'a> {
    pub fn new(topic_filter: &'a str, qos: QoS) -> Self {
        Self {
            topic_filter,
            qos,
            out_id: Cell::new(None),
        }
    }
}

#[derive(Debug)]
pub struct UnsubscribeRequest<'a> {
    pub topic_filter: &'a str,
    pub out_id: Cell<Option<PacketId>>,
}

impl<'a> UnsubscribeRequest<'a> {
    pub fn new(topic_filter: &'a str) -> Self {
        Self {
            topic_filter,
            out_id: Cell::new(None),
        }
    }
}

// --- SUBACK ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubAck {
    pub packet_id: PacketId,
    pub reason_code: u8,
}

impl SubAck {
    /// Granted QoS codes are below `0x80`; everything else is a refusal.
    pub fn is_success(&self) -> bool {
        self.reason_code < 0x80
    }
}
