//! # Error Types
//!
//! This module defines the error types used throughout the crate, from structural
//! state machine faults to broker refusals and RPC protocol violations.

/// The primary error enum of the crate.
///
/// Every fallible operation in the state machine engine, the pipeline and the
/// policies returns this type, so a single application handler can inspect all
/// faults that surface as `Error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An argument was empty, too long or otherwise unusable.
    InvalidArgument,
    /// The request is not accepted in the current state (for example after a fault).
    InvalidState,
    /// A transition was requested between states that are not peers, parent and child,
    /// or child and parent.
    InvalidTransition,
    /// The pipeline was posted to while a dispatch on it was still running.
    Reentrant,
    /// A pending request table is at capacity.
    RegistryFull,
    /// The correlation id is already pending in the same table.
    DuplicateCorrelationId,
    /// No entry, policy or timer matched the request.
    NotFound,
    /// A fixed-capacity buffer could not hold the value.
    BufferTooSmall,
    /// A collaborator (platform or transport) was not wired in.
    DependencyNotProvided,
    /// The MQTT transport failed to perform an operation.
    Transport,
    /// A message violated the RPC wire contract.
    Protocol(ProtocolError),
    /// The broker refused the connection and the refusal is not retried.
    ConnectionRefused(ConnectReasonCode),
    /// Both credential sets were rejected more often than allowed.
    CredentialsRejected,
    /// The connection retry budget is used up.
    RetriesExhausted,
    /// The broker rejected a subscription.
    SubscribeRejected,
    /// A wait guarded by a timer expired.
    Timeout,
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

/// Enumerates violations of the RPC message contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// The message carries no correlation data property.
    MissingCorrelationData,
    /// A request carries no response topic property.
    MissingResponseTopic,
    /// A request carries no content type property.
    MissingContentType,
    /// A response carries no `status` user property.
    MissingStatus,
    /// The `status` user property is not a known numeric status.
    InvalidStatus,
    /// A successful response carries no payload.
    EmptyPayload,
    /// A topic does not have the expected command topic shape.
    MalformedTopic,
}

impl ProtocolError {
    /// Short description, used as the status message of `400` responses.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCorrelationData => "missing correlation data",
            Self::MissingResponseTopic => "missing response topic",
            Self::MissingContentType => "missing content type",
            Self::MissingStatus => "missing status",
            Self::InvalidStatus => "invalid status",
            Self::EmptyPayload => "empty payload",
            Self::MalformedTopic => "malformed command topic",
        }
    }
}

/// Broad classification of a connection failure, used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FailureClass {
    /// The network path failed; retried with backoff.
    Network,
    /// The broker reported a transient condition; retried with backoff.
    Service,
    /// The credentials were rejected; retried with the other credential set.
    Security,
    /// The broker refused for a reason retrying cannot fix.
    Permanent,
}

/// Represents the MQTT 5 reason codes of a connection acknowledgment (`CONNACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    Success = 0x00,
    /// The broker did not specify a reason.
    UnspecifiedError = 0x80,
    /// The CONNECT packet could not be parsed.
    MalformedPacket = 0x81,
    /// The CONNECT packet violated the protocol.
    ProtocolError = 0x82,
    /// The broker rejected the connection for an implementation specific reason.
    ImplementationSpecificError = 0x83,
    /// The broker does not support the requested MQTT protocol version.
    UnsupportedProtocolVersion = 0x84,
    /// The client identifier is not valid.
    ClientIdentifierNotValid = 0x85,
    /// The username or password is not valid.
    BadUserNameOrPassword = 0x86,
    /// The client is not authorized to connect.
    NotAuthorized = 0x87,
    /// The broker is unavailable.
    ServerUnavailable = 0x88,
    /// The broker is busy.
    ServerBusy = 0x89,
    /// The client has been banned.
    Banned = 0x8A,
    /// The authentication method is not supported or does not match.
    BadAuthenticationMethod = 0x8C,
    /// An implementation or administrative quota was exceeded.
    QuotaExceeded = 0x97,
    /// The client connected too often.
    ConnectionRateExceeded = 0x9F,
    /// A reason code this crate does not name.
    Other(u8),
}

impl From<u8> for ConnectReasonCode {
    fn from(val: u8) -> Self {
        match val {
            0x00 => Self::Success,
            0x80 => Self::UnspecifiedError,
            0x81 => Self::MalformedPacket,
            0x82 => Self::ProtocolError,
            0x83 => Self::ImplementationSpecificError,
            0x84 => Self::UnsupportedProtocolVersion,
            0x85 => Self::ClientIdentifierNotValid,
            0x86 => Self::BadUserNameOrPassword,
            0x87 => Self::NotAuthorized,
            0x88 => Self::ServerUnavailable,
            0x89 => Self::ServerBusy,
            0x8A => Self::Banned,
            0x8C => Self::BadAuthenticationMethod,
            0x97 => Self::QuotaExceeded,
            0x9F => Self::ConnectionRateExceeded,
            _ => Self::Other(val),
        }
    }
}

impl ConnectReasonCode {
    /// Returns `true` if the broker accepted the connection.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Classifies a refusal. Returns `None` for [`ConnectReasonCode::Success`].
    pub fn failure_class(self) -> Option<FailureClass> {
        let class = match self {
            Self::Success => return None,
            Self::BadUserNameOrPassword | Self::NotAuthorized | Self::BadAuthenticationMethod => {
                FailureClass::Security
            }
            Self::UnspecifiedError
            | Self::ImplementationSpecificError
            | Self::ServerUnavailable
            | Self::ServerBusy
            | Self::QuotaExceeded
            | Self::ConnectionRateExceeded => FailureClass::Service,
            Self::MalformedPacket
            | Self::ProtocolError
            | Self::UnsupportedProtocolVersion
            | Self::ClientIdentifierNotValid
            | Self::Banned
            | Self::Other(_) => FailureClass::Permanent,
        };
        Some(class)
    }
}
