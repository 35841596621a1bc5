//! # Command RPC over MQTT 5
//!
//! A command invocation is a publish on the executor's command topic carrying a
//! correlation id, a response topic and a content type as message properties. The
//! executor answers on the response topic with the same correlation data and a
//! numeric `status` user property. Failed responses add a `statusMessage` user
//! property and an empty payload; successful ones carry a content type and a payload.
//!
//! [`RpcServer`] is the executor side and [`RpcClient`] the invoker side. Both are
//! pipeline policies that keep their in-flight requests in a [`PendingRegistry`].

mod client;
mod registry;
mod server;

use core::cell::Cell;
use core::fmt;

use embassy_time::{Duration, Instant};

pub use client::{ClientRequest, RpcClient, RpcClientOptions, State as ClientState};
pub use registry::{CorrelationId, Detached, Pending, PendingRegistry};
pub use server::{RpcServer, RpcServerOptions, ServerCommand, State as ServerState};

use crate::error::ProtocolError;
use crate::packet::PacketId;

/// Maximum length of a correlation id.
pub const MAX_CORRELATION_ID_LEN: usize = 16;

/// Maximum length of a content type.
pub const MAX_CONTENT_TYPE_LEN: usize = 32;

/// Maximum length of a command name.
pub const MAX_COMMAND_NAME_LEN: usize = 32;

/// User property carrying the numeric status of a response.
pub const STATUS_PROPERTY: &str = "status";

/// User property carrying the error text of a failed response.
pub const STATUS_MESSAGE_PROPERTY: &str = "statusMessage";

/// Result code of a command, modelled on HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum RpcStatus {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    NotAllowed = 405,
    Conflict = 409,
    PreconditionFailed = 412,
    RequestTooLarge = 413,
    UnsupportedType = 415,
    Throttled = 429,
    ClientClosed = 499,
    ServerError = 500,
    BadGateway = 502,
    ServiceUnavailable = 503,
    Timeout = 504,
}

impl RpcStatus {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let status = match code {
            200 => Self::Ok,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            405 => Self::NotAllowed,
            409 => Self::Conflict,
            412 => Self::PreconditionFailed,
            413 => Self::RequestTooLarge,
            415 => Self::UnsupportedType,
            429 => Self::Throttled,
            499 => Self::ClientClosed,
            500 => Self::ServerError,
            502 => Self::BadGateway,
            503 => Self::ServiceUnavailable,
            504 => Self::Timeout,
            _ => return None,
        };
        Some(status)
    }

    /// Parses the decimal form carried in the `status` user property.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        value
            .trim()
            .parse::<u16>()
            .ok()
            .and_then(Self::from_code)
            .ok_or(ProtocolError::InvalidStatus)
    }

    /// The decimal form carried in the `status` user property.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "200",
            Self::BadRequest => "400",
            Self::Unauthorized => "401",
            Self::Forbidden => "403",
            Self::NotFound => "404",
            Self::NotAllowed => "405",
            Self::Conflict => "409",
            Self::PreconditionFailed => "412",
            Self::RequestTooLarge => "413",
            Self::UnsupportedType => "415",
            Self::Throttled => "429",
            Self::ClientClosed => "499",
            Self::ServerError => "500",
            Self::BadGateway => "502",
            Self::ServiceUnavailable => "503",
            Self::Timeout => "504",
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Ok
    }

    /// Whether the invoker may send the same request again.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Throttled
                | Self::ServerError
                | Self::BadGateway
                | Self::ServiceUnavailable
                | Self::Timeout
        )
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command request delivered to the application by the [`RpcServer`].
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    pub correlation_id: &'a [u8],
    pub response_topic: &'a str,
    pub request_topic: &'a str,
    pub content_type: &'a str,
    pub payload: &'a [u8],
    pub command_name: &'a str,
    /// When the server gives up and answers with [`RpcStatus::Timeout`].
    pub deadline: Instant,
}

/// The application's answer to a [`CommandRequest`].
#[derive(Debug, Clone, Copy)]
pub struct CommandResponse<'a> {
    pub correlation_id: &'a [u8],
    pub status: RpcStatus,
    pub payload: &'a [u8],
    /// Content type of a successful payload.
    pub content_type: Option<&'a str>,
    /// Error text of a failed command.
    pub error_message: Option<&'a str>,
}

impl<'a> CommandResponse<'a> {
    pub fn success(correlation_id: &'a [u8], content_type: &'a str, payload: &'a [u8]) -> Self {
        Self {
            correlation_id,
            status: RpcStatus::Ok,
            payload,
            content_type: Some(content_type),
            error_message: None,
        }
    }

    pub fn failure(correlation_id: &'a [u8], status: RpcStatus, message: &'a str) -> Self {
        Self {
            correlation_id,
            status,
            payload: &[],
            content_type: None,
            error_message: Some(message),
        }
    }
}

/// A command invocation handed to the [`RpcClient`].
///
/// `message_id` is filled in with the packet id of the request publish.
#[derive(Debug)]
pub struct InvokeRequest<'a> {
    pub command_name: &'a str,
    pub correlation_id: &'a [u8],
    pub content_type: &'a str,
    pub payload: &'a [u8],
    /// Overrides the client's default request timeout.
    pub timeout: Option<Duration>,
    pub message_id: Cell<Option<PacketId>>,
}

impl<'a> InvokeRequest<'a> {
    pub fn new(
        command_name: &'a str,
        correlation_id: &'a [u8],
        content_type: &'a str,
        payload: &'a [u8],
    ) -> Self {
        Self {
            command_name,
            correlation_id,
            content_type,
            payload,
            timeout: None,
            message_id: Cell::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A response delivered to the application by the [`RpcClient`].
///
/// Responses that violate the wire contract are still delivered, with
/// `protocol_error` set and `status` possibly missing.
#[derive(Debug, Clone, Copy)]
pub struct InvokeResponse<'a> {
    pub command_name: &'a str,
    pub correlation_id: &'a [u8],
    pub status: Option<RpcStatus>,
    pub payload: &'a [u8],
    pub content_type: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub protocol_error: Option<ProtocolError>,
}

impl InvokeResponse<'_> {
    /// A response with a success status and no protocol error.
    pub fn is_success(&self) -> bool {
        self.protocol_error.is_none() && self.status.is_some_and(RpcStatus::is_success)
    }
}
