//! # Pipeline Events
//!
//! Every value that travels through the [`Pipeline`](crate::pipeline::Pipeline) is an
//! [`Event`]. Payloads are borrowed for the duration of one dispatch: the sender keeps
//! them alive until the receiving handler returns, and a policy that needs the data
//! later copies it into its own bounded storage.

use crate::error::Error;
use crate::packet::{
    ConnAck, ConnectRequest, DisconnectReason, PacketId, PublishRequest, ReceivedPublish, SubAck,
    SubscribeRequest, UnsubscribeRequest,
};
use crate::platform::TimerId;
use crate::rpc::{CommandRequest, CommandResponse, InvokeRequest, InvokeResponse};

/// An event routed through the pipeline.
///
/// Variants ending in `Req` are requests (normally outbound), the rest are
/// notifications (normally inbound).
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// A timer created by the receiving policy expired.
    Timeout(TimerId),
    /// A dispatch failed; see [`ErrorEvent`].
    Error(&'a ErrorEvent<'a>),
    /// Drives one iteration of the synchronous pipeline.
    ProcessLoop,

    // Transport requests.
    ConnectReq(&'a ConnectRequest<'a>),
    DisconnectReq,
    PublishReq(&'a PublishRequest<'a>),
    SubscribeReq(&'a SubscribeRequest<'a>),
    UnsubscribeReq(&'a UnsubscribeRequest<'a>),

    // Transport notifications.
    ConnAck(ConnAck),
    Disconnected(DisconnectReason),
    PubAck(PacketId),
    SubAck(SubAck),
    UnsubAck(PacketId),
    PublishReceived(&'a ReceivedPublish<'a>),

    // Connection lifecycle requests.
    ConnectionOpenReq,
    ConnectionCloseReq,

    /// Subscribes the RPC server for the named command, or every server on `None`.
    RpcServerRegisterReq(Option<&'a str>),
    /// A command request the application should execute.
    RpcServerExecuteReq(&'a CommandRequest<'a>),
    /// The application finished a command.
    RpcServerExecuteRsp(&'a CommandResponse<'a>),

    /// Subscribes the RPC client for the named command, or every client on `None`.
    RpcClientSubscribeReq(Option<&'a str>),
    /// Unsubscribes the RPC client for the named command, or every client on `None`.
    RpcClientUnsubscribeReq(Option<&'a str>),
    RpcClientInvokeReq(&'a InvokeRequest<'a>),
    /// The RPC client for the named command is subscribed and accepts invocations.
    RpcClientReady(&'a str),
    RpcClientResponse(&'a InvokeResponse<'a>),
}

/// Payload-free discriminant of an [`Event`], used for logging and error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    Timeout,
    Error,
    ProcessLoop,
    ConnectReq,
    DisconnectReq,
    PublishReq,
    SubscribeReq,
    UnsubscribeReq,
    ConnAck,
    Disconnected,
    PubAck,
    SubAck,
    UnsubAck,
    PublishReceived,
    ConnectionOpenReq,
    ConnectionCloseReq,
    RpcServerRegisterReq,
    RpcServerExecuteReq,
    RpcServerExecuteRsp,
    RpcClientSubscribeReq,
    RpcClientUnsubscribeReq,
    RpcClientInvokeReq,
    RpcClientReady,
    RpcClientResponse,
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Timeout(_) => EventKind::Timeout,
            Event::Error(_) => EventKind::Error,
            Event::ProcessLoop => EventKind::ProcessLoop,
            Event::ConnectReq(_) => EventKind::ConnectReq,
            Event::DisconnectReq => EventKind::DisconnectReq,
            Event::PublishReq(_) => EventKind::PublishReq,
            Event::SubscribeReq(_) => EventKind::SubscribeReq,
            Event::UnsubscribeReq(_) => EventKind::UnsubscribeReq,
            Event::ConnAck(_) => EventKind::ConnAck,
            Event::Disconnected(_) => EventKind::Disconnected,
            Event::PubAck(_) => EventKind::PubAck,
            Event::SubAck(_) => EventKind::SubAck,
            Event::UnsubAck(_) => EventKind::UnsubAck,
            Event::PublishReceived(_) => EventKind::PublishReceived,
            Event::ConnectionOpenReq => EventKind::ConnectionOpenReq,
            Event::ConnectionCloseReq => EventKind::ConnectionCloseReq,
            Event::RpcServerRegisterReq(_) => EventKind::RpcServerRegisterReq,
            Event::RpcServerExecuteReq(_) => EventKind::RpcServerExecuteReq,
            Event::RpcServerExecuteRsp(_) => EventKind::RpcServerExecuteRsp,
            Event::RpcClientSubscribeReq(_) => EventKind::RpcClientSubscribeReq,
            Event::RpcClientUnsubscribeReq(_) => EventKind::RpcClientUnsubscribeReq,
            Event::RpcClientInvokeReq(_) => EventKind::RpcClientInvokeReq,
            Event::RpcClientReady(_) => EventKind::RpcClientReady,
            Event::RpcClientResponse(_) => EventKind::RpcClientResponse,
        }
    }
}

/// Report of a failed dispatch, delivered inbound as [`Event::Error`].
#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent<'a> {
    pub error: Error,
    /// Name of the policy (or pipeline component) whose handler failed.
    pub sender: &'static str,
    /// The event that was being handled.
    pub event: &'a Event<'a>,
}

/// Returns `true` if a request addressed to `target` concerns the instance named `name`.
/// `None` addresses every instance.
pub(crate) fn addresses(target: Option<&str>, name: &str) -> bool {
    target.is_none_or(|target| target == name)
}
