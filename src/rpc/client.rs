//! # RPC Client Policy
//!
//! The invoker side of command RPC. The client subscribes to its response topic,
//! publishes requests on the executor's command topic and delivers each correlated
//! response to the application as [`Event::RpcClientResponse`].
//!
//! ```text
//! root
//! ├── idle
//! ├── subscribing
//! ├── ready
//! └── faulted
//! ```
//!
//! Requests are accepted only in `ready`. Every request is tracked in the
//! [`PendingRegistry`] until its response arrives or its timeout expires; an expired
//! request is answered locally with [`RpcStatus::Timeout`]. Responses whose
//! correlation id is not pending are ignored. The registry should belong to a single
//! client.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;
use heapless::String;

use super::{
    InvokeRequest, InvokeResponse, MAX_COMMAND_NAME_LEN, Pending, PendingRegistry, RpcStatus,
    STATUS_MESSAGE_PROPERTY, STATUS_PROPERTY,
};
use crate::error::{Error, ProtocolError};
use crate::event::{ErrorEvent, Event, addresses};
use crate::hfsm::{Dispatch, Hfsm, Outcome, StateMachine};
use crate::packet::{
    PacketId, Properties, PublishRequest, QoS, ReceivedPublish, SubscribeRequest,
    UnsubscribeRequest,
};
use crate::pipeline::{Chain, Pipeline, Policy, detached};
use crate::platform::TimerId;
use crate::topic::{self, Topic};
use crate::util::copy_str;

const NAME: &str = "rpc_client";

#[derive(Debug, Clone, Copy)]
pub struct RpcClientOptions<'c> {
    pub namespace: &'c str,
    pub model_id: &'c str,
    /// The executor the commands are sent to.
    pub executor_id: &'c str,
    /// This client's identity, part of the response topic.
    pub invoker_id: &'c str,
    pub command_name: &'c str,
    pub qos: QoS,
    pub subscribe_timeout: Duration,
    /// Used for requests that do not set their own timeout.
    pub request_timeout: Duration,
}

impl<'c> RpcClientOptions<'c> {
    pub fn new(
        model_id: &'c str,
        executor_id: &'c str,
        invoker_id: &'c str,
        command_name: &'c str,
    ) -> Self {
        Self {
            namespace: "vehicles",
            model_id,
            executor_id,
            invoker_id,
            command_name,
            qos: QoS::AtLeastOnce,
            subscribe_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_namespace(mut self, namespace: &'c str) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Registry data of an outstanding request.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub command_name: String<MAX_COMMAND_NAME_LEN>,
    /// Packet id of the request publish.
    pub message_id: Option<PacketId>,
    pub timer: Option<TimerId>,
}

/// States of the [`RpcClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Root,
    Idle,
    Subscribing,
    Ready,
    Faulted,
}

fn state_path(state: State) -> &'static str {
    match state {
        State::Root => "rpc_client",
        State::Idle => "rpc_client/idle",
        State::Subscribing => "rpc_client/subscribing",
        State::Ready => "rpc_client/ready",
        State::Faulted => "rpc_client/faulted",
    }
}

/// Invokes one command on one executor.
pub struct RpcClient<'c, M: RawMutex, const N: usize = 4> {
    hfsm: Hfsm<State>,
    options: RpcClientOptions<'c>,
    request_topic: Topic,
    response_topic: Topic,
    registry: &'c PendingRegistry<M, ClientRequest, N>,
    subscribe_timer: Option<TimerId>,
    subscribe_id: Option<PacketId>,
}

impl<'c, M: RawMutex, const N: usize> RpcClient<'c, M, N> {
    pub fn new(
        options: RpcClientOptions<'c>,
        registry: &'c PendingRegistry<M, ClientRequest, N>,
    ) -> Result<Self, Error> {
        let request_topic = topic::command_topic(
            options.namespace,
            options.model_id,
            options.executor_id,
            Some(options.command_name),
        )?;
        let response_topic = topic::response_topic(
            options.namespace,
            options.model_id,
            options.invoker_id,
            options.executor_id,
            options.command_name,
        )?;
        let mut client = Self {
            hfsm: Hfsm::new(State::Root),
            options,
            request_topic,
            response_topic,
            registry,
            subscribe_timer: None,
            subscribe_id: None,
        };
        detached(|chain| {
            client.init(State::Root, chain)?;
            client.transition_substate(State::Root, State::Idle, chain)
        })?;
        Ok(client)
    }

    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    fn is_response(&self, event: &Event<'_>) -> bool {
        matches!(event, Event::PublishReceived(publish) if topic::matches(&self.response_topic, publish.topic))
    }

    fn is_own_invoke(&self, event: &Event<'_>) -> bool {
        matches!(event, Event::RpcClientInvokeReq(request) if request.command_name == self.options.command_name)
    }

    fn invoke(&mut self, request: &InvokeRequest<'_>, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        if request.correlation_id.is_empty() || request.content_type.is_empty() {
            warn!("rpc_client: request without correlation id or content type");
            return Err(Error::InvalidArgument);
        }
        let timeout = request.timeout.unwrap_or(self.options.request_timeout);
        let pending = ClientRequest {
            command_name: copy_str(self.options.command_name)?,
            message_id: None,
            timer: None,
        };
        let deadline = chain
            .now()?
            .checked_add(timeout)
            .ok_or(Error::InvalidArgument)?;
        self.registry.add(request.correlation_id, deadline, pending)?;

        if let Err(error) = self.send_request(request, timeout, chain) {
            if let Ok(entry) = self.registry.remove(request.correlation_id)
                && let Some(timer) = entry.data.timer
            {
                let _ = chain.timer_destroy(timer);
            }
            return Err(error);
        }
        Ok(())
    }

    fn send_request(
        &self,
        request: &InvokeRequest<'_>,
        timeout: Duration,
        chain: &mut Chain<'_, '_>,
    ) -> Result<(), Error> {
        let correlation_id = request.correlation_id;
        let timer = chain.timer_create()?;
        self.registry
            .update(correlation_id, |pending| pending.timer = Some(timer))?;
        chain.timer_start(timer, timeout)?;

        let properties = Properties {
            correlation_data: Some(correlation_id),
            response_topic: Some(self.response_topic.as_str()),
            content_type: Some(request.content_type),
            user_properties: &[],
        };
        let publish = PublishRequest::new(&self.request_topic, request.payload, self.options.qos)
            .with_properties(properties);
        chain.send_outbound(&Event::PublishReq(&publish))?;

        let message_id = publish.out_id.get();
        request.message_id.set(message_id);
        self.registry
            .update(correlation_id, |pending| pending.message_id = message_id)?;
        debug!("rpc_client: sent {} request", self.options.command_name);
        Ok(())
    }

    fn on_response(
        &mut self,
        publish: &ReceivedPublish<'_>,
        chain: &mut Chain<'_, '_>,
    ) -> Result<(), Error> {
        let command_name = self.options.command_name;
        let Some(correlation_id) = publish.properties.correlation_data else {
            warn!("rpc_client: response without correlation data on {}", publish.topic);
            let response = InvokeResponse {
                command_name,
                correlation_id: &[],
                status: None,
                payload: publish.payload,
                content_type: publish.properties.content_type,
                error_message: None,
                protocol_error: Some(ProtocolError::MissingCorrelationData),
            };
            return chain.send_inbound(&Event::RpcClientResponse(&response));
        };
        let entry = match self.registry.remove(correlation_id) {
            Ok(entry) => entry,
            Err(Error::NotFound) => {
                debug!("rpc_client: ignoring response to a request no longer pending");
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        if let Some(timer) = entry.data.timer {
            chain.timer_destroy(timer)?;
        }
        let response = parse_response(command_name, correlation_id, publish);
        if let Some(error) = response.protocol_error {
            warn!("rpc_client: malformed {} response: {:?}", command_name, error);
        }
        chain.send_inbound(&Event::RpcClientResponse(&response))
    }

    /// Answers the request whose timer fired. Returns `false` if the timer belongs to
    /// no pending request.
    fn expire(&mut self, timer: TimerId, chain: &mut Chain<'_, '_>) -> Result<bool, Error> {
        let Some(entry) = self
            .registry
            .remove_where(|entry| entry.data.timer == Some(timer))
        else {
            return Ok(false);
        };
        chain.timer_destroy(timer)?;
        Self::time_out(&entry, chain)?;
        Ok(true)
    }

    /// Times out requests whose deadline passed without their timer firing.
    fn sweep(&mut self, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        let now = chain.now()?;
        let mut outcome = Ok(());
        self.registry.sweep_expired(now, |entry| {
            if let Some(timer) = entry.data.timer {
                let _ = chain.timer_destroy(timer);
            }
            let delivered = Self::time_out(&entry, chain);
            if outcome.is_ok() {
                outcome = delivered;
            }
        });
        outcome
    }

    fn time_out(entry: &Pending<ClientRequest>, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        warn!(
            "rpc_client: {} request timed out",
            entry.data.command_name.as_str()
        );
        let response = InvokeResponse {
            command_name: &entry.data.command_name,
            correlation_id: &entry.correlation_id,
            status: Some(RpcStatus::Timeout),
            payload: &[],
            content_type: None,
            error_message: Some("request timed out"),
            protocol_error: None,
        };
        chain.send_inbound(&Event::RpcClientResponse(&response))
    }

    fn unsubscribe(&mut self, state: State, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        if state != State::Idle {
            self.transition_peer(state, State::Idle, chain)?;
        }
        info!("rpc_client: unsubscribing from {}", self.response_topic.as_str());
        let request = UnsubscribeRequest::new(&self.response_topic);
        chain.send_outbound(&Event::UnsubscribeReq(&request))
    }

    fn fault(
        &mut self,
        error: Error,
        event: &Event<'_>,
        chain: &mut Chain<'_, '_>,
    ) -> Result<(), Error> {
        error!(
            "rpc_client: subscription to {} failed: {:?}",
            self.response_topic.as_str(),
            error
        );
        self.transition_peer(State::Subscribing, State::Faulted, chain)?;
        let report = ErrorEvent {
            error,
            sender: NAME,
            event,
        };
        chain.send_inbound(&Event::Error(&report))
    }
}

/// Reads status, error text and payload out of a response publish.
fn parse_response<'a>(
    command_name: &'a str,
    correlation_id: &'a [u8],
    publish: &ReceivedPublish<'a>,
) -> InvokeResponse<'a> {
    let properties = &publish.properties;
    let mut response = InvokeResponse {
        command_name,
        correlation_id,
        status: None,
        payload: publish.payload,
        content_type: properties.content_type,
        error_message: None,
        protocol_error: None,
    };
    let status = match properties.user_property(STATUS_PROPERTY).map(RpcStatus::parse) {
        Some(Ok(status)) => status,
        Some(Err(error)) => {
            response.protocol_error = Some(error);
            return response;
        }
        None => {
            response.protocol_error = Some(ProtocolError::MissingStatus);
            return response;
        }
    };
    response.status = Some(status);
    if status.is_success() {
        if publish.payload.is_empty() {
            response.protocol_error = Some(ProtocolError::EmptyPayload);
        }
    } else {
        response.error_message = properties.user_property(STATUS_MESSAGE_PROPERTY);
    }
    response
}

impl<'x, 'y, M: RawMutex, const N: usize> StateMachine<Chain<'x, 'y>> for RpcClient<'_, M, N> {
    type State = State;

    fn hfsm(&mut self) -> &mut Hfsm<State> {
        &mut self.hfsm
    }

    fn parent(state: State) -> Option<State> {
        match state {
            State::Root => None,
            _ => Some(State::Root),
        }
    }

    fn state_name(state: State) -> &'static str {
        state_path(state)
    }

    fn on_entry(&mut self, state: State, chain: &mut Chain<'x, 'y>) -> Result<(), Error> {
        match state {
            State::Subscribing => {
                let timer = chain.timer_create()?;
                self.subscribe_timer = Some(timer);
                chain.timer_start(timer, self.options.subscribe_timeout)?;
                info!("rpc_client: subscribing to {}", self.response_topic.as_str());
                let request = SubscribeRequest::new(&self.response_topic, self.options.qos);
                chain.send_outbound(&Event::SubscribeReq(&request))?;
                self.subscribe_id = request.out_id.get();
                Ok(())
            }
            State::Ready => chain.send_inbound(&Event::RpcClientReady(self.options.command_name)),
            _ => Ok(()),
        }
    }

    fn on_exit(&mut self, state: State, chain: &mut Chain<'x, 'y>) -> Result<(), Error> {
        if state != State::Subscribing {
            return Ok(());
        }
        self.subscribe_id = None;
        match self.subscribe_timer.take() {
            Some(timer) => chain.timer_destroy(timer),
            None => Ok(()),
        }
    }
}

impl<'e, 'x, 'y, M: RawMutex, const N: usize> Dispatch<Event<'e>, Chain<'x, 'y>>
    for RpcClient<'_, M, N>
{
    fn handle(
        &mut self,
        state: State,
        event: &Event<'e>,
        chain: &mut Chain<'x, 'y>,
    ) -> Result<Outcome, Error> {
        let command = self.options.command_name;
        match (state, event) {
            (State::Idle, Event::RpcClientSubscribeReq(target)) if addresses(*target, command) => {
                self.transition_peer(State::Idle, State::Subscribing, chain)?;
                if target.is_none() {
                    chain.forward(event)?;
                }
            }
            (State::Subscribing | State::Ready, Event::RpcClientSubscribeReq(target))
                if addresses(*target, command) =>
            {
                debug!("rpc_client: already subscribed");
                if target.is_none() {
                    chain.forward(event)?;
                }
            }
            (
                State::Idle | State::Subscribing | State::Ready,
                Event::RpcClientUnsubscribeReq(target),
            ) if addresses(*target, command) => {
                self.unsubscribe(state, chain)?;
                if target.is_none() {
                    chain.forward(event)?;
                }
            }

            (State::Subscribing, Event::SubAck(ack)) if self.subscribe_id == Some(ack.packet_id) => {
                if ack.is_success() {
                    info!("rpc_client: subscribed to {}", self.response_topic.as_str());
                    self.transition_peer(State::Subscribing, State::Ready, chain)?;
                } else {
                    self.fault(Error::SubscribeRejected, event, chain)?;
                }
            }
            (State::Subscribing, Event::Timeout(timer)) if self.subscribe_timer == Some(*timer) => {
                self.fault(Error::Timeout, event, chain)?;
            }
            (State::Subscribing, Event::PublishReceived(publish)) if self.is_response(event) => {
                self.transition_peer(State::Subscribing, State::Ready, chain)?;
                self.on_response(publish, chain)?;
            }

            (State::Ready, Event::RpcClientInvokeReq(request)) if self.is_own_invoke(event) => {
                self.invoke(request, chain)?;
            }
            (State::Idle | State::Subscribing | State::Faulted, Event::RpcClientInvokeReq(_))
                if self.is_own_invoke(event) =>
            {
                warn!("rpc_client: {} is not ready", command);
                return Err(Error::InvalidState);
            }

            (
                State::Faulted,
                Event::RpcClientSubscribeReq(target) | Event::RpcClientUnsubscribeReq(target),
            ) if addresses(*target, command) => {
                if target.is_some() {
                    return Err(Error::InvalidState);
                }
                chain.forward(event)?;
            }
            (State::Faulted, Event::PublishReceived(_)) if self.is_response(event) => {
                warn!("rpc_client: faulted, dropping response");
            }

            (State::Root, Event::PublishReceived(publish)) if self.is_response(event) => {
                self.on_response(publish, chain)?;
            }
            (State::Root, Event::Timeout(timer)) => {
                if !self.expire(*timer, chain)? {
                    debug!("rpc_client: stale timer");
                }
            }
            (State::Root, Event::ProcessLoop) => {
                self.sweep(chain)?;
                chain.forward(event)?;
            }
            (State::Root, _) => {
                chain.forward(event)?;
            }
            _ => return Ok(Outcome::Super),
        }
        Ok(Outcome::Handled)
    }
}

impl<M: RawMutex + Sync, const N: usize> Policy for RpcClient<'_, M, N> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state_name(&self) -> &'static str {
        state_path(self.hfsm.current())
    }

    fn on_event(&mut self, event: &Event<'_>, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        trace!(
            "rpc_client: {} <- {:?}",
            state_path(self.hfsm.current()),
            event.kind()
        );
        self.send_event(event, chain)
    }
}

impl<M: RawMutex> Pipeline<'_, M> {
    /// Subscribes the RPC client for `command`, or every RPC client on `None`.
    pub fn rpc_client_subscribe(&self, command: Option<&str>) -> Result<(), Error> {
        self.post_outbound_event(&Event::RpcClientSubscribeReq(command))
    }

    /// Unsubscribes the RPC client for `command`, or every RPC client on `None`.
    pub fn rpc_client_unsubscribe(&self, command: Option<&str>) -> Result<(), Error> {
        self.post_outbound_event(&Event::RpcClientUnsubscribeReq(command))
    }

    /// Publishes a command request and returns the packet id of the publish.
    ///
    /// The response arrives later as [`Event::RpcClientResponse`].
    pub fn rpc_client_invoke(&self, request: &InvokeRequest<'_>) -> Result<Option<PacketId>, Error> {
        self.post_outbound_event(&Event::RpcClientInvokeReq(request))?;
        Ok(request.message_id.get())
    }
}
