//! # RPC Server Policy
//!
//! The executor side of command RPC. After registration the server subscribes to its
//! command topic and hands every valid request to the application as
//! [`Event::RpcServerExecuteReq`]. The application answers with
//! [`Pipeline::rpc_server_finish`], which publishes the response.
//!
//! ```text
//! root
//! ├── idle
//! ├── subscribing
//! ├── waiting
//! └── faulted
//! ```
//!
//! At most `N` commands are pending at once (one by default). Further requests are
//! answered with [`RpcStatus::Throttled`] and dropped. A command the application does
//! not finish within the command timeout is answered with [`RpcStatus::Timeout`].
//! Completions are matched to pending commands by correlation id; a completion for a
//! command that already timed out is discarded.
//!
//! A subscription that is rejected or not acknowledged in time moves the server to
//! `faulted`, where it stays.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;
use heapless::String;

use super::{
    CommandRequest, CommandResponse, MAX_COMMAND_NAME_LEN, MAX_CONTENT_TYPE_LEN, PendingRegistry,
    RpcStatus, STATUS_MESSAGE_PROPERTY, STATUS_PROPERTY,
};
use crate::error::{Error, ProtocolError};
use crate::event::{ErrorEvent, Event, addresses};
use crate::hfsm::{Dispatch, Hfsm, Outcome, StateMachine};
use crate::packet::{PacketId, Properties, PublishRequest, QoS, ReceivedPublish, SubscribeRequest};
use crate::pipeline::{Chain, Pipeline, Policy, detached};
use crate::platform::TimerId;
use crate::topic::{self, Topic};
use crate::util::copy_str;

const NAME: &str = "rpc_server";

/// Where the server listens and how long it waits.
#[derive(Debug, Clone, Copy)]
pub struct RpcServerOptions<'s> {
    pub namespace: &'s str,
    pub model_id: &'s str,
    pub executor_id: &'s str,
    /// The command served; `None` serves every command of the executor.
    pub command_name: Option<&'s str>,
    pub subscribe_qos: QoS,
    pub response_qos: QoS,
    pub subscribe_timeout: Duration,
    pub command_timeout: Duration,
}

impl<'s> RpcServerOptions<'s> {
    pub fn new(model_id: &'s str, executor_id: &'s str) -> Self {
        Self {
            namespace: "vehicles",
            model_id,
            executor_id,
            command_name: None,
            subscribe_qos: QoS::AtLeastOnce,
            response_qos: QoS::AtLeastOnce,
            subscribe_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_namespace(mut self, namespace: &'s str) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_command(mut self, command_name: &'s str) -> Self {
        self.command_name = Some(command_name);
        self
    }

    pub fn with_qos(mut self, subscribe: QoS, response: QoS) -> Self {
        self.subscribe_qos = subscribe;
        self.response_qos = response;
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// What the server remembers about a command while the application executes it.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub response_topic: Topic,
    pub request_topic: Topic,
    pub content_type: String<MAX_CONTENT_TYPE_LEN>,
    pub command_name: String<MAX_COMMAND_NAME_LEN>,
    /// Fires the timeout response.
    pub timer: Option<TimerId>,
}

/// States of the [`RpcServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Root,
    Idle,
    Subscribing,
    Waiting,
    Faulted,
}

fn state_path(state: State) -> &'static str {
    match state {
        State::Root => "rpc_server",
        State::Idle => "rpc_server/idle",
        State::Subscribing => "rpc_server/subscribing",
        State::Waiting => "rpc_server/waiting",
        State::Faulted => "rpc_server/faulted",
    }
}

/// Where the response to a request goes. Requests without it cannot be answered.
fn reply_address<'a>(
    properties: &Properties<'a>,
) -> Result<(&'a [u8], &'a str), ProtocolError> {
    let correlation_id = properties
        .correlation_data
        .ok_or(ProtocolError::MissingCorrelationData)?;
    let response_topic = properties
        .response_topic
        .ok_or(ProtocolError::MissingResponseTopic)?;
    Ok((correlation_id, response_topic))
}

/// The configured command, or the last level of `topic` for a wildcard server.
fn requested_command<'a>(
    configured: Option<&'a str>,
    topic: &'a str,
) -> Result<&'a str, ProtocolError> {
    match configured {
        Some(name) => Ok(name),
        None => topic::parse_command_topic(topic)
            .map(|parsed| parsed.command_name)
            .ok_or(ProtocolError::MalformedTopic),
    }
}

/// Executes commands received on one command topic.
pub struct RpcServer<'s, M: RawMutex, const N: usize = 1> {
    hfsm: Hfsm<State>,
    options: RpcServerOptions<'s>,
    filter: Topic,
    registry: &'s PendingRegistry<M, ServerCommand, N>,
    subscribe_timer: Option<TimerId>,
    subscribe_id: Option<PacketId>,
}

impl<'s, M: RawMutex, const N: usize> RpcServer<'s, M, N> {
    pub fn new(
        options: RpcServerOptions<'s>,
        registry: &'s PendingRegistry<M, ServerCommand, N>,
    ) -> Result<Self, Error> {
        let filter = topic::command_topic(
            options.namespace,
            options.model_id,
            options.executor_id,
            options.command_name,
        )?;
        let mut server = Self {
            hfsm: Hfsm::new(State::Root),
            options,
            filter,
            registry,
            subscribe_timer: None,
            subscribe_id: None,
        };
        detached(|chain| {
            server.init(State::Root, chain)?;
            server.transition_substate(State::Root, State::Idle, chain)
        })?;
        Ok(server)
    }

    /// The topic filter the server subscribes to.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Name used to address this server in registration requests.
    fn command(&self) -> &'s str {
        self.options.command_name.unwrap_or("+")
    }

    fn is_request(&self, event: &Event<'_>) -> bool {
        matches!(event, Event::PublishReceived(publish) if topic::matches(&self.filter, publish.topic))
    }

    fn on_request(
        &mut self,
        publish: &ReceivedPublish<'_>,
        chain: &mut Chain<'_, '_>,
    ) -> Result<(), Error> {
        let (correlation_id, response_topic) = match reply_address(&publish.properties) {
            Ok(address) => address,
            Err(error) => {
                warn!("rpc_server: unanswerable request on {}: {:?}", publish.topic, error);
                return Err(error.into());
            }
        };
        let reject = |status, message| CommandResponse::failure(correlation_id, status, message);

        let parsed = publish
            .properties
            .content_type
            .ok_or(ProtocolError::MissingContentType)
            .and_then(|content_type| {
                let command_name = requested_command(self.options.command_name, publish.topic)?;
                Ok((content_type, command_name))
            });
        let (content_type, command_name) = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!("rpc_server: bad request on {}: {:?}", publish.topic, error);
                let response = reject(RpcStatus::BadRequest, error.as_str());
                return self.respond(response_topic, &response, chain);
            }
        };
        let Ok(command) = Self::record(publish.topic, response_topic, content_type, command_name)
        else {
            let response = reject(RpcStatus::BadRequest, "request properties too long");
            return self.respond(response_topic, &response, chain);
        };

        let deadline = chain
            .now()?
            .checked_add(self.options.command_timeout)
            .ok_or(Error::InvalidArgument)?;
        match self.registry.add(correlation_id, deadline, command) {
            Ok(()) => {}
            Err(Error::RegistryFull) => {
                warn!("rpc_server: throttling {}", command_name);
                let response = reject(
                    RpcStatus::Throttled,
                    "Can't execute more than one command at a time",
                );
                return self.respond(response_topic, &response, chain);
            }
            Err(Error::DuplicateCorrelationId) => {
                warn!("rpc_server: duplicate correlation id for {}", command_name);
                let response = reject(RpcStatus::Conflict, "duplicate correlation id");
                return self.respond(response_topic, &response, chain);
            }
            Err(Error::InvalidArgument | Error::BufferTooSmall) => {
                let response = reject(RpcStatus::BadRequest, "invalid correlation id");
                return self.respond(response_topic, &response, chain);
            }
            Err(error) => return Err(error),
        }

        let armed = chain.timer_create().and_then(|timer| {
            self.registry
                .update(correlation_id, |command| command.timer = Some(timer))?;
            chain.timer_start(timer, self.options.command_timeout)
        });
        if let Err(error) = armed {
            if let Ok(entry) = self.registry.remove(correlation_id)
                && let Some(timer) = entry.data.timer
            {
                let _ = chain.timer_destroy(timer);
            }
            return Err(error);
        }

        let request = CommandRequest {
            correlation_id,
            response_topic,
            request_topic: publish.topic,
            content_type,
            payload: publish.payload,
            command_name,
            deadline,
        };
        info!("rpc_server: executing {}", command_name);
        let delivered = self.registry.run_detached(correlation_id, |_| {
            chain.send_inbound(&Event::RpcServerExecuteReq(&request))
        })?;
        if !delivered.is_current() {
            debug!("rpc_server: {} finished during delivery", command_name);
        }
        delivered.into_inner()
    }

    fn record(
        request_topic: &str,
        response_topic: &str,
        content_type: &str,
        command_name: &str,
    ) -> Result<ServerCommand, Error> {
        Ok(ServerCommand {
            response_topic: copy_str(response_topic)?,
            request_topic: copy_str(request_topic)?,
            content_type: copy_str(content_type)?,
            command_name: copy_str(command_name)?,
            timer: None,
        })
    }

    /// Publishes the response to a pending command. Returns `false` if no command is
    /// pending under the response's correlation id.
    fn finish(
        &mut self,
        response: &CommandResponse<'_>,
        chain: &mut Chain<'_, '_>,
    ) -> Result<bool, Error> {
        let entry = match self.registry.remove(response.correlation_id) {
            Ok(entry) => entry,
            Err(Error::NotFound) => return Ok(false),
            Err(error) => return Err(error),
        };
        if let Some(timer) = entry.data.timer
            && let Err(error) = chain.timer_destroy(timer)
        {
            warn!("rpc_server: timer {} not released: {:?}", timer.0, error);
        }
        info!(
            "rpc_server: {} finished with {}",
            entry.data.command_name.as_str(),
            response.status.code()
        );
        self.respond(&entry.data.response_topic, response, chain)?;
        Ok(true)
    }

    /// Answers the command whose timer fired. Returns `false` if the timer belongs to
    /// no pending command.
    fn expire(&mut self, timer: TimerId, chain: &mut Chain<'_, '_>) -> Result<bool, Error> {
        let Some(entry) = self
            .registry
            .remove_where(|entry| entry.data.timer == Some(timer))
        else {
            return Ok(false);
        };
        if let Err(error) = chain.timer_destroy(timer) {
            warn!("rpc_server: timer {} not released: {:?}", timer.0, error);
        }
        warn!(
            "rpc_server: {} timed out",
            entry.data.command_name.as_str()
        );
        let response = CommandResponse::failure(
            &entry.correlation_id,
            RpcStatus::Timeout,
            "command timed out",
        );
        self.respond(&entry.data.response_topic, &response, chain)?;
        Ok(true)
    }

    fn respond(
        &self,
        response_topic: &str,
        response: &CommandResponse<'_>,
        chain: &mut Chain<'_, '_>,
    ) -> Result<(), Error> {
        let user_properties = [
            (STATUS_PROPERTY, response.status.as_str()),
            (STATUS_MESSAGE_PROPERTY, response.error_message.unwrap_or("")),
        ];
        let (user_properties, content_type, payload) = if response.status.is_success() {
            (&user_properties[..1], response.content_type, response.payload)
        } else {
            (&user_properties[..], None, &[][..])
        };
        let properties = Properties {
            correlation_data: Some(response.correlation_id),
            response_topic: None,
            content_type,
            user_properties,
        };
        let publish = PublishRequest::new(response_topic, payload, self.options.response_qos)
            .with_properties(properties);
        chain.send_outbound(&Event::PublishReq(&publish))
    }

    fn fault(
        &mut self,
        error: Error,
        event: &Event<'_>,
        chain: &mut Chain<'_, '_>,
    ) -> Result<(), Error> {
        error!("rpc_server: subscription to {} failed: {:?}", self.filter.as_str(), error);
        self.transition_peer(State::Subscribing, State::Faulted, chain)?;
        let report = ErrorEvent {
            error,
            sender: NAME,
            event,
        };
        chain.send_inbound(&Event::Error(&report))
    }
}

impl<'x, 'y, M: RawMutex, const N: usize> StateMachine<Chain<'x, 'y>> for RpcServer<'_, M, N> {
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
        if state != State::Subscribing {
            return Ok(());
        }
        let timer = chain.timer_create()?;
        self.subscribe_timer = Some(timer);
        chain.timer_start(timer, self.options.subscribe_timeout)?;
        info!("rpc_server: subscribing to {}", self.filter.as_str());
        let request = SubscribeRequest::new(&self.filter, self.options.subscribe_qos);
        chain.send_outbound(&Event::SubscribeReq(&request))?;
        self.subscribe_id = request.out_id.get();
        Ok(())
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
    for RpcServer<'_, M, N>
{
    fn handle(
        &mut self,
        state: State,
        event: &Event<'e>,
        chain: &mut Chain<'x, 'y>,
    ) -> Result<Outcome, Error> {
        match (state, event) {
            (State::Idle, Event::RpcServerRegisterReq(target))
                if addresses(*target, self.command()) =>
            {
                self.transition_peer(State::Idle, State::Subscribing, chain)?;
                if target.is_none() {
                    chain.forward(event)?;
                }
            }
            (State::Idle, Event::PublishReceived(publish)) if self.is_request(event) => {
                // A persistent session may deliver requests before registration.
                self.transition_peer(State::Idle, State::Waiting, chain)?;
                self.on_request(publish, chain)?;
            }

            (State::Subscribing, Event::SubAck(ack)) if self.subscribe_id == Some(ack.packet_id) => {
                if ack.is_success() {
                    info!("rpc_server: subscribed to {}", self.filter.as_str());
                    self.transition_peer(State::Subscribing, State::Waiting, chain)?;
                } else {
                    self.fault(Error::SubscribeRejected, event, chain)?;
                }
            }
            (State::Subscribing, Event::Timeout(timer)) if self.subscribe_timer == Some(*timer) => {
                self.fault(Error::Timeout, event, chain)?;
            }
            (State::Subscribing, Event::PublishReceived(publish)) if self.is_request(event) => {
                self.transition_peer(State::Subscribing, State::Waiting, chain)?;
                self.on_request(publish, chain)?;
            }

            (State::Waiting, Event::PublishReceived(publish)) if self.is_request(event) => {
                self.on_request(publish, chain)?;
            }
            (State::Waiting, Event::RpcServerExecuteRsp(response)) => {
                if !self.finish(response, chain)? {
                    return Ok(Outcome::Super);
                }
            }
            (State::Waiting, Event::Timeout(timer)) => {
                if !self.expire(*timer, chain)? {
                    return Ok(Outcome::Super);
                }
            }

            (State::Subscribing | State::Waiting, Event::RpcServerRegisterReq(target))
                if addresses(*target, self.command()) =>
            {
                debug!("rpc_server: already registered");
                if target.is_none() {
                    chain.forward(event)?;
                }
            }

            (State::Faulted, Event::RpcServerRegisterReq(target))
                if addresses(*target, self.command()) =>
            {
                if target.is_some() {
                    return Err(Error::InvalidState);
                }
                chain.forward(event)?;
            }
            (State::Faulted, Event::PublishReceived(_)) if self.is_request(event) => {
                warn!("rpc_server: faulted, dropping request");
            }

            (State::Root, Event::Timeout(_)) => {
                debug!("rpc_server: stale timer");
            }
            (State::Root, _) => {
                chain.forward(event)?;
            }
            _ => return Ok(Outcome::Super),
        }
        Ok(Outcome::Handled)
    }
}

impl<M: RawMutex + Sync, const N: usize> Policy for RpcServer<'_, M, N> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state_name(&self) -> &'static str {
        state_path(self.hfsm.current())
    }

    fn on_event(&mut self, event: &Event<'_>, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        trace!(
            "rpc_server: {} <- {:?}",
            state_path(self.hfsm.current()),
            event.kind()
        );
        self.send_event(event, chain)
    }
}

impl<M: RawMutex> Pipeline<'_, M> {
    /// Registers the RPC server serving `command`, or every RPC server on `None`.
    pub fn rpc_server_register(&self, command: Option<&str>) -> Result<(), Error> {
        self.post_outbound_event(&Event::RpcServerRegisterReq(command))
    }

    /// Publishes the application's response to a command. Responses to commands
    /// that are no longer pending are discarded.
    pub fn rpc_server_finish(&self, response: &CommandResponse<'_>) -> Result<(), Error> {
        self.post_outbound_event(&Event::RpcServerExecuteRsp(response))
    }
}
