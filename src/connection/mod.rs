//! # Connection Policy
//!
//! Keeps the MQTT session up. The policy sits next to the transport and owns the
//! connect/disconnect lifecycle:
//!
//! ```text
//! root
//! ├── idle
//! ├── started
//! │   ├── connecting
//! │   ├── connected
//! │   └── disconnecting
//! └── faulted
//! ```
//!
//! Failures are classified with [`FailureClass`]. Network and service failures are
//! retried after a [`Backoff`] delay; security failures switch between the primary
//! and secondary credential and retry at once; permanent refusals, exhausted retries
//! and exhausted credential rotations move the policy to `faulted` and are reported
//! to the application as [`Event::Error`].

mod retry;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;

pub use retry::{Backoff, RetryOptions};

use crate::error::{Error, FailureClass};
use crate::event::{ErrorEvent, Event};
use crate::hfsm::{Dispatch, Hfsm, Outcome, StateMachine};
use crate::packet::{ConnectRequest, Credential};
use crate::pipeline::{Chain, Pipeline, Policy, detached};
use crate::platform::TimerId;

const NAME: &str = "connection";

/// Broker address, identity and retry configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions<'c> {
    pub host: &'c str,
    pub port: u16,
    pub client_id: &'c str,
    pub username: &'c str,
    pub keep_alive: Duration,
    pub clean_start: bool,
    pub primary: Credential<'c>,
    /// Used after the broker rejects the primary credential.
    pub secondary: Option<Credential<'c>>,
    pub retry: RetryOptions,
}

impl<'c> ConnectionOptions<'c> {
    pub fn new(host: &'c str, client_id: &'c str, primary: Credential<'c>) -> Self {
        Self {
            host,
            port: 8883,
            client_id,
            username: "",
            keep_alive: Duration::from_secs(60),
            clean_start: true,
            primary,
            secondary: None,
            retry: RetryOptions::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: &'c str) -> Self {
        self.username = username;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    pub fn with_secondary(mut self, secondary: Credential<'c>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }
}

/// States of the [`ConnectionPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    Root,
    Idle,
    Started,
    Connecting,
    Connected,
    Disconnecting,
    Faulted,
}

fn state_path(state: State) -> &'static str {
    match state {
        State::Root => "connection",
        State::Idle => "connection/idle",
        State::Started => "connection/started",
        State::Connecting => "connection/started/connecting",
        State::Connected => "connection/started/connected",
        State::Disconnecting => "connection/started/disconnecting",
        State::Faulted => "connection/faulted",
    }
}

/// Connects, reconnects and disconnects the MQTT session.
pub struct ConnectionPolicy<'c> {
    hfsm: Hfsm<State>,
    options: ConnectionOptions<'c>,
    backoff: Backoff,
    use_secondary: bool,
    rotations: u32,
    retry_timer: Option<TimerId>,
    /// A CONNECT was sent and neither acknowledged nor failed yet.
    in_flight: bool,
}

impl<'c> ConnectionPolicy<'c> {
    pub fn new(options: ConnectionOptions<'c>) -> Result<Self, Error> {
        let mut policy = Self {
            hfsm: Hfsm::new(State::Root),
            backoff: Backoff::new(options.retry),
            options,
            use_secondary: false,
            rotations: 0,
            retry_timer: None,
            in_flight: false,
        };
        detached(|chain| {
            policy.init(State::Root, chain)?;
            policy.transition_substate(State::Root, State::Idle, chain)
        })?;
        Ok(policy)
    }

    /// Whether the secondary credential is the one in use.
    pub fn uses_secondary(&self) -> bool {
        self.use_secondary
    }

    fn credential(&self) -> Credential<'c> {
        match (self.use_secondary, self.options.secondary) {
            (true, Some(secondary)) => secondary,
            _ => self.options.primary,
        }
    }

    fn connect(&mut self, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        let options = &self.options;
        let request = ConnectRequest {
            host: options.host,
            port: options.port,
            client_id: options.client_id,
            username: options.username,
            credential: self.credential(),
            keep_alive_secs: u16::try_from(options.keep_alive.as_secs()).unwrap_or(u16::MAX),
            clean_start: options.clean_start,
        };
        info!(
            "connection: connecting to {}:{} (retry {})",
            options.host,
            options.port,
            self.backoff.attempt()
        );
        self.in_flight = true;
        chain.send_outbound(&Event::ConnectReq(&request))
    }

    fn arm_retry(&mut self, delay: Duration, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        let timer = match self.retry_timer {
            Some(timer) => timer,
            None => {
                let timer = chain.timer_create()?;
                self.retry_timer = Some(timer);
                timer
            }
        };
        info!("connection: retrying in {} ms", delay.as_millis());
        chain.timer_start(timer, delay)
    }

    /// Picks the recovery for a failed connection attempt. Runs in `connecting`.
    fn on_failure(
        &mut self,
        class: FailureClass,
        refusal: Error,
        event: &Event<'_>,
        chain: &mut Chain<'_, '_>,
    ) -> Result<(), Error> {
        self.in_flight = false;
        match class {
            FailureClass::Security => {
                if self.rotations >= self.backoff.options().max_credential_rotations {
                    return self.fault(Error::CredentialsRejected, event, chain);
                }
                self.rotations += 1;
                if self.options.secondary.is_some() {
                    self.use_secondary = !self.use_secondary;
                }
                warn!(
                    "connection: credential rejected, rotation {} (secondary: {})",
                    self.rotations,
                    self.use_secondary
                );
                self.connect(chain)
            }
            FailureClass::Network | FailureClass::Service => {
                match self.backoff.next_delay(chain.random()?) {
                    Ok(delay) => self.arm_retry(delay, chain),
                    Err(error) => self.fault(error, event, chain),
                }
            }
            FailureClass::Permanent => self.fault(refusal, event, chain),
        }
    }

    fn fault(
        &mut self,
        error: Error,
        event: &Event<'_>,
        chain: &mut Chain<'_, '_>,
    ) -> Result<(), Error> {
        error!("connection: giving up: {:?}", error);
        let current = self.hfsm.current();
        self.transition_superstate(current, State::Started, chain)?;
        self.transition_peer(State::Started, State::Faulted, chain)?;
        let report = ErrorEvent {
            error,
            sender: NAME,
            event,
        };
        chain.send_inbound(&Event::Error(&report))
    }
}

impl<'x, 'y> StateMachine<Chain<'x, 'y>> for ConnectionPolicy<'_> {
    type State = State;

    fn hfsm(&mut self) -> &mut Hfsm<State> {
        &mut self.hfsm
    }

    fn parent(state: State) -> Option<State> {
        match state {
            State::Root => None,
            State::Idle | State::Started | State::Faulted => Some(State::Root),
            State::Connecting | State::Connected | State::Disconnecting => Some(State::Started),
        }
    }

    fn state_name(state: State) -> &'static str {
        state_path(state)
    }

    fn on_exit(&mut self, state: State, chain: &mut Chain<'x, 'y>) -> Result<(), Error> {
        match state {
            State::Connecting => {
                self.in_flight = false;
                match self.retry_timer.take() {
                    Some(timer) => chain.timer_destroy(timer),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

impl<'e, 'x, 'y> Dispatch<Event<'e>, Chain<'x, 'y>> for ConnectionPolicy<'_> {
    fn handle(
        &mut self,
        state: State,
        event: &Event<'e>,
        chain: &mut Chain<'x, 'y>,
    ) -> Result<Outcome, Error> {
        match (state, event) {
            (State::Idle, Event::ConnectionOpenReq) => {
                self.backoff.reset();
                self.rotations = 0;
                self.use_secondary = false;
                self.transition_peer(State::Idle, State::Started, chain)?;
                self.transition_substate(State::Started, State::Connecting, chain)?;
                self.connect(chain)?;
            }
            (State::Idle, Event::ConnectionCloseReq) => {
                debug!("connection: already closed");
            }

            (State::Started, Event::ConnectionOpenReq) => {
                debug!("connection: already open");
            }
            (State::Started, Event::ConnectionCloseReq) => {
                let current = self.hfsm.current();
                self.transition_peer(current, State::Disconnecting, chain)?;
                chain.send_outbound(&Event::DisconnectReq)?;
            }

            (State::Connecting, Event::ConnAck(ack)) => {
                let code = ack.reason_code;
                if code.is_success() {
                    info!("connection: connected");
                    self.in_flight = false;
                    self.backoff.reset();
                    self.rotations = 0;
                    self.transition_peer(State::Connecting, State::Connected, chain)?;
                    chain.forward(event)?;
                } else {
                    warn!("connection: refused: {:?}", code);
                    chain.forward(event)?;
                    let class = code.failure_class().unwrap_or(FailureClass::Permanent);
                    self.on_failure(class, Error::ConnectionRefused(code), event, chain)?;
                }
            }
            (State::Connecting, Event::Disconnected(reason)) => {
                chain.forward(event)?;
                if self.in_flight {
                    warn!("connection: attempt failed: {:?}", reason);
                    let class = reason.failure_class().unwrap_or(FailureClass::Network);
                    self.on_failure(class, Error::Transport, event, chain)?;
                }
            }
            (State::Connecting, Event::Timeout(timer)) if self.retry_timer == Some(*timer) => {
                self.connect(chain)?;
            }

            (State::Connected, Event::Disconnected(reason)) => {
                warn!("connection: lost: {:?}", reason);
                chain.forward(event)?;
                self.transition_peer(State::Connected, State::Connecting, chain)?;
                let class = reason.failure_class().unwrap_or(FailureClass::Network);
                self.on_failure(class, Error::Transport, event, chain)?;
            }

            (State::Disconnecting, Event::ConnectionCloseReq) => {
                debug!("connection: already closing");
            }
            (State::Disconnecting, Event::Disconnected(_)) => {
                info!("connection: closed");
                self.transition_superstate(State::Disconnecting, State::Started, chain)?;
                self.transition_peer(State::Started, State::Idle, chain)?;
                chain.forward(event)?;
            }

            (State::Faulted, Event::ConnectionOpenReq | Event::ConnectionCloseReq) => {
                return Err(Error::InvalidState);
            }

            (State::Root, Event::Timeout(_)) => {
                debug!("connection: stale timer");
            }
            (State::Root, _) => {
                chain.forward(event)?;
            }
            _ => return Ok(Outcome::Super),
        }
        Ok(Outcome::Handled)
    }
}

impl Policy for ConnectionPolicy<'_> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state_name(&self) -> &'static str {
        state_path(self.hfsm.current())
    }

    fn on_event(&mut self, event: &Event<'_>, chain: &mut Chain<'_, '_>) -> Result<(), Error> {
        trace!(
            "connection: {} <- {:?}",
            state_path(self.hfsm.current()),
            event.kind()
        );
        self.send_event(event, chain)
    }
}

impl<M: RawMutex> Pipeline<'_, M> {
    /// Asks the connection policy to connect.
    pub fn connection_open(&self) -> Result<(), Error> {
        self.post_outbound_event(&Event::ConnectionOpenReq)
    }

    /// Asks the connection policy to disconnect.
    pub fn connection_close(&self) -> Result<(), Error> {
        self.post_outbound_event(&Event::ConnectionCloseReq)
    }
}
