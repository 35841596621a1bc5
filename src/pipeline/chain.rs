use embassy_time::{Duration, Instant};
use heapless::Vec;

use super::{Application, Discard, Direction, MAX_TIMERS, Policy};
use crate::error::Error;
use crate::event::Event;
use crate::platform::{NoPlatform, Platform, TimerId};
use crate::transport::{self, MqttTransport, NoTransport};

/// State shared by every chain of one dispatch.
pub(crate) struct Env<'p> {
    pub(crate) platform: &'p dyn Platform,
    /// Which policy created each live timer.
    pub(crate) timers: Vec<(TimerId, usize), MAX_TIMERS>,
    pub(crate) policies: usize,
    /// First policy whose handler failed during the current dispatch.
    pub(crate) blame: Option<&'static str>,
}

impl<'p> Env<'p> {
    pub(crate) fn new(platform: &'p dyn Platform) -> Self {
        Self {
            platform,
            timers: Vec::new(),
            policies: 0,
            blame: None,
        }
    }

    pub(crate) fn owner_of(&self, timer: TimerId) -> Option<usize> {
        self.timers
            .iter()
            .find(|(id, _)| *id == timer)
            .map(|(_, owner)| *owner)
    }
}

/// A policy's view of its neighbours during one dispatch.
///
/// A `Chain` is handed to [`Policy::on_event`] and lets the policy forward events
/// one step further and use the platform. Policies already executing further up
/// the call stack are not part of the chain: an event sent back toward them goes
/// straight to the end of the pipeline in that direction, because a policy is never
/// re-entered while it runs.
pub struct Chain<'c, 'p> {
    pub(super) below: &'c mut [&'p mut dyn Policy],
    pub(super) above: &'c mut [&'p mut dyn Policy],
    pub(super) transport: &'c mut (dyn MqttTransport + 'p),
    pub(super) application: &'c mut (dyn Application + 'p),
    pub(super) env: &'c mut Env<'p>,
    pub(super) position: usize,
    pub(super) direction: Direction,
}

impl<'c, 'p> Chain<'c, 'p> {
    /// Direction of the dispatch that reached this policy.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Sends `event` one step toward the transport.
    pub fn send_outbound(&mut self, event: &Event<'_>) -> Result<(), Error> {
        let Some((next, rest)) = self.below.split_last_mut() else {
            return transport::deliver(&mut *self.transport, event);
        };
        let name = next.name();
        let position = rest.len();
        let mut chain = Chain {
            below: rest,
            above: &mut [],
            transport: &mut *self.transport,
            application: &mut *self.application,
            env: &mut *self.env,
            position,
            direction: Direction::Outbound,
        };
        let result = next.on_event(event, &mut chain);
        self.blame(name, &result);
        result
    }

    /// Sends `event` one step toward the application.
    pub fn send_inbound(&mut self, event: &Event<'_>) -> Result<(), Error> {
        let Some((next, rest)) = self.above.split_first_mut() else {
            return self.application.on_event(event);
        };
        let name = next.name();
        let position = self.env.policies - rest.len() - 1;
        let mut chain = Chain {
            below: &mut [],
            above: rest,
            transport: &mut *self.transport,
            application: &mut *self.application,
            env: &mut *self.env,
            position,
            direction: Direction::Inbound,
        };
        let result = next.on_event(event, &mut chain);
        self.blame(name, &result);
        result
    }

    /// Passes `event` on in the direction it was travelling.
    pub fn forward(&mut self, event: &Event<'_>) -> Result<(), Error> {
        match self.direction {
            Direction::Outbound => self.send_outbound(event),
            Direction::Inbound => self.send_inbound(event),
        }
    }

    pub fn now(&self) -> Result<Instant, Error> {
        self.env.platform.now()
    }

    pub fn random(&self) -> Result<u32, Error> {
        self.env.platform.random()
    }

    /// Creates a timer whose expiry is delivered to the calling policy as
    /// [`Event::Timeout`].
    pub fn timer_create(&mut self) -> Result<TimerId, Error> {
        let timer = self.env.platform.timer_create()?;
        if self.env.timers.push((timer, self.position)).is_err() {
            let _ = self.env.platform.timer_destroy(timer);
            return Err(Error::BufferTooSmall);
        }
        Ok(timer)
    }

    pub fn timer_start(&mut self, timer: TimerId, delay: Duration) -> Result<(), Error> {
        self.env.platform.timer_start(timer, delay)
    }

    /// Destroys a timer. Expiries already in flight for it are dropped.
    pub fn timer_destroy(&mut self, timer: TimerId) -> Result<(), Error> {
        self.env.timers.retain(|(id, _)| *id != timer);
        self.env.platform.timer_destroy(timer)
    }

    fn blame(&mut self, name: &'static str, result: &Result<(), Error>) {
        if result.is_err() && self.env.blame.is_none() {
            self.env.blame = Some(name);
        }
    }
}

/// Runs `f` with a chain that has no neighbours and no platform.
///
/// Policies use it to run the entry actions of their initial states before they are
/// attached to a pipeline.
pub(crate) fn detached<R>(f: impl FnOnce(&mut Chain<'_, '_>) -> R) -> R {
    let mut transport = NoTransport;
    let mut application = Discard;
    let mut env = Env::new(&NoPlatform);
    let mut chain = Chain {
        below: &mut [],
        above: &mut [],
        transport: &mut transport,
        application: &mut application,
        env: &mut env,
        position: 0,
        direction: Direction::Outbound,
    };
    f(&mut chain)
}
