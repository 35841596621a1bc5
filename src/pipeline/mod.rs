//! # Event Pipeline
//!
//! A pipeline chains [`Policy`] instances between an [`MqttTransport`] at the outbound
//! end and an [`Application`] at the inbound end:
//!
//! ```text
//! transport <- policy[0] <- policy[1] <- ... <- application     (outbound)
//! transport -> policy[0] -> policy[1] -> ... -> application     (inbound)
//! ```
//!
//! External code posts events with [`Pipeline::post_outbound_event`] (entering at the
//! application end) and [`Pipeline::post_inbound_event`] (entering at the transport
//! end). A post takes the pipeline's mutex and runs the whole dispatch to completion
//! before returning. Inside a handler, a policy forwards events through its
//! [`Chain`] instead; posting to the same pipeline from a handler fails with
//! [`Error::Reentrant`].
//!
//! ## Timers
//!
//! Timers created through [`Chain::timer_create`] belong to the creating policy. When
//! the platform reports an expiry through [`Pipeline::on_timer_expired`], the
//! pipeline delivers [`Event::Timeout`] to that policy, travelling outbound. A timeout
//! that fails is reported to the application as an inbound [`Event::Error`].
//!
//! ## Synchronous mode
//!
//! [`SyncPipeline`] uses a no-op mutex. The caller serializes all access itself and
//! drives the transport with [`Pipeline::process_loop`].
//!
//! ## Example
//!
//! ```ignore
//! let pipeline = Pipeline::<CriticalSectionRawMutex>::new(&platform, &mut transport, &mut app)
//!     .with_policy(&mut connection)?
//!     .with_policy(&mut server)?;
//!
//! pipeline.connection_open()?;
//! ```

mod chain;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::{NoopRawMutex, RawMutex};
use heapless::Vec;

pub use chain::Chain;
pub(crate) use chain::{Env, detached};

use crate::error::Error;
use crate::event::{ErrorEvent, Event};
use crate::platform::{Platform, TimerId, critical_error};
use crate::transport::MqttTransport;

/// Maximum number of policies in one pipeline.
pub const MAX_POLICIES: usize = 8;

/// Maximum number of timers alive at once in one pipeline.
pub const MAX_TIMERS: usize = 16;

/// Direction an event travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// From the application toward the transport.
    Outbound,
    /// From the transport toward the application.
    Inbound,
}

/// One link of the pipeline.
pub trait Policy: Send {
    /// Short name used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Name of the active state.
    fn state_name(&self) -> &'static str;

    fn on_event(&mut self, event: &Event<'_>, chain: &mut Chain<'_, '_>) -> Result<(), Error>;
}

/// The inbound end of the pipeline.
pub trait Application: Send {
    fn on_event(&mut self, event: &Event<'_>) -> Result<(), Error>;
}

impl<F> Application for F
where
    F: FnMut(&Event<'_>) -> Result<(), Error> + Send,
{
    fn on_event(&mut self, event: &Event<'_>) -> Result<(), Error> {
        self(event)
    }
}

/// An application that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Application for Discard {
    fn on_event(&mut self, _event: &Event<'_>) -> Result<(), Error> {
        Ok(())
    }
}

/// Where a dispatch enters the stack.
#[derive(Clone, Copy)]
enum Entry {
    Application,
    Transport,
    Policy(usize),
}

struct Stack<'p> {
    transport: &'p mut dyn MqttTransport,
    application: &'p mut dyn Application,
    policies: Vec<&'p mut dyn Policy, MAX_POLICIES>,
    env: Env<'p>,
}

impl<'p> Stack<'p> {
    fn enter(&mut self, entry: Entry, event: &Event<'_>) -> Result<(), Error> {
        let Stack {
            transport,
            application,
            policies,
            env,
        } = self;
        env.blame = None;
        let policies: &mut [&'p mut dyn Policy] = policies;
        let mut chain = Chain {
            below: &mut [],
            above: &mut [],
            transport: &mut **transport,
            application: &mut **application,
            env,
            position: 0,
            direction: Direction::Outbound,
        };
        match entry {
            Entry::Application => {
                chain.below = policies;
                chain.send_outbound(event)
            }
            Entry::Transport => {
                chain.above = policies;
                chain.direction = Direction::Inbound;
                chain.send_inbound(event)
            }
            Entry::Policy(index) => {
                if index >= policies.len() {
                    return Err(Error::NotFound);
                }
                let (below, rest) = policies.split_at_mut(index);
                let Some((target, above)) = rest.split_first_mut() else {
                    return Err(Error::NotFound);
                };
                chain.below = below;
                chain.above = above;
                chain.position = index;
                let result = target.on_event(event, &mut chain);
                if result.is_err() && chain.env.blame.is_none() {
                    chain.env.blame = Some(target.name());
                }
                result
            }
        }
    }
}

/// A chain of policies serialized by a mutex of type `M`.
pub struct Pipeline<'p, M: RawMutex> {
    stack: Mutex<M, RefCell<Stack<'p>>>,
}

/// A pipeline without locking, for single-threaded drivers.
pub type SyncPipeline<'p> = Pipeline<'p, NoopRawMutex>;

impl<'p, M: RawMutex> Pipeline<'p, M> {
    /// Creates a pipeline with no policies: outbound events go straight to
    /// `transport`, inbound events straight to `application`.
    pub fn new(
        platform: &'p dyn Platform,
        transport: &'p mut dyn MqttTransport,
        application: &'p mut dyn Application,
    ) -> Self {
        Self {
            stack: Mutex::new(RefCell::new(Stack {
                transport,
                application,
                policies: Vec::new(),
                env: Env::new(platform),
            })),
        }
    }

    /// Appends `policy` at the application end of the chain.
    ///
    /// The first policy added sits next to the transport.
    pub fn with_policy(mut self, policy: &'p mut dyn Policy) -> Result<Self, Error> {
        let stack = self.stack.get_mut().get_mut();
        stack
            .policies
            .push(policy)
            .map_err(|_| Error::BufferTooSmall)?;
        stack.env.policies = stack.policies.len();
        Ok(self)
    }

    /// Dispatches `event` from the application end toward the transport.
    pub fn post_outbound_event(&self, event: &Event<'_>) -> Result<(), Error> {
        self.with_stack(|stack| stack.enter(Entry::Application, event))
    }

    /// Dispatches `event` from the transport end toward the application.
    ///
    /// If the dispatch fails, an [`Event::Error`] describing the failure is sent
    /// along the same path and its result is returned.
    pub fn post_inbound_event(&self, event: &Event<'_>) -> Result<(), Error> {
        self.with_stack(|stack| {
            let Err(error) = stack.enter(Entry::Transport, event) else {
                return Ok(());
            };
            let sender = stack.env.blame.unwrap_or("pipeline");
            warn!(
                "pipeline: inbound {:?} failed in {}: {:?}",
                event.kind(),
                sender,
                error
            );
            let report = ErrorEvent {
                error,
                sender,
                event,
            };
            stack.enter(Entry::Transport, &Event::Error(&report))
        })
    }

    /// Delivers the expiry of `timer` to the policy that created it.
    ///
    /// Expiries of destroyed timers are dropped. A failed timeout dispatch is
    /// reported inbound as [`Event::Error`]; if even that fails the critical error
    /// path runs.
    pub fn on_timer_expired(&self, timer: TimerId) -> Result<(), Error> {
        let timeout = Event::Timeout(timer);
        let outcome = self.with_stack(|stack| {
            let Some(owner) = stack.env.owner_of(timer) else {
                debug!("pipeline: dropping expiry of timer {}", timer.0);
                return Ok(Ok(()));
            };
            Ok(stack
                .enter(Entry::Policy(owner), &timeout)
                .map_err(|error| (error, stack.env.blame.unwrap_or("pipeline"))))
        });
        let (error, sender) = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(failure)) => failure,
            Err(error) => (error, "pipeline"),
        };
        warn!("pipeline: timer {} failed in {}: {:?}", timer.0, sender, error);
        let report = ErrorEvent {
            error,
            sender,
            event: &timeout,
        };
        if self.post_inbound_event(&Event::Error(&report)).is_err() {
            critical_error("timer failure could not be reported");
        }
        Ok(())
    }

    /// Runs one iteration of the synchronous driver: a [`Event::ProcessLoop`] travels
    /// outbound to [`MqttTransport::process`], then inbound to the application.
    pub fn process_loop(&self) -> Result<(), Error> {
        self.post_outbound_event(&Event::ProcessLoop)?;
        self.post_inbound_event(&Event::ProcessLoop)
    }

    /// Name of the active state of the policy at `index` (0 is next to the transport).
    pub fn policy_state(&self, index: usize) -> Result<&'static str, Error> {
        self.with_stack(|stack| {
            stack
                .policies
                .get(index)
                .map(|policy| policy.state_name())
                .ok_or(Error::NotFound)
        })
    }

    fn with_stack<R>(
        &self,
        f: impl FnOnce(&mut Stack<'p>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.stack.lock(|cell| {
            let mut stack = cell.try_borrow_mut().map_err(|_| Error::Reentrant)?;
            f(&mut stack)
        })
    }
}
