//! # Hierarchical State Machine Engine
//!
//! A policy describes its states as a closed `enum` and names each state's parent in
//! [`StateMachine::parent`]; the resulting tree is fixed at compile time. The engine
//! implements the three supported transition shapes and the bubbling of unhandled
//! events toward the root.
//!
//! ## Transitions
//!
//! All transitions first exit every state between the current state and `source`,
//! walking up the parent chain. Then:
//!
//! - **peer** (`source` and `destination` share a parent): exit `source`, enter
//!   `destination`.
//! - **substate** (`source` is the parent of `destination`): enter `destination`;
//!   `source` stays active as its ancestor.
//! - **superstate** (`destination` is the parent of `source`): exit `source`; the
//!   destination was already active and is not re-entered.
//!
//! ## Dispatch
//!
//! [`Dispatch::send_event`] hands the event to the current state. A handler that
//! returns [`Outcome::Super`] passes the event to its parent. The root must handle
//! every event; a root returning [`Outcome::Super`] is a programming error and ends in
//! [`critical_error`].

use crate::error::Error;
use crate::platform::critical_error;

/// Upper bound on the depth of any state tree. Bubbling and exit walks never take
/// more steps than this.
pub const MAX_STATE_DEPTH: usize = 8;

/// What a state handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// The event was consumed.
    Handled,
    /// The event should be offered to the parent state.
    Super,
}

/// The mutable part of a state machine: its current state.
#[derive(Debug, Clone, Copy)]
pub struct Hfsm<S> {
    current: S,
}

impl<S: Copy> Hfsm<S> {
    /// Creates an instance positioned at `root`. No entry action runs until
    /// [`StateMachine::init`].
    pub const fn new(root: S) -> Self {
        Self { current: root }
    }

    pub fn current(&self) -> S {
        self.current
    }
}

/// State tree, entry/exit actions and transitions of a machine driven with context `C`.
pub trait StateMachine<C: ?Sized> {
    type State: Copy + Eq;

    fn hfsm(&mut self) -> &mut Hfsm<Self::State>;

    /// The parent of `state`, or `None` for the root.
    fn parent(state: Self::State) -> Option<Self::State>;

    /// Hierarchical name of `state`, used in diagnostics.
    fn state_name(state: Self::State) -> &'static str;

    fn on_entry(&mut self, state: Self::State, ctx: &mut C) -> Result<(), Error> {
        let _ = (state, ctx);
        Ok(())
    }

    fn on_exit(&mut self, state: Self::State, ctx: &mut C) -> Result<(), Error> {
        let _ = (state, ctx);
        Ok(())
    }

    /// Positions the machine at `root` and runs the root's entry action.
    fn init(&mut self, root: Self::State, ctx: &mut C) -> Result<(), Error> {
        if Self::parent(root).is_some() {
            return Err(Error::InvalidArgument);
        }
        self.hfsm().current = root;
        trace!("hfsm: enter {}", Self::state_name(root));
        self.on_entry(root, ctx)
    }

    /// Exits states from the current one up to, but not including, `source`.
    fn exit_to(&mut self, source: Self::State, ctx: &mut C) -> Result<(), Error> {
        for _ in 0..MAX_STATE_DEPTH {
            let current = self.hfsm().current;
            if current == source {
                return Ok(());
            }
            let Some(parent) = Self::parent(current) else {
                // `source` is not an ancestor of the current state.
                return Err(Error::InvalidTransition);
            };
            trace!("hfsm: exit {}", Self::state_name(current));
            self.on_exit(current, ctx)?;
            self.hfsm().current = parent;
        }
        Err(Error::InvalidTransition)
    }

    fn transition_peer(
        &mut self,
        source: Self::State,
        destination: Self::State,
        ctx: &mut C,
    ) -> Result<(), Error> {
        let parent = Self::parent(source);
        if source == destination || parent.is_none() || parent != Self::parent(destination) {
            return Err(Error::InvalidTransition);
        }
        self.exit_to(source, ctx)?;
        trace!("hfsm: exit {}", Self::state_name(source));
        self.on_exit(source, ctx)?;
        self.hfsm().current = destination;
        trace!("hfsm: enter {}", Self::state_name(destination));
        self.on_entry(destination, ctx)
    }

    fn transition_substate(
        &mut self,
        source: Self::State,
        destination: Self::State,
        ctx: &mut C,
    ) -> Result<(), Error> {
        if Self::parent(destination) != Some(source) {
            return Err(Error::InvalidTransition);
        }
        self.exit_to(source, ctx)?;
        self.hfsm().current = destination;
        trace!("hfsm: enter {}", Self::state_name(destination));
        self.on_entry(destination, ctx)
    }

    fn transition_superstate(
        &mut self,
        source: Self::State,
        destination: Self::State,
        ctx: &mut C,
    ) -> Result<(), Error> {
        if Self::parent(source) != Some(destination) {
            return Err(Error::InvalidTransition);
        }
        self.exit_to(source, ctx)?;
        trace!("hfsm: exit {}", Self::state_name(source));
        self.on_exit(source, ctx)?;
        self.hfsm().current = destination;
        Ok(())
    }
}

/// Event handling for a [`StateMachine`].
pub trait Dispatch<E: ?Sized, C: ?Sized>: StateMachine<C> {
    /// Handles `event` in `state`, which is the current state or one of its ancestors.
    fn handle(&mut self, state: Self::State, event: &E, ctx: &mut C) -> Result<Outcome, Error>;

    /// Delivers `event` to the current state, bubbling it up while handlers return
    /// [`Outcome::Super`].
    fn send_event(&mut self, event: &E, ctx: &mut C) -> Result<(), Error> {
        let mut state = self.hfsm().current;
        for _ in 0..MAX_STATE_DEPTH {
            match self.handle(state, event, ctx)? {
                Outcome::Handled => return Ok(()),
                Outcome::Super => match Self::parent(state) {
                    Some(parent) => state = parent,
                    None => critical_error("root state did not handle an event"),
                },
            }
        }
        critical_error("state tree deeper than MAX_STATE_DEPTH")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum S {
        Root,
        S01,
        S02,
        S11,
        S12,
        S21,
        S22,
    }

    const ALL: [S; 7] = [S::Root, S::S01, S::S02, S::S11, S::S12, S::S21, S::S22];

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Ev {
        SubR,
        Sub0,
        Sub1,
        Internal0,
        Internal2,
        Peer0,
        Peer1,
        Peer2,
        Super1,
        Super2,
        BadTransition,
        Unhandled,
    }

    #[derive(Default)]
    struct Counters {
        entered: [i32; 7],
        internal0: u32,
        internal2: u32,
    }

    struct Machine {
        hfsm: Hfsm<S>,
        fail_exit_of: Option<S>,
    }

    fn index(state: S) -> usize {
        ALL.iter().position(|s| *s == state).unwrap()
    }

    impl StateMachine<Counters> for Machine {
        type State = S;

        fn hfsm(&mut self) -> &mut Hfsm<S> {
            &mut self.hfsm
        }

        fn parent(state: S) -> Option<S> {
            match state {
                S::Root => None,
                S::S01 | S::S02 => Some(S::Root),
                S::S11 | S::S12 => Some(S::S01),
                S::S21 | S::S22 => Some(S::S11),
            }
        }

        fn state_name(state: S) -> &'static str {
            match state {
                S::Root => "root",
                S::S01 => "s01",
                S::S02 => "s02",
                S::S11 => "s11",
                S::S12 => "s12",
                S::S21 => "s21",
                S::S22 => "s22",
            }
        }

        fn on_entry(&mut self, state: S, ctx: &mut Counters) -> Result<(), Error> {
            ctx.entered[index(state)] += 1;
            Ok(())
        }

        fn on_exit(&mut self, state: S, ctx: &mut Counters) -> Result<(), Error> {
            if self.fail_exit_of == Some(state) {
                return Err(Error::InvalidState);
            }
            ctx.entered[index(state)] -= 1;
            Ok(())
        }
    }

    impl Dispatch<Ev, Counters> for Machine {
        fn handle(&mut self, state: S, event: &Ev, ctx: &mut Counters) -> Result<Outcome, Error> {
            match (state, *event) {
                (S::Root, Ev::SubR) => self.transition_substate(S::Root, S::S01, ctx)?,
                (S::Root, Ev::Unhandled) => return Ok(Outcome::Super),
                (S::Root, _) => {}
                (S::S01, Ev::Sub0) => self.transition_substate(S::S01, S::S11, ctx)?,
                (S::S01, Ev::Internal0) => ctx.internal0 += 1,
                (S::S01, Ev::Peer0) => self.transition_peer(S::S01, S::S02, ctx)?,
                (S::S02, Ev::Peer0) => self.transition_peer(S::S02, S::S01, ctx)?,
                (S::S11, Ev::Sub1) => self.transition_substate(S::S11, S::S21, ctx)?,
                (S::S11, Ev::Peer1) => self.transition_peer(S::S11, S::S12, ctx)?,
                (S::S12, Ev::Peer1) => self.transition_peer(S::S12, S::S11, ctx)?,
                (S::S21, Ev::Internal2) => ctx.internal2 += 1,
                (S::S21, Ev::Peer2) => self.transition_peer(S::S21, S::S22, ctx)?,
                (S::S22, Ev::Peer2) => self.transition_peer(S::S22, S::S21, ctx)?,
                (S::S21 | S::S22, Ev::Super1) => self.transition_superstate(state, S::S11, ctx)?,
                (S::S11 | S::S12, Ev::Super2) => self.transition_superstate(state, S::S01, ctx)?,
                (S::S21, Ev::BadTransition) => self.transition_peer(S::S21, S::S02, ctx)?,
                _ => return Ok(Outcome::Super),
            }
            Ok(Outcome::Handled)
        }
    }

    fn started() -> (Machine, Counters) {
        let mut machine = Machine {
            hfsm: Hfsm::new(S::Root),
            fail_exit_of: None,
        };
        let mut counters = Counters::default();
        machine.init(S::Root, &mut counters).unwrap();
        (machine, counters)
    }

    fn deepest() -> (Machine, Counters) {
        let (mut machine, mut counters) = started();
        for event in [Ev::SubR, Ev::Sub0, Ev::Sub1] {
            machine.send_event(&event, &mut counters).unwrap();
        }
        (machine, counters)
    }

    fn assert_balanced(counters: &Counters) {
        for (state, count) in ALL.iter().zip(counters.entered.iter()) {
            assert!(
                *count == 0 || *count == 1,
                "{:?} entered {} times",
                state,
                count
            );
        }
    }

    #[test]
    fn test_init_enters_root() {
        let (machine, counters) = started();
        assert_eq!(machine.hfsm.current(), S::Root);
        assert_eq!(counters.entered[index(S::Root)], 1);
    }

    #[test]
    fn test_init_rejects_non_root() {
        let mut machine = Machine {
            hfsm: Hfsm::new(S::Root),
            fail_exit_of: None,
        };
        let mut counters = Counters::default();
        assert_eq!(
            machine.init(S::S11, &mut counters),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_substate_chain_enters_each_level() {
        let (machine, counters) = deepest();
        assert_eq!(machine.hfsm.current(), S::S21);
        assert_eq!(counters.entered, [1, 1, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_unhandled_events_bubble_to_ancestor() {
        let (mut machine, mut counters) = deepest();
        machine.send_event(&Ev::Internal0, &mut counters).unwrap();
        machine.send_event(&Ev::Internal2, &mut counters).unwrap();
        assert_eq!(counters.internal0, 1);
        assert_eq!(counters.internal2, 1);
        assert_eq!(machine.hfsm.current(), S::S21);
    }

    #[test]
    fn test_peer_from_nested_child_exits_through_source() {
        let (mut machine, mut counters) = deepest();
        // Handled by s01, three levels above the current state.
        machine.send_event(&Ev::Peer0, &mut counters).unwrap();
        assert_eq!(machine.hfsm.current(), S::S02);
        assert_eq!(counters.entered, [1, 0, 1, 0, 0, 0, 0]);

        machine.send_event(&Ev::Peer0, &mut counters).unwrap();
        assert_eq!(machine.hfsm.current(), S::S01);
        assert_eq!(counters.entered, [1, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_superstate_does_not_reenter_destination() {
        let (mut machine, mut counters) = deepest();
        machine.send_event(&Ev::Super1, &mut counters).unwrap();
        assert_eq!(machine.hfsm.current(), S::S11);
        assert_eq!(counters.entered, [1, 1, 0, 1, 0, 0, 0]);

        machine.send_event(&Ev::Super2, &mut counters).unwrap();
        assert_eq!(machine.hfsm.current(), S::S01);
        assert_eq!(counters.entered, [1, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_invalid_transition_leaves_state_untouched() {
        let (mut machine, mut counters) = deepest();
        assert_eq!(
            machine.send_event(&Ev::BadTransition, &mut counters),
            Err(Error::InvalidTransition)
        );
        assert_eq!(machine.hfsm.current(), S::S21);
        assert_eq!(counters.entered, [1, 1, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_failing_exit_preempts_transition() {
        let (mut machine, mut counters) = deepest();
        machine.fail_exit_of = Some(S::S11);
        assert_eq!(
            machine.send_event(&Ev::Peer0, &mut counters),
            Err(Error::InvalidState)
        );
        // s21 was exited, s11 refused, nothing was entered.
        assert_eq!(machine.hfsm.current(), S::S11);
        assert_eq!(counters.entered[index(S::S02)], 0);
    }

    #[test]
    #[should_panic(expected = "critical error")]
    fn test_root_unhandled_event_is_fatal() {
        let (mut machine, mut counters) = started();
        let _ = machine.send_event(&Ev::Unhandled, &mut counters);
    }

    #[test]
    fn test_entry_exit_counts_stay_balanced() {
        let (mut machine, mut counters) = started();
        let script = [
            Ev::SubR,
            Ev::Sub0,
            Ev::Peer1,
            Ev::Peer1,
            Ev::Sub1,
            Ev::Peer2,
            Ev::Super1,
            Ev::Sub1,
            Ev::Peer2,
            Ev::Peer2,
            Ev::Peer0,
            Ev::Peer0,
            Ev::Sub0,
            Ev::Super2,
            Ev::Internal0,
            Ev::Peer0,
        ];
        for event in script {
            machine.send_event(&event, &mut counters).unwrap();
            assert_balanced(&counters);
        }
        assert_eq!(machine.hfsm.current(), S::S02);
    }
}
