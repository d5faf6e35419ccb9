//! Protocol state machine.
//!
//! The machine maps `(state, event)` pairs to handler tags. It never runs
//! handlers itself: the protocol engine looks up the tag for the current
//! state, runs it, and asks the machine to record the resulting transition.
//! This keeps the table free of closures and lets the engine dispatch with an
//! exhaustive `match`.
//!
//! # Construction
//!
//! Tables are assembled with [`FsmBuilder`] and validated when built:
//!
//! - the initial state must be one of the supported states;
//! - every supported state has `Enter` and `Exit` handlers;
//! - no handler is registered for an unsupported state.
//!
//! ```
//! use marine_driver::fsm::InstrumentFsm;
//! use marine_core::{ProtocolEvent, ProtocolState};
//!
//! #[derive(Debug, Clone, Copy, PartialEq)]
//! enum Tag { Noop, Discover }
//!
//! let mut fsm = InstrumentFsm::builder(ProtocolState::Unknown)
//!     .state(ProtocolState::Unknown, Tag::Noop, Tag::Noop)
//!     .state(ProtocolState::Command, Tag::Noop, Tag::Noop)
//!     .on(ProtocolState::Unknown, ProtocolEvent::Discover, Tag::Discover)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(fsm.handler(ProtocolEvent::Discover).unwrap(), Tag::Discover);
//! assert!(fsm.handler(ProtocolEvent::Get).is_err());
//!
//! fsm.transition(ProtocolState::Command, ProtocolEvent::Discover);
//! assert_eq!(fsm.current_state(), ProtocolState::Command);
//! ```

use chrono::{DateTime, Utc};
use marine_core::constants::MAX_TRANSITION_HISTORY;
use marine_core::{Error, ProtocolEvent, ProtocolState, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Record of one state change, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: ProtocolState,
    pub to: ProtocolState,
    /// Event whose handler requested the change.
    pub cause: ProtocolEvent,
    pub at: DateTime<Utc>,
}

/// State machine over [`ProtocolState`] with handler tags of type `H`.
#[derive(Debug, Clone)]
pub struct InstrumentFsm<H> {
    current: ProtocolState,
    supported: BTreeSet<ProtocolState>,
    handlers: HashMap<(ProtocolState, ProtocolEvent), H>,
    history: VecDeque<StateTransition>,
}

impl<H: Copy> InstrumentFsm<H> {
    pub fn builder(initial: ProtocolState) -> FsmBuilder<H> {
        FsmBuilder {
            initial,
            supported: BTreeSet::new(),
            handlers: Vec::new(),
        }
    }

    pub fn current_state(&self) -> ProtocolState {
        self.current
    }

    /// Handler registered for `event` in the current state.
    ///
    /// # Errors
    /// Returns `Error::UnhandledEvent` if the pair is not registered. The
    /// state is not changed.
    pub fn handler(&self, event: ProtocolEvent) -> Result<H> {
        self.handler_for(self.current, event)
            .ok_or_else(|| Error::unhandled(self.current, event))
    }

    pub fn handler_for(&self, state: ProtocolState, event: ProtocolEvent) -> Option<H> {
        self.handlers.get(&(state, event)).copied()
    }

    pub fn can_handle(&self, event: ProtocolEvent) -> bool {
        self.handlers.contains_key(&(self.current, event))
    }

    /// Events that may be dispatched in the current state, `Enter`/`Exit` excluded.
    pub fn legal_events(&self) -> Vec<ProtocolEvent> {
        let mut events: Vec<ProtocolEvent> = self
            .handlers
            .keys()
            .filter(|(state, event)| {
                *state == self.current && !matches!(event, ProtocolEvent::Enter | ProtocolEvent::Exit)
            })
            .map(|(_, event)| *event)
            .collect();
        events.sort_by_key(|e| e.to_string());
        events
    }

    pub fn supported_states(&self) -> impl Iterator<Item = ProtocolState> + '_ {
        self.supported.iter().copied()
    }

    pub fn supports(&self, state: ProtocolState) -> bool {
        self.supported.contains(&state)
    }

    /// Record a change of state.
    ///
    /// Returns `None` when `to` is already the current state. The caller is
    /// responsible for running `Exit` before and `Enter` after.
    pub fn transition(&mut self, to: ProtocolState, cause: ProtocolEvent) -> Option<StateTransition> {
        if to == self.current {
            return None;
        }
        let transition = StateTransition {
            from: self.current,
            to,
            cause,
            at: Utc::now(),
        };
        self.current = to;
        self.history.push_back(transition.clone());
        if self.history.len() > MAX_TRANSITION_HISTORY {
            self.history.pop_front();
        }
        Some(transition)
    }

    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }
}

/// Builder collecting supported states and handler registrations.
#[derive(Debug)]
pub struct FsmBuilder<H> {
    initial: ProtocolState,
    supported: BTreeSet<ProtocolState>,
    handlers: Vec<(ProtocolState, ProtocolEvent, H)>,
}

impl<H: Copy> FsmBuilder<H> {
    /// Declare `state` supported with its `Enter` and `Exit` handlers.
    #[must_use]
    pub fn state(mut self, state: ProtocolState, enter: H, exit: H) -> Self {
        self.supported.insert(state);
        self.handlers.push((state, ProtocolEvent::Enter, enter));
        self.handlers.push((state, ProtocolEvent::Exit, exit));
        self
    }

    /// Register `handler` for `event` in `state`.
    #[must_use]
    pub fn on(mut self, state: ProtocolState, event: ProtocolEvent, handler: H) -> Self {
        self.handlers.push((state, event, handler));
        self
    }

    /// Validate and build the machine.
    ///
    /// # Errors
    /// Returns `Error::Config` if the table is inconsistent.
    pub fn build(self) -> Result<InstrumentFsm<H>> {
        if !self.supported.contains(&self.initial) {
            return Err(Error::config(format!(
                "initial state {} is not a supported state",
                self.initial
            )));
        }

        let mut handlers = HashMap::with_capacity(self.handlers.len());
        for (state, event, handler) in self.handlers {
            if !self.supported.contains(&state) {
                return Err(Error::config(format!(
                    "handler for {event} registered in unsupported state {state}"
                )));
            }
            if handlers.insert((state, event), handler).is_some() {
                return Err(Error::config(format!(
                    "duplicate handler for {event} in state {state}"
                )));
            }
        }

        for state in &self.supported {
            for event in [ProtocolEvent::Enter, ProtocolEvent::Exit] {
                if !handlers.contains_key(&(*state, event)) {
                    return Err(Error::config(format!("state {state} has no {event} handler")));
                }
            }
        }

        Ok(InstrumentFsm {
            current: self.initial,
            supported: self.supported,
            handlers,
            history: VecDeque::with_capacity(MAX_TRANSITION_HISTORY),
        })
    }
}
