use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use log::debug;

/// Callback run when a state is entered or left.
pub type StateHook<C> = fn(&mut C);
/// Per-frame callback; returning a state switches to it.
pub type StateUpdate<S, C> = fn(&mut C) -> Option<S>;

struct StateHandlers<S, C> {
    enter: Option<StateHook<C>>,
    update: Option<StateUpdate<S, C>>,
    leave: Option<StateHook<C>>,
}

/// Named states over a context `C`.
///
/// There is no initial state: nothing runs until the first `switch_to`.
pub struct StateMachine<S, C> {
    states: HashMap<S, StateHandlers<S, C>>,
    current: Option<S>,
}

impl<S, C> Default for StateMachine<S, C> {
    fn default() -> Self {
        Self {
            states: HashMap::new(),
            current: None,
        }
    }
}

impl<S: Copy + Eq + Hash + Debug, C> StateMachine<S, C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        state: S,
        enter: Option<StateHook<C>>,
        update: Option<StateUpdate<S, C>>,
        leave: Option<StateHook<C>>,
    ) {
        self.states.insert(state, StateHandlers { enter, update, leave });
    }

    pub fn current(&self) -> Option<S> {
        self.current
    }

    /// Leaves the current state, if any, and enters `state`.
    ///
    /// Panics when `state` was never added.
    pub fn switch_to(&mut self, state: S, context: &mut C) {
        assert!(
            self.states.contains_key(&state),
            "switching to unregistered state {state:?}"
        );

        if let Some(leave) = self
            .current
            .and_then(|current| self.states.get(&current))
            .and_then(|handlers| handlers.leave)
        {
            leave(context);
        }

        debug!("state {:?} -> {state:?}", self.current);
        self.current = Some(state);
        if let Some(enter) = self.states.get(&state).and_then(|h| h.enter) {
            enter(context);
        }
    }

    /// Runs the current state's update and follows the transition it asks for.
    pub fn update(&mut self, context: &mut C) {
        let Some(update) = self
            .current
            .and_then(|current| self.states.get(&current))
            .and_then(|handlers| handlers.update)
        else {
            return;
        };
        if let Some(next) = update(context) {
            self.switch_to(next, context);
        }
    }

    /// Leaves the current state without entering another.
    pub fn shutdown(&mut self, context: &mut C) {
        if let Some(leave) = self
            .current
            .take()
            .and_then(|current| self.states.get(&current))
            .and_then(|handlers| handlers.leave)
        {
            leave(context);
        }
    }
}
