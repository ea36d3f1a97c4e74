//! Named-event state machines.
//!
//! A [`StateGraph`] is an immutable set of named states plus a transition
//! table keyed by `(state, event)`. Graphs are assembled once at startup via
//! [`StateGraphBuilder`], which validates referential integrity before any
//! machine is constructed against the graph.
//!
//! A [`StateMachine`] holds a current state within a graph and a list of
//! listeners. Firing an event that the current state does not recognize is a
//! safe no-op: callers that require strict transitions check the resulting
//! state themselves. This permits "try to stop, but if stop is not a legal
//! verb here, do nothing" semantics used throughout service supervision.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building a graph or resolving a state by name.
#[derive(Debug, Error)]
pub enum StateGraphError {
    /// A state was declared more than once.
    #[error("duplicate state: {0}")]
    DuplicateState(String),

    /// A transition or lookup referenced a state that does not exist.
    #[error("unknown state: {0}")]
    UnknownState(String),

    /// Two transitions from the same state share an event name.
    #[error("duplicate transition for event {event} from state {state}")]
    DuplicateTransition { state: String, event: String },
}

struct StateNode {
    name: String,
    /// Event name to target state index. Transition maps are tiny, so a
    /// linear scan over a Vec beats a HashMap here.
    edges: Vec<(String, usize)>,
}

/// An immutable transition graph over named states.
pub struct StateGraph {
    states: Vec<StateNode>,
    by_name: HashMap<String, usize>,
}

impl StateGraph {
    /// Start building a new graph.
    pub fn builder() -> StateGraphBuilder {
        StateGraphBuilder::default()
    }

    /// Check whether a state name exists in this graph.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    fn target(&self, state: usize, event: &str) -> Option<usize> {
        self.states[state]
            .edges
            .iter()
            .find(|(e, _)| e == event)
            .map(|&(_, to)| to)
    }

    fn name_of(&self, state: usize) -> &str {
        &self.states[state].name
    }
}

impl fmt::Debug for StateGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.states.iter().map(|s| s.name.as_str()).collect();
        f.debug_struct("StateGraph").field("states", &names).finish()
    }
}

/// Builder that collects states and transitions, then validates them.
#[derive(Default)]
pub struct StateGraphBuilder {
    states: Vec<String>,
    transitions: Vec<(String, String, String)>,
}

impl StateGraphBuilder {
    /// Declare a state.
    pub fn state(mut self, name: &str) -> Self {
        self.states.push(name.to_string());
        self
    }

    /// Declare a transition: firing `event` in `from` moves to `to`.
    pub fn transition(mut self, from: &str, event: &str, to: &str) -> Self {
        self.transitions
            .push((from.to_string(), event.to_string(), to.to_string()));
        self
    }

    /// Resolve all names and produce the immutable graph.
    ///
    /// Fails if any transition references an undeclared state, or if a state
    /// or `(state, event)` pair is declared twice.
    pub fn build(self) -> Result<Arc<StateGraph>, StateGraphError> {
        let mut by_name = HashMap::new();
        let mut states = Vec::with_capacity(self.states.len());
        for name in self.states {
            if by_name.insert(name.clone(), states.len()).is_some() {
                return Err(StateGraphError::DuplicateState(name));
            }
            states.push(StateNode {
                name,
                edges: Vec::new(),
            });
        }

        for (from, event, to) in self.transitions {
            let from_ix = *by_name
                .get(&from)
                .ok_or_else(|| StateGraphError::UnknownState(from.clone()))?;
            let to_ix = *by_name
                .get(&to)
                .ok_or_else(|| StateGraphError::UnknownState(to.clone()))?;
            if states[from_ix].edges.iter().any(|(e, _)| *e == event) {
                return Err(StateGraphError::DuplicateTransition { state: from, event });
            }
            states[from_ix].edges.push((event, to_ix));
        }

        Ok(Arc::new(StateGraph { states, by_name }))
    }
}

/// A completed transition, passed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The event that fired.
    pub event: String,
    /// State before the transition.
    pub from: String,
    /// State after the transition.
    pub to: String,
}

type ListenerFn = Box<dyn Fn(&Transition) + Send>;

/// Current-state holder plus event dispatch and listener notification.
pub struct StateMachine {
    graph: Arc<StateGraph>,
    current: usize,
    /// `(event filter, callback)`; a `None` filter fires on any transition.
    listeners: Vec<(Option<String>, ListenerFn)>,
}

impl StateMachine {
    /// Create a machine positioned at `initial` within `graph`.
    pub fn new(graph: Arc<StateGraph>, initial: &str) -> Result<Self, StateGraphError> {
        let current = graph
            .index_of(initial)
            .ok_or_else(|| StateGraphError::UnknownState(initial.to_string()))?;
        Ok(Self {
            graph,
            current,
            listeners: Vec::new(),
        })
    }

    /// Name of the current state.
    pub fn state(&self) -> &str {
        self.graph.name_of(self.current)
    }

    /// Check whether the machine is currently in the named state.
    pub fn is(&self, name: &str) -> bool {
        self.state() == name
    }

    /// The graph this machine was constructed against.
    pub fn graph(&self) -> &Arc<StateGraph> {
        &self.graph
    }

    /// Fire an event.
    ///
    /// If the current state has a transition for `event`, moves to the target
    /// state, then synchronously invokes every listener registered for that
    /// event plus every any-transition listener, in registration order,
    /// before returning. If not, the call is a safe no-op and returns `None`.
    pub fn transition(&mut self, event: &str) -> Option<Transition> {
        let to = self.graph.target(self.current, event)?;
        let record = Transition {
            event: event.to_string(),
            from: self.graph.name_of(self.current).to_string(),
            to: self.graph.name_of(to).to_string(),
        };
        self.current = to;
        for (filter, listener) in &self.listeners {
            if filter.as_deref().map_or(true, |e| e == event) {
                listener(&record);
            }
        }
        Some(record)
    }

    /// Register a listener for a specific event (`Some(event)`) or for any
    /// transition (`None`).
    pub fn listen(&mut self, event: Option<&str>, listener: ListenerFn) {
        self.listeners.push((event.map(str::to_string), listener));
    }

    /// Remove all registered listeners. Used when one entity's machine is
    /// taken over by a successor.
    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Set the current state by name without firing any event or listener.
    ///
    /// This is how persisted state is mapped back onto the canonical graph;
    /// an unrecognized name is a restore error for the calling entity.
    pub fn force_state(&mut self, name: &str) -> Result<(), StateGraphError> {
        self.current = self
            .graph
            .index_of(name)
            .ok_or_else(|| StateGraphError::UnknownState(name.to_string()))?;
        Ok(())
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
