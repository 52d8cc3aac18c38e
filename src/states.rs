use std::collections::{HashMap, HashSet};

use crate::error::Error;

/// Directed multigraph of allowed action transitions, with a cursor tracking
/// the connection's current state.
#[derive(Debug, Clone, Default)]
pub struct StateGraph {
    states: HashMap<String, HashSet<String>>,
    current: String,
}

impl StateGraph {
    pub fn new() -> Self {
        StateGraph::default()
    }

    /// Create `state` if absent and add each of `transitions` as a permitted
    /// next state. Calling this twice with the same arguments is
    /// indistinguishable from calling it once.
    pub fn add_state(&mut self, state: &str, transitions: &[&str]) {
        let entry = self.states.entry(state.to_string()).or_default();
        for transition in transitions {
            entry.insert((*transition).to_string());
        }
    }

    /// Set the cursor. Also used to rewind a connection after a rejected
    /// rendezvous so it may retry.
    pub fn set_start(&mut self, state: &str) {
        self.current = state.to_string();
    }

    pub fn current_state(&self) -> &str {
        &self.current
    }

    pub fn is_valid_next(&self, next: &str) -> bool {
        self.is_valid_next_with_error(next).is_ok()
    }

    /// Like [`is_valid_next`](Self::is_valid_next) but distinguishes a cursor
    /// that is not in the graph from a transition that is not permitted.
    pub fn is_valid_next_with_error(&self, next: &str) -> Result<(), Error> {
        let transitions = self.states.get(&self.current).ok_or(Error::UnknownState)?;
        if !transitions.contains(next) {
            return Err(Error::InvalidNextState);
        }
        Ok(())
    }

    /// Move the cursor to `next` if the transition is permitted. On failure
    /// the cursor is left exactly where it was.
    pub fn validate_and_advance(&mut self, next: &str) -> Result<(), Error> {
        self.is_valid_next_with_error(next)?;
        self.current = next.to_string();
        Ok(())
    }
}

/// The relay server's connection lifecycle: authenticate, announce a slot,
/// optionally exchange address hints, signal readiness. After `go` nothing
/// further is accepted.
pub fn server_states() -> StateGraph {
    let mut graph = StateGraph::new();
    graph.add_state("start", &["pake"]);
    graph.add_state("pake", &["hello"]);
    graph.add_state("hello", &["external_ips", "go"]);
    graph.add_state("external_ips", &["go"]);
    graph.set_start("start");
    graph
}

/// The endpoint-side transfer lifecycle. Repeated `finfo` admits multiple
/// files in one session.
pub fn sender_states() -> StateGraph {
    let mut graph = StateGraph::new();
    graph.add_state("start", &["pake"]);
    graph.add_state("pake", &["finfo"]);
    graph.add_state("finfo", &["finfo", "file-chunk", "file-done"]);
    graph.add_state("file-chunk", &["file-chunk", "file-done"]);
    graph.add_state("file-done", &["finfo", "done"]);
    graph.set_start("start");
    graph
}
