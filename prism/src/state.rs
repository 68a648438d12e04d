//! Connection state machine. Both endpoints use the same states with
//! mirrored roles; the supervisor owns the cell, the tasks observe it.

use crate::logging;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    New,
    Handshaking,
    ResourceExchange,
    Streaming,
    Draining,
    Closed,
}

impl ConnectionState {
    /// Legal transitions. Draining is reachable from every live state;
    /// Closed is terminal.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, to) {
            (New, Handshaking) => true,
            (Handshaking, ResourceExchange) => true,
            (ResourceExchange, Streaming) => true,
            // A new model mid-session re-enters the exchange sub-protocol.
            (Streaming, ResourceExchange) => true,
            (Closed, _) => false,
            (Draining, Closed) => true,
            (Draining, Draining) => true,
            (_, Draining) => true,
            _ => false,
        }
    }
}

pub struct StateCell {
    state: Mutex<ConnectionState>,
    cv: Condvar,
    log: logging::Logger,
}

impl StateCell {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> StateCell {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "state")),
            None => logging::discard(),
        };

        StateCell {
            state: Mutex::new(ConnectionState::New),
            cv: Condvar::new(),
            log,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock().expect("state cell poisoned")
    }

    /// Applies a transition if it is legal. Illegal requests are logged and
    /// leave the state unchanged.
    pub fn transition(&self, to: ConnectionState) -> bool {
        let mut state = self.state.lock().expect("state cell poisoned");

        if !state.can_transition(to) {
            logging::warn!(self.log, "illegal state transition ignored";
                           "from" => ?*state, "to" => ?to);
            return false;
        }

        logging::debug!(self.log, "state transition"; "from" => ?*state, "to" => ?to);
        *state = to;
        self.cv.notify_all();
        true
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        matches!(self.get(), ConnectionState::Draining | ConnectionState::Closed)
    }

    /// Waits until the cell reaches `target` (true) or the timeout passes
    /// (false).
    pub fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut state = self.state.lock().expect("state cell poisoned");
        let deadline = std::time::Instant::now() + timeout;

        while *state != target {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("state cell poisoned");
            state = guard;
        }

        true
    }
}
