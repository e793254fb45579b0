//! Per-key single-flight reservations
//!
//! Within a node, at most one worker may parse a given L1 key at a time: on a
//! lookup miss the first worker inserts a reservation, later workers block on
//! it, and the completer publishes the result (to the cache) and wakes the
//! waiters. A waiter that times out abandons only its own wait; the primary
//! parse is never cancelled by waiters and carries its own timeout.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Outcome of [`SingleFlight::begin`]
pub enum Begin {
    /// This worker holds the reservation and must parse, then call `complete`
    Leader,
    /// Another worker completed the key while we waited; re-probe the cache
    Completed,
    /// The wait timed out; the caller handles its document as timed out
    TimedOut,
}

#[derive(Default)]
struct Flight {
    state: Mutex<bool>, // true once completed
    cond: Condvar,
}

/// Node-wide reservation table
#[derive(Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<Vec<u8>, Arc<Flight>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `key` or wait for the current holder.
    ///
    /// Returns [`Begin::Leader`] when the caller now owns the reservation.
    /// Waiting callers block up to `wait_timeout` for the leader to publish.
    pub fn begin(&self, key: &[u8], wait_timeout: Duration) -> Begin {
        let flight = {
            let mut map = self.inflight.lock().unwrap();
            match map.get(key) {
                None => {
                    map.insert(key.to_vec(), Arc::new(Flight::default()));
                    return Begin::Leader;
                }
                Some(flight) => Arc::clone(flight),
            }
        };

        let done = flight.state.lock().unwrap();
        let (done, wait) = flight
            .cond
            .wait_timeout_while(done, wait_timeout, |completed| !*completed)
            .unwrap();
        if *done {
            Begin::Completed
        } else if wait.timed_out() {
            Begin::TimedOut
        } else {
            Begin::Completed
        }
    }

    /// Release the reservation and wake all waiters. Leader-only.
    ///
    /// Called after the result has been published (or after the leader's
    /// parse failed; waiters re-probe and elect a new leader either way).
    pub fn complete(&self, key: &[u8]) {
        let flight = {
            let mut map = self.inflight.lock().unwrap();
            map.remove(key)
        };
        if let Some(flight) = flight {
            let mut done = flight.state.lock().unwrap();
            *done = true;
            flight.cond.notify_all();
        }
    }
}
