// -----------------------------------------------------------------------------
// Rust kiln control daemon
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA  02111-1307  USA
//
// Module authors:
//   Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! Fan-out of state snapshots to observers (transport connections,
//! recorders, ...).

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use log::*;
use parking_lot::Mutex;
use serde_json::Value;


pub type ObserverId = u64;

/// A party interested in state snapshots.  Sends must not block for
/// long: an observer that fails a send is dropped, never awaited.
pub trait Observer: Send {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
    fn is_alive(&self) -> bool {
        true
    }
}

/// The observer registry.  Held via `Arc` by the run loop; observers
/// themselves never hold references back into the controller.
pub struct Telemetry {
    observers: Mutex<HashMap<ObserverId, Box<dyn Observer>>>,
    next_id: AtomicU64,
    backlog: Mutex<Option<Value>>,
}

impl Telemetry {
    pub fn new() -> Telemetry {
        Telemetry {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            backlog: Mutex::new(None),
        }
    }

    /// Register an observer.  It immediately receives the backlog of
    /// the in-progress run, if any, and every broadcast afterwards.
    pub fn add_observer(&self, mut observer: Box<dyn Observer>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Some(backlog) = &*self.backlog.lock() {
            if let Err(e) = observer.send(backlog.to_string().as_bytes()) {
                warn!("observer {} failed during backlog, not registering: {}", id, e);
                return id;
            }
        }
        self.observers.lock().insert(id, observer);
        debug!("observer {} registered", id);
        id
    }

    pub fn remove_observer(&self, id: ObserverId) {
        self.observers.lock().remove(&id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Replace the backlog sent to newly joining observers; `None`
    /// outside of a run.
    pub fn set_backlog(&self, backlog: Option<Value>) {
        *self.backlog.lock() = backlog;
    }

    /// Send one snapshot to all observers.  Failures are collected
    /// during iteration and the failed observers are removed from the
    /// set afterwards; the broadcast itself never fails.
    pub fn broadcast(&self, snapshot: &Value) {
        let data = snapshot.to_string().into_bytes();
        let mut observers = self.observers.lock();
        let mut dead = Vec::new();
        for (&id, observer) in observers.iter_mut() {
            if !observer.is_alive() {
                dead.push(id);
                continue;
            }
            if let Err(e) = observer.send(&data) {
                info!("dropping observer {}: {}", id, e);
                dead.push(id);
            }
        }
        for id in dead {
            observers.remove(&id);
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
