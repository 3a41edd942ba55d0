//! Server lifecycle state machine
//!
//! | From         | Event           | To      |
//! |--------------|-----------------|---------|
//! | down         | start issued    | booting |
//! | booting      | inbound `ready` | up      |
//! | booting / up | process exits   | down    |
//!
//! Every transition is broadcast on the control bus.

use crate::control::ControlBus;
use fxdk_core::ServerState;
use fxdk_ipc::InboundSink;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Single source of truth for the server state
pub struct Lifecycle {
    state: Mutex<ServerState>,
    bus: ControlBus,
}

impl Lifecycle {
    pub fn new(bus: ControlBus) -> Self {
        Self {
            state: Mutex::new(ServerState::Down),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn state(&self) -> ServerState {
        *self.lock()
    }

    /// Move to `next` and broadcast it
    pub fn to_state(&self, next: ServerState) {
        let mut state = self.lock();
        let previous = std::mem::replace(&mut *state, next);
        info!("Server state {} -> {}", previous, next);
        // Broadcast under the lock so observers see transitions in order
        self.bus.emit_state(next);
    }

    /// Broadcast the current state without changing it
    pub fn ack(&self) {
        let state = self.lock();
        self.bus.emit_state(*state);
    }
}

impl InboundSink for Lifecycle {
    fn ready(&self) {
        let mut state = self.lock();
        if *state != ServerState::Booting {
            warn!("Bridge reported ready while {}, ignoring", *state);
            return;
        }
        *state = ServerState::Up;
        info!("Server state booting -> up");
        self.bus.emit_state(ServerState::Up);
    }

    fn resources_state(&self, payload: Value) {
        self.bus.emit_resources_state(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlEvent, EventReceiver};

    fn states(rx: &mut EventReceiver) -> Vec<ServerState> {
        let mut out = Vec::new();
        while let Some(event) = rx.try_recv() {
            if let ControlEvent::State { state } = event {
                out.push(state);
            }
        }
        out
    }

    #[test]
    fn test_ready_while_booting_broadcasts_once() {
        let bus = ControlBus::new();
        let mut rx = bus.subscribe();
        let lifecycle = Lifecycle::new(bus);

        lifecycle.to_state(ServerState::Booting);
        lifecycle.ready();
        lifecycle.ready();

        assert_eq!(lifecycle.state(), ServerState::Up);
        assert_eq!(states(&mut rx), [ServerState::Booting, ServerState::Up]);
    }

    #[test]
    fn test_ready_while_down_is_ignored() {
        let bus = ControlBus::new();
        let mut rx = bus.subscribe();
        let lifecycle = Lifecycle::new(bus);

        lifecycle.ready();
        assert_eq!(lifecycle.state(), ServerState::Down);
        assert!(states(&mut rx).is_empty());
    }

    #[test]
    fn test_ack_repeats_current_state() {
        let bus = ControlBus::new();
        let mut rx = bus.subscribe();
        let lifecycle = Lifecycle::new(bus);

        lifecycle.ack();
        lifecycle.to_state(ServerState::Booting);
        lifecycle.ack();
        assert_eq!(
            states(&mut rx),
            [ServerState::Down, ServerState::Booting, ServerState::Booting]
        );
    }

    #[test]
    fn test_resources_state_is_forwarded() {
        let bus = ControlBus::new();
        let mut rx = bus.subscribe();
        let lifecycle = Lifecycle::new(bus);

        lifecycle.resources_state(serde_json::json!({"chat": "started"}));
        assert_eq!(
            rx.try_recv().unwrap(),
            ControlEvent::ResourcesState {
                payload: serde_json::json!({"chat": "started"})
            }
        );
    }
}
