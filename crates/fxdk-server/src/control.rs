//! Control surface messages and the in-process control bus
//!
//! Commands arrive from the UI collaborator and events flow back to it. The bus is transport
//! agnostic: the stdio transport in this crate, or tests, subscribe to its events.
//!
//! Each subscriber gets its own ordered queue. Only `output` lines are ever dropped when a
//! subscriber falls behind; state, clear-output and resource-state events are always delivered.

use fxdk_core::{HandlerSet, RelinkRequest, ResourceCommand, ServerState, StartRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Default number of queued output lines per subscriber; output can arrive in bursts
const EVENT_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Command sent to the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ControlCommand {
    /// Re-broadcast the current state
    AckState,
    Start(StartRequest),
    Stop,
    RestartResource { name: String },
    StopResource { name: String },
    StartResource { name: String },
    RequestResourcesState,
    RefreshResources(StartRequest),
    RelinkResources(RelinkRequest),
}

/// Event emitted by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ControlEvent {
    State { state: ServerState },
    /// One line of server output
    Output { line: String },
    /// Issued at the start of every launch
    ClearOutput,
    /// Resource state snapshot from the bridge resource
    ResourcesState { payload: Value },
}

/// In-process dispatcher for control events and resource commands
#[derive(Clone)]
pub struct ControlBus {
    subscribers: Arc<Mutex<Vec<Weak<Subscriber>>>>,
    output_capacity: usize,
    commands: HandlerSet<ResourceCommand>,
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    /// `capacity` bounds the output lines queued per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            output_capacity: capacity.max(1),
            commands: HandlerSet::new(),
        }
    }

    /// Subscribe to supervisor events emitted from now on
    pub fn subscribe(&self) -> EventReceiver {
        let subscriber = Arc::new(Subscriber {
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            output_capacity: self.output_capacity,
        });
        lock(&self.subscribers).push(Arc::downgrade(&subscriber));
        EventReceiver { subscriber }
    }

    /// Handlers for resource commands; IPC connections register here
    pub fn commands(&self) -> &HandlerSet<ResourceCommand> {
        &self.commands
    }

    /// Publish a resource command, returning how many handlers received it
    pub fn send_command(&self, command: ResourceCommand) -> usize {
        let delivered = self.commands.emit(&command);
        if delivered == 0 {
            debug!("No handler for {:?}", command);
        }
        delivered
    }

    pub fn emit_state(&self, state: ServerState) {
        self.emit(ControlEvent::State { state });
    }

    pub fn emit_output(&self, line: impl Into<String>) {
        self.emit(ControlEvent::Output { line: line.into() });
    }

    pub fn clear_output(&self) {
        self.emit(ControlEvent::ClearOutput);
    }

    pub fn emit_resources_state(&self, payload: Value) {
        self.emit(ControlEvent::ResourcesState { payload });
    }

    fn emit(&self, event: ControlEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|weak| match weak.upgrade() {
            Some(subscriber) => {
                subscriber.push(event.clone());
                true
            }
            None => false,
        });
    }
}

#[derive(Default)]
struct Queue {
    events: VecDeque<ControlEvent>,
    queued_output: usize,
    dropped_output: u64,
}

struct Subscriber {
    queue: Mutex<Queue>,
    notify: Notify,
    output_capacity: usize,
}

impl Subscriber {
    fn push(&self, event: ControlEvent) {
        {
            let mut queue = lock(&self.queue);
            if matches!(event, ControlEvent::Output { .. }) {
                if queue.queued_output >= self.output_capacity {
                    let oldest = queue
                        .events
                        .iter()
                        .position(|e| matches!(e, ControlEvent::Output { .. }));
                    if let Some(index) = oldest {
                        queue.events.remove(index);
                        queue.queued_output -= 1;
                        queue.dropped_output += 1;
                    }
                }
                queue.queued_output += 1;
            }
            queue.events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Receiving end of a bus subscription. Unsubscribes on drop.
pub struct EventReceiver {
    subscriber: Arc<Subscriber>,
}

impl EventReceiver {
    /// Wait for the next event
    pub async fn recv(&mut self) -> ControlEvent {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            // A push between the check and here leaves a permit, so no wakeup is lost
            self.subscriber.notify.notified().await;
        }
    }

    /// Next queued event, if any
    pub fn try_recv(&mut self) -> Option<ControlEvent> {
        let mut queue = lock(&self.subscriber.queue);
        if queue.dropped_output > 0 {
            warn!(
                "Event subscriber fell behind, dropped {} output lines",
                queue.dropped_output
            );
            queue.dropped_output = 0;
        }
        let event = queue.events.pop_front()?;
        if matches!(event, ControlEvent::Output { .. }) {
            queue.queued_output -= 1;
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_parse_start_command() {
        let json = r#"{"command":"start","projectPath":"/p","enabledResourcePaths":["/p/res/a","/p/res/b"]}"#;
        let command: ControlCommand = serde_json::from_str(json).unwrap();
        assert_eq!(
            command,
            ControlCommand::Start(StartRequest {
                project_path: PathBuf::from("/p"),
                enabled_resource_paths: vec![PathBuf::from("/p/res/a"), PathBuf::from("/p/res/b")],
            })
        );
    }

    #[test]
    fn test_parse_resource_commands() {
        let command: ControlCommand =
            serde_json::from_str(r#"{"command":"restartResource","name":"chat"}"#).unwrap();
        assert_eq!(command, ControlCommand::RestartResource { name: "chat".into() });

        let command: ControlCommand = serde_json::from_str(r#"{"command":"ackState"}"#).unwrap();
        assert_eq!(command, ControlCommand::AckState);

        let command: ControlCommand = serde_json::from_str(
            r#"{"command":"relinkResources","projectPath":"/p","resourcePaths":[],"restartResourcesWithPath":"/p/res"}"#,
        )
        .unwrap();
        match command {
            ControlCommand::RelinkResources(request) => {
                assert_eq!(request.restart_resources_with_path, Some(PathBuf::from("/p/res")));
            }
            other => panic!("Wrong command: {:?}", other),
        }
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(ControlEvent::State { state: ServerState::Booting }).unwrap();
        assert_eq!(json, json!({"event": "state", "state": "booting"}));

        let json = serde_json::to_value(ControlEvent::ClearOutput).unwrap();
        assert_eq!(json, json!({"event": "clearOutput"}));
    }

    #[tokio::test]
    async fn test_bus_delivers_events_in_order() {
        let bus = ControlBus::new();
        let mut rx = bus.subscribe();

        bus.clear_output();
        bus.emit_output("hello");
        bus.emit_state(ServerState::Up);

        assert_eq!(rx.recv().await, ControlEvent::ClearOutput);
        assert_eq!(rx.recv().await, ControlEvent::Output { line: "hello".into() });
        assert_eq!(rx.recv().await, ControlEvent::State { state: ServerState::Up });
    }

    #[test]
    fn test_output_burst_keeps_state_events() {
        let bus = ControlBus::new();
        let mut rx = bus.subscribe();

        bus.emit_state(ServerState::Booting);
        for i in 0..1100 {
            bus.emit_output(format!("line {}", i));
        }
        bus.emit_state(ServerState::Up);

        let mut states = Vec::new();
        let mut lines = Vec::new();
        while let Some(event) = rx.try_recv() {
            match event {
                ControlEvent::State { state } => states.push(state),
                ControlEvent::Output { line } => lines.push(line),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(states, [ServerState::Booting, ServerState::Up]);
        assert_eq!(lines.len(), EVENT_CAPACITY);
        assert_eq!(lines.first().map(String::as_str), Some("line 76"));
        assert_eq!(lines.last().map(String::as_str), Some("line 1099"));
    }

    #[test]
    fn test_overflow_keeps_event_order() {
        let bus = ControlBus::with_capacity(2);
        let mut rx = bus.subscribe();

        bus.emit_output("a");
        bus.clear_output();
        bus.emit_output("b");
        bus.emit_output("c");

        assert_eq!(rx.try_recv(), Some(ControlEvent::ClearOutput));
        assert_eq!(rx.try_recv(), Some(ControlEvent::Output { line: "b".into() }));
        assert_eq!(rx.try_recv(), Some(ControlEvent::Output { line: "c".into() }));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_later_event() {
        let bus = ControlBus::new();
        let mut rx = bus.subscribe();

        let sender = bus.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            sender.emit_state(ServerState::Down);
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, ControlEvent::State { state: ServerState::Down });
    }

    #[test]
    fn test_dropped_receiver_unsubscribes() {
        let bus = ControlBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit_output("nobody listens");
        assert!(lock(&bus.subscribers).is_empty());
    }

    #[test]
    fn test_command_without_handlers() {
        let bus = ControlBus::new();
        assert_eq!(bus.send_command(ResourceCommand::RequestState), 0);
    }
}
