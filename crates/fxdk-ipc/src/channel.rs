//! Local IPC channel with the bridge resource running inside the server
//!
//! The channel listens on a well-known local socket name. Only one peer is meaningful at a
//! time: each accepted connection replaces the recorded peer. Every connection registers its
//! own forwarding handlers for resource commands; they are released when the connection
//! closes, so a reconnecting bridge never sees duplicate directives.

use crate::protocol::{Directive, Notice, decode_notice, encode_frame, preview};
use crate::transport::{AsyncReader, AsyncWriter, LineReader, LineWriter};
use fxdk_core::{FxdkError, HandlerSet, ResourceCommand, Result, SubscriptionScope};
use interprocess::local_socket::tokio::{Listener, Stream, prelude::*};
use interprocess::local_socket::{
    GenericFilePath, GenericNamespaced, ListenerOptions, NameType, ToFsName, ToNsName,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// Receiver of inbound notices from the bridge resource
pub trait InboundSink: Send + Sync {
    /// Bridge resource finished booting
    fn ready(&self);

    /// Resource state snapshot from the bridge resource
    fn resources_state(&self, payload: Value);
}

/// The currently recorded peer
struct Peer {
    id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

struct Shared {
    name: String,
    commands: HandlerSet<ResourceCommand>,
    sink: Arc<dyn InboundSink>,
    peer: Mutex<Option<Peer>>,
    next_connection: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
    connections: Mutex<Vec<AbortHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn dispatch(&self, id: u64, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        debug!(
            "[Server→Supervisor] #{} len={} json={}",
            id,
            trimmed.len(),
            preview(trimmed)
        );

        match decode_notice(trimmed) {
            Ok(Notice::Ready) => self.sink.ready(),
            Ok(Notice::State(payload)) => self.sink.resources_state(payload),
            Ok(Notice::Unknown { message_type, .. }) => {
                debug!("Ignoring IPC message of type {:?}", message_type);
            }
            Err(e) => {
                error!("Dropping malformed IPC message from #{}: {}", id, e);
            }
        }
    }

    /// Forget the peer, unless a newer connection has already replaced it
    fn clear_peer(&self, id: u64) {
        let mut peer = lock(&self.peer);
        if peer.as_ref().is_some_and(|p| p.id == id) {
            *peer = None;
        }
    }
}

/// IPC channel to the bridge resource
#[derive(Clone)]
pub struct IpcChannel {
    shared: Arc<Shared>,
}

impl IpcChannel {
    /// Create a closed channel.
    ///
    /// `commands` is the control bus command set that connection handlers subscribe to;
    /// `sink` receives inbound notices.
    pub fn new(
        name: impl Into<String>,
        commands: HandlerSet<ResourceCommand>,
        sink: Arc<dyn InboundSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                commands,
                sink,
                peer: Mutex::new(None),
                next_connection: AtomicU64::new(1),
                listener: Mutex::new(None),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Local socket name the channel listens on
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the listener is running
    pub fn is_open(&self) -> bool {
        lock(&self.shared.listener)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Whether a peer is currently connected
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.peer).is_some()
    }

    /// Start listening for the bridge resource. No-op if already listening.
    pub fn open(&self) -> Result<()> {
        let mut listener_task = lock(&self.shared.listener);
        if let Some(task) = listener_task.as_ref() {
            if !task.is_finished() {
                debug!("IPC channel {} already open", self.shared.name);
                return Ok(());
            }
        }

        let listener = bind(&self.shared.name)
            .map_err(|e| FxdkError::IpcError(format!("Failed to bind {}: {}", self.shared.name, e)))?;
        info!("IPC channel listening on {}", self.shared.name);

        let channel = self.clone();
        *listener_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => {
                        let (reader, writer) = stream.split();
                        channel.attach(reader, writer);
                    }
                    Err(e) => {
                        error!("Error accepting IPC connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop listening and drop every connection along with its handlers
    pub fn close(&self) {
        if let Some(task) = lock(&self.shared.listener).take() {
            task.abort();
            info!("IPC channel {} closed", self.shared.name);
        }

        // Aborting drops each connection's subscription scope, which releases its handlers.
        for connection in lock(&self.shared.connections).drain(..) {
            connection.abort();
        }

        lock(&self.shared.peer).take();
    }

    /// Send `[type, payload]` to the peer.
    ///
    /// Sending without a connected peer is expected (e.g. before `ready`): the message is
    /// logged and dropped.
    pub fn send(&self, message_type: &str, payload: Option<Value>) {
        let guard = lock(&self.shared.peer);
        let Some(peer) = guard.as_ref() else {
            debug!("No IPC peer connected, dropping {:?}", message_type);
            return;
        };

        let data = match encode_frame(message_type, payload.as_ref()) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode IPC message {:?}: {}", message_type, e);
                return;
            }
        };

        let json_preview = preview(&String::from_utf8_lossy(&data));
        debug!(
            "[Supervisor→Server] #{} len={} json={}",
            peer.id,
            data.len(),
            json_preview.trim_end()
        );

        if peer.outbound.send(data).is_err() {
            debug!("IPC peer #{} is closing, dropping {:?}", peer.id, message_type);
        }
    }

    /// Send a typed directive to the peer
    pub fn send_directive(&self, directive: &Directive) {
        self.send(directive.message_type(), directive.payload());
    }

    /// Serve one peer connection and record it as the current peer.
    ///
    /// The forwarding handlers are registered before this returns. The returned task
    /// completes when the peer closes the stream.
    pub fn attach<R, W>(&self, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.shared.next_connection.fetch_add(1, Ordering::SeqCst);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let mut scope = SubscriptionScope::new(&self.shared.commands);
        scope.subscribe(forwarder(id, outbound.clone(), |c| {
            matches!(c, ResourceCommand::Restart(_))
        }));
        scope.subscribe(forwarder(id, outbound.clone(), |c| {
            matches!(c, ResourceCommand::Stop(_))
        }));
        scope.subscribe(forwarder(id, outbound.clone(), |c| {
            matches!(c, ResourceCommand::Start(_))
        }));
        scope.subscribe(forwarder(id, outbound.clone(), |c| {
            matches!(c, ResourceCommand::RequestState)
        }));

        if let Some(previous) = lock(&self.shared.peer).replace(Peer { id, outbound }) {
            info!("IPC peer #{} replaces #{}", id, previous.id);
        } else {
            info!("IPC peer #{} connected", id);
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let writer_task = tokio::spawn(write_loop(id, LineWriter(writer), outbound_rx));

            let mut reader = LineReader::new(reader);
            loop {
                match reader.read_message().await {
                    Ok(Some(line)) => shared.dispatch(id, &line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("IPC peer #{} read failed: {}", id, e);
                        break;
                    }
                }
            }

            shared.clear_peer(id);
            scope.release();
            writer_task.abort();
            info!("IPC peer #{} disconnected", id);
        });

        let mut connections = lock(&self.shared.connections);
        connections.retain(|connection| !connection.is_finished());
        connections.push(handle.abort_handle());

        handle
    }
}

/// Connect to a channel the way the bridge resource does
pub async fn connect(name: &str) -> Result<Stream> {
    let result = if GenericNamespaced::is_supported() {
        let name = name
            .to_ns_name::<GenericNamespaced>()
            .map_err(|e| FxdkError::IpcError(format!("Invalid socket name {}: {}", name, e)))?;
        Stream::connect(name).await
    } else {
        let path = std::env::temp_dir().join(name);
        let name = path
            .as_path()
            .to_fs_name::<GenericFilePath>()
            .map_err(|e| FxdkError::IpcError(format!("Invalid socket path {:?}: {}", path, e)))?;
        Stream::connect(name).await
    };
    result.map_err(|e| FxdkError::IpcError(format!("Failed to connect: {}", e)))
}

/// Bind the listener: a namespaced name where supported, a temp-dir socket file otherwise
fn bind(name: &str) -> std::io::Result<Listener> {
    if GenericNamespaced::is_supported() {
        let name = name.to_ns_name::<GenericNamespaced>()?;
        ListenerOptions::new().name(name).create_tokio()
    } else {
        let path = std::env::temp_dir().join(name);
        if path.exists() {
            debug!("Removing stale socket {:?}", path);
            std::fs::remove_file(&path)?;
        }
        let name = path.as_path().to_fs_name::<GenericFilePath>()?;
        ListenerOptions::new().name(name).create_tokio()
    }
}

/// Handler that forwards matching resource commands to one connection
fn forwarder(
    id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    accepts: fn(&ResourceCommand) -> bool,
) -> impl Fn(&ResourceCommand) + Send + Sync + 'static {
    move |command| {
        if !accepts(command) {
            return;
        }

        let directive = Directive::from(command);
        match encode_frame(directive.message_type(), directive.payload().as_ref()) {
            Ok(data) => {
                debug!("[Supervisor→Server] #{} {:?}", id, directive);
                if outbound.send(data).is_err() {
                    debug!("IPC peer #{} is closing, dropping {:?}", id, directive);
                }
            }
            Err(e) => error!("Failed to encode {:?}: {}", directive, e),
        }
    }
}

async fn write_loop<W: AsyncWriter>(
    id: u64,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = writer.write_message(&data).await {
            warn!("IPC peer #{} write failed: {}", id, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxdk_core::ServerState;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    #[derive(Default)]
    struct RecordingSink {
        ready: AtomicUsize,
        states: Mutex<Vec<Value>>,
    }

    impl InboundSink for RecordingSink {
        fn ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn resources_state(&self, payload: Value) {
            lock(&self.states).push(payload);
        }
    }

    struct TestPeer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<()>,
    }

    impl TestPeer {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn next_line(&mut self) -> Option<String> {
            tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
        }

        async fn close(mut self) {
            self.writer.shutdown().await.unwrap();
            tokio::time::timeout(Duration::from_secs(2), self.task)
                .await
                .expect("connection did not finish")
                .unwrap();
        }
    }

    fn channel() -> (IpcChannel, HandlerSet<ResourceCommand>, Arc<RecordingSink>) {
        let commands = HandlerSet::new();
        let sink = Arc::new(RecordingSink::default());
        let channel = IpcChannel::new("fxdk-test.sock", commands.clone(), sink.clone());
        (channel, commands, sink)
    }

    fn connect_peer(channel: &IpcChannel) -> TestPeer {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(theirs);
        let (client_read, client_write) = tokio::io::split(ours);
        let task = channel.attach(server_read, server_write);
        TestPeer {
            lines: BufReader::new(client_read).lines(),
            writer: client_write,
            task,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_send_without_peer_is_dropped() {
        let (channel, _, _) = channel();
        assert!(!channel.is_connected());
        channel.send("refresh", None);
        channel.send_directive(&Directive::Restart("chat".into()));
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (channel, _, _) = channel();
        let mut peer = connect_peer(&channel);
        assert!(channel.is_connected());

        channel.send_directive(&Directive::Refresh);
        channel.send("restart", Some(Value::String("chat".into())));

        assert_eq!(peer.next_line().await.as_deref(), Some("[\"refresh\",null]"));
        assert_eq!(peer.next_line().await.as_deref(), Some("[\"restart\",\"chat\"]"));
    }

    #[tokio::test]
    async fn test_inbound_dispatch() {
        let (channel, _, sink) = channel();
        let mut peer = connect_peer(&channel);

        peer.send(r#"["state",{"chat":"started"}]"#).await;
        peer.send(r#"["ready",null]"#).await;

        wait_until(|| sink.ready.load(Ordering::SeqCst) == 1).await;
        assert_eq!(*lock(&sink.states), vec![serde_json::json!({"chat": "started"})]);
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let (channel, _, sink) = channel();
        let mut peer = connect_peer(&channel);

        peer.send(r#"{"bad json"#).await;
        peer.send(r#"{"type":"ready"}"#).await;
        peer.send(r#"["state",[]]"#).await;

        wait_until(|| lock(&sink.states).len() == 1).await;
        assert_eq!(sink.ready.load(Ordering::SeqCst), 0);
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_connection_registers_forwarders() {
        let (channel, commands, _) = channel();
        let mut peer = connect_peer(&channel);
        assert_eq!(commands.len(), 4);

        commands.emit(&ResourceCommand::Restart("chat".into()));
        commands.emit(&ResourceCommand::Stop("map".into()));
        commands.emit(&ResourceCommand::Start("map".into()));
        commands.emit(&ResourceCommand::RequestState);

        assert_eq!(peer.next_line().await.as_deref(), Some("[\"restart\",\"chat\"]"));
        assert_eq!(peer.next_line().await.as_deref(), Some("[\"stop\",\"map\"]"));
        assert_eq!(peer.next_line().await.as_deref(), Some("[\"start\",\"map\"]"));
        assert_eq!(peer.next_line().await.as_deref(), Some("[\"state\",null]"));
    }

    #[tokio::test]
    async fn test_handlers_released_on_disconnect() {
        let (channel, commands, _) = channel();
        let first = connect_peer(&channel);
        assert_eq!(commands.len(), 4);

        first.close().await;
        assert_eq!(commands.len(), 0);
        assert!(!channel.is_connected());

        // Only the new connection's handlers fire
        let mut second = connect_peer(&channel);
        assert_eq!(commands.len(), 4);
        assert_eq!(commands.emit(&ResourceCommand::Restart("chat".into())), 4);

        assert_eq!(second.next_line().await.as_deref(), Some("[\"restart\",\"chat\"]"));
        second.writer.shutdown().await.unwrap();
        assert_eq!(second.next_line().await, None);
    }

    #[tokio::test]
    async fn test_old_peer_close_keeps_new_peer() {
        let (channel, commands, _) = channel();
        let first = connect_peer(&channel);
        let mut second = connect_peer(&channel);
        assert_eq!(commands.len(), 8);

        first.close().await;
        assert!(channel.is_connected());
        assert_eq!(commands.len(), 4);

        channel.send_directive(&Directive::Refresh);
        assert_eq!(second.next_line().await.as_deref(), Some("[\"refresh\",null]"));
    }

    #[tokio::test]
    async fn test_close_releases_live_connections() {
        let (channel, commands, _) = channel();
        let peer = connect_peer(&channel);
        assert_eq!(commands.len(), 4);

        channel.close();
        assert!(!channel.is_connected());
        let _ = peer.task.await;
        assert_eq!(commands.len(), 0);
    }

    #[tokio::test]
    async fn test_real_local_socket() {
        struct ReadyFlag(Mutex<ServerState>);
        impl InboundSink for ReadyFlag {
            fn ready(&self) {
                *lock(&self.0) = ServerState::Up;
            }
            fn resources_state(&self, _payload: Value) {}
        }

        let name = format!("fxdk-test-{}.sock", std::process::id());
        let flag = Arc::new(ReadyFlag(Mutex::new(ServerState::Booting)));
        let channel = IpcChannel::new(name.clone(), HandlerSet::new(), flag.clone());
        channel.open().unwrap();
        channel.open().unwrap();
        assert!(channel.is_open());

        let stream = connect(&name).await.unwrap();
        let (reader, mut writer) = stream.split();
        wait_until(|| channel.is_connected()).await;

        channel.send_directive(&Directive::Refresh);
        let mut lines = BufReader::new(reader).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("[\"refresh\",null]"));

        writer.write_all(b"[\"ready\",null]\n").await.unwrap();
        wait_until(|| *lock(&flag.0) == ServerState::Up).await;

        channel.close();
        assert!(!channel.is_open());
    }
}
