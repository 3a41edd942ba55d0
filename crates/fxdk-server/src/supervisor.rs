//! Server process supervisor
//!
//! Owns the external server process, links project resources into its working directory and
//! drives the lifecycle state machine. IPC directives go through the channel, which silently
//! drops them while the bridge resource is not connected.

use crate::config::SupervisorConfig;
use crate::control::{ControlBus, ControlCommand};
use crate::launch::{ExecutableResolver, server_args};
use crate::lifecycle::Lifecycle;
use crate::linker::{LinkReport, ResourceLinker};
use fxdk_core::{
    FxdkError, RelinkRequest, ResourceCommand, Result, ServerState, StartRequest, resource_name,
};
use fxdk_ipc::{AsyncReader, Directive, IpcChannel, LineReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long exit handling waits for buffered output before reporting `down`
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// How long `shutdown` waits for a killed process to be reaped
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The tracked server process
struct ServerProcess {
    generation: u64,
    pid: Option<u32>,
    /// Sending (or dropping) this kills the process
    kill: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

type ProcessSlot = Arc<Mutex<Option<ServerProcess>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Supervisor for one project's development server
pub struct Supervisor {
    config: SupervisorConfig,
    bus: ControlBus,
    linker: ResourceLinker,
    resolver: Arc<dyn ExecutableResolver>,
    lifecycle: Arc<Lifecycle>,
    ipc: IpcChannel,
    process: ProcessSlot,
    /// Resources currently linked, as last passed to the linker
    linked_resources: Mutex<Vec<PathBuf>>,
    next_generation: AtomicU64,
}

impl Supervisor {
    /// Create a supervisor. Nothing is launched or bound until `start`.
    pub fn new(
        config: SupervisorConfig,
        bus: ControlBus,
        linker: ResourceLinker,
        resolver: Arc<dyn ExecutableResolver>,
    ) -> Result<Self> {
        config.validate()?;

        let lifecycle = Arc::new(Lifecycle::new(bus.clone()));
        let ipc = IpcChannel::new(config.ipc_name.clone(), bus.commands().clone(), lifecycle.clone());

        Ok(Self {
            config,
            bus,
            linker,
            resolver,
            lifecycle,
            ipc,
            process: Arc::new(Mutex::new(None)),
            linked_resources: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    /// The IPC channel to the bridge resource
    pub fn ipc(&self) -> &IpcChannel {
        &self.ipc
    }

    /// The control bus events are published on
    pub fn bus(&self) -> &ControlBus {
        &self.bus
    }

    /// Resources currently linked into the server
    pub fn linked_resources(&self) -> Vec<PathBuf> {
        lock(&self.linked_resources).clone()
    }

    /// Process id of the running server, if any
    pub fn pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().and_then(|p| p.pid)
    }

    /// Dispatch one control surface command
    pub async fn handle(&self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::AckState => self.ack_state(),
            ControlCommand::Start(request) => self.start(request).await?,
            ControlCommand::Stop => self.stop(),
            ControlCommand::RestartResource { name } => self.restart_resource(name),
            ControlCommand::StopResource { name } => self.stop_resource(name),
            ControlCommand::StartResource { name } => self.start_resource(name),
            ControlCommand::RequestResourcesState => self.request_resources_state(),
            ControlCommand::RefreshResources(request) => self.refresh_resources(request).await?,
            ControlCommand::RelinkResources(request) => self.relink_resources(request).await?,
        }
        Ok(())
    }

    /// Re-broadcast the current state
    pub fn ack_state(&self) {
        self.lifecycle.ack();
    }

    /// Launch the server for a project.
    ///
    /// Output is cleared first on every call. Does nothing else if no executable is available
    /// or a process is already tracked. Launch failures are logged and leave the state at
    /// `booting`; only failing to prepare the working directory is returned as an error.
    pub async fn start(&self, request: StartRequest) -> Result<()> {
        self.bus.clear_output();

        let Some(executable) = self.resolver.resolve() else {
            warn!("No server executable available, not starting");
            return Ok(());
        };

        if lock(&self.process).is_some() {
            warn!("Server process already running, ignoring start");
            return Ok(());
        }

        self.lifecycle.to_state(ServerState::Booting);

        let server_dir = self.ensure_server_dir(&request.project_path).await?;
        self.link(&server_dir, &request.enabled_resource_paths).await?;

        let args = server_args(&self.config, &request.enabled_resource_paths)?;
        info!("Launching {:?} in {:?}", executable, server_dir);
        debug!("Server arguments: {}", args.join(" "));

        let SpawnedServer {
            child,
            stdout,
            stderr,
        } = match spawn_server(&executable, &server_dir, &args) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("{}", e);
                return Ok(());
            }
        };

        if let Err(e) = self.ipc.open() {
            error!("Server started without IPC: {}", e);
        }

        let mut output = vec![tokio::spawn(forward_output(stdout, self.bus.clone()))];
        if let Some(stderr) = stderr {
            output.push(tokio::spawn(forward_output(stderr, self.bus.clone())));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        *lock(&self.process) = Some(ServerProcess {
            generation,
            pid,
            kill: Some(kill_tx),
            watcher: None,
        });
        info!("Server process started (pid {:?})", pid);

        let watcher = tokio::spawn(watch_exit(
            child,
            kill_rx,
            output,
            ExitContext {
                generation,
                process: self.process.clone(),
                ipc: self.ipc.clone(),
                lifecycle: self.lifecycle.clone(),
            },
        ));

        // A process that already exited has cleared its slot; the watcher is simply detached.
        if let Some(process) = lock(&self.process)
            .as_mut()
            .filter(|p| p.generation == generation)
        {
            process.watcher = Some(watcher);
        }

        Ok(())
    }

    /// Force-kill the server process. Exit handling moves the state to `down`.
    pub fn stop(&self) {
        let mut process = lock(&self.process);
        match process.as_mut().and_then(|p| p.kill.take()) {
            Some(kill) => {
                info!("Stopping server process");
                let _ = kill.send(());
            }
            None => debug!("No server process to stop"),
        }
    }

    /// Relink resources and tell the bridge resource to reconcile
    pub async fn refresh_resources(&self, request: StartRequest) -> Result<()> {
        let server_dir = self.ensure_server_dir(&request.project_path).await?;
        self.link(&server_dir, &request.enabled_resource_paths).await?;
        // The linker already sent one; refresh is idempotent on the bridge side
        self.ipc.send_directive(&Directive::Refresh);
        Ok(())
    }

    /// Relink resources of a running server, restarting the linked resources that live
    /// under `restart_resources_with_path`. Ignored unless the server is up.
    pub async fn relink_resources(&self, request: RelinkRequest) -> Result<()> {
        let state = self.state();
        if state != ServerState::Up {
            debug!("Server is {}, ignoring relink", state);
            return Ok(());
        }

        let restart = match &request.restart_resources_with_path {
            Some(prefix) => resources_under(&self.linked_resources(), prefix),
            None => Vec::new(),
        };

        let server_dir = self.ensure_server_dir(&request.project_path).await?;
        self.link(&server_dir, &request.resource_paths).await?;

        for name in restart {
            info!("Restarting relinked resource {}", name);
            self.ipc.send_directive(&Directive::Restart(name));
        }
        Ok(())
    }

    pub fn restart_resource(&self, name: impl Into<String>) {
        self.bus.send_command(ResourceCommand::Restart(name.into()));
    }

    pub fn stop_resource(&self, name: impl Into<String>) {
        self.bus.send_command(ResourceCommand::Stop(name.into()));
    }

    pub fn start_resource(&self, name: impl Into<String>) {
        self.bus.send_command(ResourceCommand::Start(name.into()));
    }

    /// Ask the bridge resource for a resource state snapshot
    pub fn request_resources_state(&self) {
        self.bus.send_command(ResourceCommand::RequestState);
    }

    /// Kill the server process, wait for its exit handling and close the IPC channel
    pub async fn shutdown(&self) {
        let process = lock(&self.process).take();
        if let Some(mut process) = process {
            info!("Shutting down server process (pid {:?})", process.pid);
            if let Some(kill) = process.kill.take() {
                let _ = kill.send(());
            }
            if let Some(watcher) = process.watcher.take() {
                if tokio::time::timeout(SHUTDOWN_TIMEOUT, watcher).await.is_err() {
                    warn!("Server process did not exit within {:?}", SHUTDOWN_TIMEOUT);
                }
            }
        }
        self.ipc.close();
    }

    /// Kill the server process when the supervisor receives Ctrl-C or SIGTERM.
    ///
    /// The returned task completes once teardown has finished.
    pub fn spawn_teardown_hook(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_termination().await;
            warn!("Supervisor terminating, tearing down server process");
            supervisor.shutdown().await;
        })
    }

    async fn ensure_server_dir(&self, project_path: &Path) -> Result<PathBuf> {
        let server_dir = self.config.server_dir(project_path);
        tokio::fs::create_dir_all(&server_dir).await.map_err(|e| {
            FxdkError::FilesystemError(format!("Failed to create {:?}: {}", server_dir, e))
        })?;
        Ok(server_dir)
    }

    /// Reconcile links, record what is linked, then ask the bridge to refresh
    async fn link(&self, server_dir: &Path, resources: &[PathBuf]) -> Result<LinkReport> {
        let report = self.linker.link_resources(server_dir, resources).await?;
        *lock(&self.linked_resources) = resources.to_vec();
        self.ipc.send_directive(&Directive::Refresh);
        Ok(report)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Dropping the kill sender kills the process
        if lock(&self.process).take().is_some() {
            warn!("Supervisor dropped with a running server process, killing it");
        }
        self.ipc.close();
    }
}

/// Names of the resources in `linked` whose path lies under `prefix`
fn resources_under(linked: &[PathBuf], prefix: &Path) -> Vec<String> {
    linked
        .iter()
        .filter(|path| path.starts_with(prefix))
        .filter_map(|path| resource_name(path))
        .collect()
}

async fn forward_output<R: AsyncRead + Unpin + Send>(stream: R, bus: ControlBus) {
    let mut reader = LineReader::new(stream);
    loop {
        match reader.read_message().await {
            Ok(Some(line)) => bus.emit_output(line),
            Ok(None) => break,
            Err(e) => {
                warn!("Server output read failed: {}", e);
                break;
            }
        }
    }
}

struct SpawnedServer {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
}

fn spawn_server(executable: &Path, server_dir: &Path, args: &[String]) -> Result<SpawnedServer> {
    let mut command = Command::new(executable);
    command
        .current_dir(server_dir)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group: terminal signals go to the supervisor, which decides
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| {
        FxdkError::LaunchError(format!("Failed to launch server {:?}: {}", executable, e))
    })?;

    let Some(stdout) = child.stdout.take() else {
        let _ = child.start_kill();
        return Err(FxdkError::LaunchError(
            "Server process has no output stream".into(),
        ));
    };
    let stderr = child.stderr.take();

    Ok(SpawnedServer {
        child,
        stdout,
        stderr,
    })
}

struct ExitContext {
    generation: u64,
    process: ProcessSlot,
    ipc: IpcChannel,
    lifecycle: Arc<Lifecycle>,
}

async fn watch_exit(
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    output: Vec<JoinHandle<()>>,
    context: ExitContext,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            info!("Killing server process");
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill server process: {}", e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => info!("Server process exited: {}", status),
        Err(e) => error!("Failed waiting for server process: {}", e),
    }

    // Descendants can keep the pipes open; their output is not forwarded past `down`
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    for mut task in output {
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            debug!("Server output still open after exit, detaching it");
            task.abort();
        }
    }

    context.ipc.close();
    {
        let mut process = lock(&context.process);
        if process.as_ref().is_some_and(|p| p.generation == context.generation) {
            *process = None;
        }
    }
    context.lifecycle.to_state(ServerState::Down);
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
