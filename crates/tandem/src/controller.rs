//! Master controller: owns the lifecycle of one subordinate process at a time.
//!
//! Flow of one cycle:
//! 1. `launch` exports the master endpoint and the code service, writes both
//!    stubs to temp files, spawns the runner. State: `StartingUp`.
//! 2. The subordinate reads the stub files and calls `register_subordinate`.
//!    The stub files are deleted, the handle is stored. State: `Connected`.
//! 3. The monitor task sees the process exit, withdraws both exports and
//!    returns to `Idle`, reporting either a normal quit or a startup failure.
//!
//! All transitions and all application callbacks run under one async lock, so
//! callbacks observe a stable state and can call back into the controller
//! only after they return.

use std::io;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::bootstrap::{BootstrapArtifacts, BootstrapChannel, BootstrapError};
use crate::bridge::protocol::{MASTER_INTERFACE, MasterCall, PROTOCOL_VERSION};
use crate::code_service::CodeService;
use crate::config::{ControllerConfig, LaunchRequest};
use crate::handle::SubordinateHandle;
use crate::launcher::{LaunchError, LaunchSpec};
use crate::monitor;
use crate::remote::{
    ExportError, RemoteError, RemoteObject, RemoteObjectExporter, SocketExporter, Stub,
    decode_call,
};

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    StartingUp,
    Connected,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::StartingUp => write!(f, "starting up"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Application hooks. Every method runs while the controller lock is held:
/// do not call back into the controller from inside one. To relaunch from
/// `on_startup_failure` or `on_quit`, spawn a task that calls `launch`.
pub trait SubordinateEvents: Send + Sync + 'static {
    /// The subordinate registered; `subordinate` is the stored handle.
    fn on_connected(&self, subordinate: &SubordinateHandle);

    /// A connected subordinate exited. Not called for startup failures.
    fn on_quit(&self, status: i32);

    /// The subordinate exited before it registered.
    fn on_startup_failure(&self, status: i32) {
        tracing::error!(status, "Subordinate quit before registering");
    }

    /// The subordinate reported an error from its own startup. Informational:
    /// the process exit that usually follows drives the state change.
    fn on_startup_error(&self, cause: &str) {
        tracing::error!(%cause, "Subordinate reported a startup error");
    }
}

/// Calls the subordinate makes into the master, as served by the controller.
#[async_trait]
pub trait MasterRemote: Send + Sync {
    /// Complete the handshake. Valid only while starting up.
    async fn register_subordinate(
        &self,
        handle: SubordinateHandle,
        protocol: u32,
    ) -> Result<(), ControllerError>;

    /// Liveness check.
    async fn check_alive(&self);

    async fn report_startup_error(&self, cause: String);
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("a subordinate is already running (state: {state})")]
    AlreadyRunning { state: LifecycleState },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("subordinate exited with status {status} before registering")]
    StartupFailed { status: i32 },
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("failed to launch subordinate: {0}")]
    Launch(#[from] LaunchError),
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("failed to withdraw exported objects: {0}")]
    Unexport(#[source] ExportError),
    #[error("controller is defunct: {0}")]
    Defunct(String),
    #[error("no subordinate has been launched")]
    NotLaunched,
    #[error("monitor task failed: {0}")]
    Monitor(String),
}

/// Internal lifecycle. Data that only exists in one state lives in that
/// state's variant, so "stub files exist iff starting up" and "handle present
/// iff connected" hold by construction.
enum Lifecycle {
    Idle,
    StartingUp {
        artifacts: BootstrapArtifacts,
        pending_quit: bool,
    },
    Connected {
        subordinate: SubordinateHandle,
        quit_sent: bool,
    },
}

impl Lifecycle {
    fn public(&self) -> LifecycleState {
        match self {
            Self::Idle => LifecycleState::Idle,
            Self::StartingUp { .. } => LifecycleState::StartingUp,
            Self::Connected { .. } => LifecycleState::Connected,
        }
    }
}

/// The two objects exported for one cycle.
struct CycleExports {
    master: Stub,
    code_service: Stub,
}

impl CycleExports {
    /// Withdraw both exports, attempting the second even if the first fails.
    fn retract(&self, exporter: &dyn RemoteObjectExporter) -> Result<(), ExportError> {
        let master = exporter.unexport(&self.master);
        let code_service = exporter.unexport(&self.code_service);
        master.and(code_service)
    }
}

#[derive(Debug, Clone, Copy)]
struct ProcessRecord {
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

struct ControllerState {
    lifecycle: Lifecycle,
    /// Present from a successful launch until the monitor retracts it.
    exports: Option<CycleExports>,
    process: Option<ProcessRecord>,
    cycle: u64,
    defunct: Option<String>,
    monitor: Option<JoinHandle<Result<i32, ControllerError>>>,
}

struct Inner {
    config: ControllerConfig,
    exporter: Arc<dyn RemoteObjectExporter>,
    events: Arc<dyn SubordinateEvents>,
    state: Mutex<ControllerState>,
    state_tx: watch::Sender<LifecycleState>,
}

struct Bootstrapped {
    artifacts: BootstrapArtifacts,
    exports: CycleExports,
    child: Child,
}

/// Cheap to clone; all clones drive the same subordinate.
#[derive(Clone)]
pub struct MasterController {
    inner: Arc<Inner>,
}

impl MasterController {
    /// Create an idle controller. Fails only if the default socket exporter
    /// cannot create its directory.
    pub fn new(config: ControllerConfig, events: Arc<dyn SubordinateEvents>) -> io::Result<Self> {
        let exporter = match &config.exporter {
            Some(exporter) => Arc::clone(exporter),
            None => Arc::new(SocketExporter::new()?) as Arc<dyn RemoteObjectExporter>,
        };
        let (state_tx, _) = watch::channel(LifecycleState::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                exporter,
                events,
                state: Mutex::new(ControllerState {
                    lifecycle: Lifecycle::Idle,
                    exports: None,
                    process: None,
                    cycle: 0,
                    defunct: None,
                    monitor: None,
                }),
                state_tx,
            }),
        })
    }

    /// Start a subordinate. Only valid while idle; on error the controller
    /// stays idle with nothing exported and no stub files left behind.
    pub async fn launch(&self, request: LaunchRequest) -> Result<(), ControllerError> {
        tracing::info!(
            entry_point = %self.inner.config.entry_point,
            args = ?request.args,
            classpath = ?request.classpath,
            work_dir = ?request.work_dir,
            "launch requested"
        );
        let mut state = self.inner.state.lock().await;

        if let Some(reason) = &state.defunct {
            return Err(ControllerError::Defunct(reason.clone()));
        }
        let current = state.lifecycle.public();
        if current != LifecycleState::Idle {
            tracing::warn!(state = %current, "Launch rejected, subordinate already running");
            return Err(ControllerError::AlreadyRunning { state: current });
        }

        let cycle = state.cycle + 1;
        let Bootstrapped {
            artifacts,
            exports,
            child,
        } = self.bootstrap(cycle, &request)?;

        let pid = child.id();
        state.cycle = cycle;
        state.exports = Some(exports);
        state.process = Some(ProcessRecord {
            pid,
            started_at: Utc::now(),
        });
        state.lifecycle = Lifecycle::StartingUp {
            artifacts,
            pending_quit: false,
        };
        state.monitor = Some(tokio::spawn(monitor::watch(self.clone(), child, cycle)));
        self.publish(&state);

        tracing::info!(cycle, pid, "Subordinate process started");
        Ok(())
    }

    /// Export, persist and spawn. Everything created here is rolled back
    /// before an error is returned.
    fn bootstrap(&self, cycle: u64, request: &LaunchRequest) -> Result<Bootstrapped, ControllerError> {
        let config = &self.inner.config;
        let exporter = &self.inner.exporter;
        let runner = config.resolve_runner()?;
        let channel = BootstrapChannel::new(Arc::clone(exporter), config.stub_dir.clone());

        tracing::debug!(cycle, "Exporting master endpoint");
        let master = channel.prepare(Arc::new(MasterEndpoint {
            controller: Arc::downgrade(&self.inner),
        }))?;

        tracing::debug!(cycle, classpath = ?request.classpath, "Exporting code service");
        let code_service = match channel.prepare(Arc::new(CodeService::new(request.classpath.clone()))) {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(unexport_err) = exporter.unexport(&master.stub) {
                    tracing::error!(cycle, error = %unexport_err, "Failed to withdraw master endpoint after bootstrap failure");
                }
                BootstrapChannel::cleanup(master.path);
                return Err(e.into());
            }
        };

        let exports = CycleExports {
            master: master.stub.clone(),
            code_service: code_service.stub.clone(),
        };
        let artifacts = BootstrapArtifacts::new(master, code_service);

        let spec = LaunchSpec {
            runner,
            runner_args: config
                .runner_args
                .iter()
                .chain(request.args.iter())
                .cloned()
                .collect(),
            master_stub: artifacts.master_path().to_path_buf(),
            entry_point: config.entry_point.clone(),
            code_service_stub: artifacts.code_service_path().to_path_buf(),
            classpath: request.classpath.clone(),
            work_dir: request.work_dir.clone(),
        };

        tracing::info!(cycle, runner = %spec.runner.display(), "Spawning subordinate process");
        match config.launcher.launch(&spec) {
            Ok(child) => Ok(Bootstrapped {
                artifacts,
                exports,
                child,
            }),
            Err(e) => {
                tracing::warn!(cycle, error = %e, "Launch failed, rolling back");
                artifacts.cleanup();
                if let Err(unexport_err) = exports.retract(exporter.as_ref()) {
                    tracing::error!(cycle, error = %unexport_err, "Failed to withdraw exports after launch failure");
                }
                Err(e.into())
            }
        }
    }

    /// Ask the subordinate to exit.
    ///
    /// - Idle: nothing to do, logged.
    /// - Starting up: remembered and acted on right after registration.
    /// - Connected: the quit call is made now; the state changes only when
    ///   the monitor sees the process exit.
    pub async fn request_quit(&self) -> Result<(), ControllerError> {
        tracing::info!("quit requested");
        let mut state = self.inner.state.lock().await;

        match state.lifecycle.public() {
            LifecycleState::Idle => {
                tracing::warn!("Quit requested but no subordinate is running");
                Ok(())
            }
            LifecycleState::StartingUp => {
                if let Lifecycle::StartingUp { pending_quit, .. } = &mut state.lifecycle {
                    *pending_quit = true;
                }
                tracing::info!(cycle = state.cycle, "Subordinate still starting up, quit deferred until registration");
                Ok(())
            }
            LifecycleState::Connected => self.quit_connected(&mut state).await,
        }
    }

    async fn quit_connected(&self, state: &mut ControllerState) -> Result<(), ControllerError> {
        let cycle = state.cycle;
        let Lifecycle::Connected {
            subordinate,
            quit_sent,
        } = &mut state.lifecycle
        else {
            return Ok(());
        };
        if *quit_sent {
            tracing::debug!(cycle, "Quit already delivered, waiting for exit");
            return Ok(());
        }

        let timeout = self.inner.config.quit_timeout;
        tracing::info!(cycle, subordinate = %subordinate, "Sending quit to subordinate");
        match tokio::time::timeout(timeout, subordinate.quit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_peer_gone() => {
                tracing::debug!(cycle, error = %e, "Subordinate went away while quitting");
            }
            Ok(Err(e)) => {
                tracing::warn!(cycle, error = %e, "Quit call failed");
                return Err(e.into());
            }
            Err(_) => {
                // Not marked as sent; the monitor still ends the cycle if
                // the process exits on its own.
                tracing::warn!(cycle, timeout_ms = timeout.as_millis() as u64, "Subordinate did not acknowledge quit");
                return Err(RemoteError::Timeout(timeout).into());
            }
        }
        *quit_sent = true;
        Ok(())
    }

    /// Called by the monitor once the process of `cycle` has exited.
    pub(crate) async fn handle_exit(&self, cycle: u64, status: i32) -> Result<i32, ControllerError> {
        let mut state = self.inner.state.lock().await;
        if state.cycle != cycle {
            tracing::warn!(cycle, current = state.cycle, "Ignoring exit of a stale cycle");
            return Ok(status);
        }

        let uptime = state
            .process
            .take()
            .map(|record| (Utc::now() - record.started_at).num_milliseconds());
        let retracted = match state.exports.take() {
            Some(exports) => exports.retract(self.inner.exporter.as_ref()),
            None => Ok(()),
        };
        let previous = std::mem::replace(&mut state.lifecycle, Lifecycle::Idle);
        self.publish(&state);

        match (previous, retracted) {
            (Lifecycle::StartingUp { artifacts, .. }, retracted) => {
                artifacts.cleanup();
                tracing::warn!(cycle, status, uptime_ms = ?uptime, "Subordinate exited before registering");
                self.inner.events.on_startup_failure(status);
                match retracted {
                    Ok(()) => Err(ControllerError::StartupFailed { status }),
                    Err(e) => Err(self.mark_defunct(&mut state, cycle, e)),
                }
            }
            (_, Err(e)) => Err(self.mark_defunct(&mut state, cycle, e)),
            (Lifecycle::Connected { .. }, Ok(())) => {
                tracing::info!(cycle, status, uptime_ms = ?uptime, "Subordinate quit");
                self.inner.events.on_quit(status);
                Ok(status)
            }
            (Lifecycle::Idle, Ok(())) => {
                tracing::warn!(cycle, status, "Exit observed while idle");
                Ok(status)
            }
        }
    }

    fn mark_defunct(
        &self,
        state: &mut ControllerState,
        cycle: u64,
        error: ExportError,
    ) -> ControllerError {
        tracing::error!(cycle, error = %error, "Could not withdraw exported objects; controller is now defunct");
        state.defunct = Some(error.to_string());
        ControllerError::Unexport(error)
    }

    fn publish(&self, state: &ControllerState) {
        self.inner.state_tx.send_replace(state.lifecycle.public());
    }

    /// Current state. Updated under the lock at every transition.
    pub fn state(&self) -> LifecycleState {
        *self.inner.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state_tx.subscribe()
    }

    /// The handle of the connected subordinate; `None` unless connected.
    pub async fn subordinate(&self) -> Option<SubordinateHandle> {
        match &self.inner.state.lock().await.lifecycle {
            Lifecycle::Connected { subordinate, .. } => Some(subordinate.clone()),
            _ => None,
        }
    }

    pub async fn process_id(&self) -> Option<u32> {
        self.inner.state.lock().await.process.and_then(|record| record.pid)
    }

    /// Number of successful launches so far.
    pub async fn cycle(&self) -> u64 {
        self.inner.state.lock().await.cycle
    }

    /// Whether an unexport failure has disabled the controller.
    pub async fn is_defunct(&self) -> bool {
        self.inner.state.lock().await.defunct.is_some()
    }

    /// Wait until the most recently launched process has exited and the
    /// controller has processed it. `Ok(status)` after a normal quit,
    /// `StartupFailed` if the subordinate never registered.
    pub async fn wait_for_exit(&self) -> Result<i32, ControllerError> {
        let monitor = self.inner.state.lock().await.monitor.take();
        match monitor {
            Some(handle) => handle
                .await
                .map_err(|e| ControllerError::Monitor(e.to_string()))?,
            None => Err(ControllerError::NotLaunched),
        }
    }
}

#[async_trait]
impl MasterRemote for MasterController {
    async fn register_subordinate(
        &self,
        handle: SubordinateHandle,
        protocol: u32,
    ) -> Result<(), ControllerError> {
        tracing::info!(subordinate = %handle, protocol, "register_subordinate called");
        if protocol != PROTOCOL_VERSION {
            tracing::warn!(protocol, expected = PROTOCOL_VERSION, "Rejecting registration");
            return Err(ControllerError::ProtocolViolation(format!(
                "subordinate speaks protocol {}, master speaks {}",
                protocol, PROTOCOL_VERSION
            )));
        }

        let mut state = self.inner.state.lock().await;
        let cycle = state.cycle;
        let (artifacts, pending_quit) = match std::mem::replace(&mut state.lifecycle, Lifecycle::Idle) {
            Lifecycle::StartingUp {
                artifacts,
                pending_quit,
            } => (artifacts, pending_quit),
            other => {
                let current = other.public();
                state.lifecycle = other;
                tracing::warn!(cycle, state = %current, "Unexpected registration");
                return Err(ControllerError::ProtocolViolation(format!(
                    "register_subordinate called while {}",
                    current
                )));
            }
        };

        artifacts.cleanup();
        state.lifecycle = Lifecycle::Connected {
            subordinate: handle,
            quit_sent: false,
        };
        self.publish(&state);
        tracing::info!(cycle, "Subordinate connected");

        if let Lifecycle::Connected { subordinate, .. } = &state.lifecycle {
            self.inner.events.on_connected(subordinate);
        }

        if pending_quit {
            tracing::info!(cycle, "Acting on quit requested during startup");
            if let Err(e) = self.quit_connected(&mut state).await {
                tracing::warn!(cycle, error = %e, "Deferred quit failed");
            }
        }
        Ok(())
    }

    async fn check_alive(&self) {
        tracing::trace!("check_alive");
    }

    async fn report_startup_error(&self, cause: String) {
        let _state = self.inner.state.lock().await;
        self.inner.events.on_startup_error(&cause);
    }
}

/// The object exported to the subordinate. Holds the controller weakly so an
/// export outliving the controller cannot keep it alive.
struct MasterEndpoint {
    controller: Weak<Inner>,
}

#[async_trait]
impl RemoteObject for MasterEndpoint {
    fn interface(&self) -> &'static str {
        MASTER_INTERFACE
    }

    async fn dispatch(&self, call: serde_json::Value) -> Result<serde_json::Value, String> {
        let inner = self
            .controller
            .upgrade()
            .ok_or_else(|| "master controller has shut down".to_string())?;
        let controller = MasterController { inner };

        match decode_call::<MasterCall>(call)? {
            MasterCall::RegisterSubordinate { handle, protocol } => controller
                .register_subordinate(SubordinateHandle::new(handle), protocol)
                .await
                .map(|()| serde_json::Value::Null)
                .map_err(|e| e.to_string()),
            MasterCall::CheckAlive => {
                controller.check_alive().await;
                Ok(serde_json::Value::Null)
            }
            MasterCall::ReportStartupError { cause } => {
                controller.report_startup_error(cause).await;
                Ok(serde_json::Value::Null)
            }
        }
    }
}
