//! Subordinate runtime - runs inside the child process.
//!
//! The master side (launch, registration, monitoring) is in controller.rs.
//!
//! Startup:
//! 1. Read the master stub file named on the command line
//! 2. Read the code service stub, instantiate the entry point, start it
//!    (any failure here is reported to the master before exiting)
//! 3. Export the subordinate endpoint and register it with the master
//! 4. Serve calls until quit is requested or the master stops answering

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{Instant, Interval};

use crate::bootstrap::{BootstrapError, read_stub};
use crate::bridge::protocol::{MasterCall, PROTOCOL_VERSION, SUBORDINATE_INTERFACE, SubordinateCall};
use crate::code_service::CodeServiceProxy;
use crate::launcher::classpath_from_env;
use crate::remote::{
    ExportError, RemoteError, RemoteObject, RemoteObjectExporter, SocketExporter, Stub,
    decode_call, encode_value,
};

/// Process exit codes used by the runner.
pub const EXIT_QUIT: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_MASTER_LOST: i32 = 3;

/// Resource loaded by the `resource-probe` entry point.
pub const PROBE_RESOURCE_ENV: &str = "TANDEM_PROBE_RESOURCE";
pub const DEFAULT_PROBE_RESOURCE: &str = "tandem.probe";

#[derive(Debug, thiserror::Error)]
pub enum SubordinateError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("unknown entry point '{0}'")]
    UnknownEntryPoint(String),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// The entry point's own startup failed.
    #[error("startup failed: {message}")]
    Startup { message: String },

    #[error("failed to export subordinate endpoint: {0}")]
    Export(#[from] ExportError),

    #[error("call to master failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SubordinateError {
    pub fn startup(message: impl Into<String>) -> Self {
        Self::Startup {
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => EXIT_USAGE,
            _ => EXIT_FAILED,
        }
    }
}

/// The three positional arguments every subordinate is started with, plus
/// the classpath the launcher put in `TANDEM_CLASSPATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubordinateArgs {
    pub master_stub: PathBuf,
    pub entry_point: String,
    pub code_service_stub: PathBuf,
    pub classpath: Vec<PathBuf>,
}

impl SubordinateArgs {
    pub fn parse<I, S>(args: I) -> Result<Self, SubordinateError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let [master_stub, entry_point, code_service_stub] = <[OsString; 3]>::try_from(args)
            .map_err(|args| {
                SubordinateError::Usage(format!(
                    "expected <master-stub> <entry-point> <code-service-stub>, got {} arguments",
                    args.len()
                ))
            })?;
        let entry_point = entry_point
            .into_string()
            .map_err(|raw| SubordinateError::Usage(format!("entry point {:?} is not UTF-8", raw)))?;

        Ok(Self {
            master_stub: PathBuf::from(master_stub),
            entry_point,
            code_service_stub: PathBuf::from(code_service_stub),
            classpath: classpath_from_env(),
        })
    }
}

/// Subordinate-side client for the master endpoint.
#[derive(Debug, Clone)]
pub struct MasterProxy {
    stub: Stub,
}

impl MasterProxy {
    pub fn new(stub: Stub) -> Self {
        Self { stub }
    }

    pub async fn register_subordinate(&self, handle: &Stub) -> Result<(), RemoteError> {
        self.stub
            .invoke(&MasterCall::RegisterSubordinate {
                handle: handle.clone(),
                protocol: PROTOCOL_VERSION,
            })
            .await
    }

    pub async fn check_alive(&self) -> Result<(), RemoteError> {
        self.stub.invoke(&MasterCall::CheckAlive).await
    }

    pub async fn report_startup_error(&self, cause: &str) -> Result<(), RemoteError> {
        self.stub
            .invoke(&MasterCall::ReportStartupError {
                cause: cause.to_string(),
            })
            .await
    }
}

/// What an entry point gets to work with during `start`.
pub struct SubordinateContext {
    pub master: MasterProxy,
    pub code_service: CodeServiceProxy,
    pub entry_point: String,
    /// Classpath the master serves through `code_service`, in lookup order.
    pub classpath: Vec<PathBuf>,
}

/// Application code run by the subordinate runtime.
#[async_trait]
pub trait Subordinate: Send + Sync + 'static {
    /// Runs before registration. An error here is reported to the master and
    /// the process exits without registering.
    async fn start(&self, ctx: &SubordinateContext) -> Result<(), SubordinateError> {
        let _ = ctx;
        Ok(())
    }

    /// Application-defined calls made through the master's handle.
    async fn handle_call(&self, call: serde_json::Value) -> Result<serde_json::Value, String> {
        Err(format!("unsupported call: {}", call))
    }

    /// Runs after quit was requested, before the process exits.
    async fn on_quit(&self) {}
}

pub type SubordinateFactory = Box<dyn Fn() -> Arc<dyn Subordinate> + Send + Sync>;

/// Entry points by name.
pub struct SubordinateRegistry {
    factories: HashMap<String, SubordinateFactory>,
}

impl SubordinateRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// `idle` and `resource-probe`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("idle", || Arc::new(IdleSubordinate) as Arc<dyn Subordinate>);
        registry.register("resource-probe", || {
            let resource = std::env::var(PROBE_RESOURCE_ENV)
                .unwrap_or_else(|_| DEFAULT_PROBE_RESOURCE.to_string());
            Arc::new(ResourceProbe::new(resource)) as Arc<dyn Subordinate>
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Subordinate> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn Subordinate>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for SubordinateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub struct SubordinateConfig {
    /// How often to probe the master; `None` disables probing.
    pub ping_interval: Option<Duration>,
    /// Pause between acknowledging quit and exiting, so the reply is flushed.
    pub quit_delay: Duration,
}

impl Default for SubordinateConfig {
    fn default() -> Self {
        Self {
            ping_interval: Some(Duration::from_secs(1)),
            quit_delay: Duration::from_millis(100),
        }
    }
}

/// How a registered subordinate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubordinateExit {
    Quit,
    MasterLost,
}

impl SubordinateExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Quit => EXIT_QUIT,
            Self::MasterLost => EXIT_MASTER_LOST,
        }
    }
}

/// The object the master holds a handle to.
struct SubordinateEndpoint {
    subordinate: Arc<dyn Subordinate>,
    quit: Arc<Notify>,
}

#[async_trait]
impl RemoteObject for SubordinateEndpoint {
    fn interface(&self) -> &'static str {
        SUBORDINATE_INTERFACE
    }

    async fn dispatch(&self, call: serde_json::Value) -> Result<serde_json::Value, String> {
        match serde_json::from_value::<SubordinateCall>(call.clone()) {
            Ok(SubordinateCall::Quit) => {
                tracing::info!("Quit requested by master");
                self.quit.notify_one();
                Ok(serde_json::Value::Null)
            }
            Err(_) => self.subordinate.handle_call(call).await,
        }
    }
}

/// Run one subordinate to completion.
pub async fn run_subordinate(
    args: &SubordinateArgs,
    registry: &SubordinateRegistry,
    config: &SubordinateConfig,
) -> Result<SubordinateExit, SubordinateError> {
    tracing::info!(entry_point = %args.entry_point, "Subordinate starting");

    // Without the master stub there is nobody to report to.
    let master = MasterProxy::new(read_stub(&args.master_stub)?);

    let subordinate = match start_entry_point(args, registry, &master).await {
        Ok(subordinate) => subordinate,
        Err(e) => {
            tracing::error!(error = %e, "Subordinate startup failed");
            if let Err(report_err) = master.report_startup_error(&e.to_string()).await {
                tracing::warn!(error = %report_err, "Failed to report startup error to master");
            }
            return Err(e);
        }
    };

    let exporter = SocketExporter::new()?;
    let quit = Arc::new(Notify::new());
    let own = exporter.export(Arc::new(SubordinateEndpoint {
        subordinate: Arc::clone(&subordinate),
        quit: Arc::clone(&quit),
    }))?;

    tracing::debug!(handle = %own, "Registering with master");
    master.register_subordinate(&own).await?;
    tracing::info!("Registered with master");

    let mut ping = config
        .ping_interval
        .filter(|period| !period.is_zero())
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    let exit = loop {
        tokio::select! {
            biased;

            _ = quit.notified() => {
                break SubordinateExit::Quit;
            }

            _ = tick(&mut ping) => {
                match master.check_alive().await {
                    Ok(()) => tracing::trace!("Master alive"),
                    Err(e) if e.is_peer_gone() => {
                        tracing::error!(error = %e, "Master is gone, exiting");
                        break SubordinateExit::MasterLost;
                    }
                    Err(e) => tracing::warn!(error = %e, "Liveness probe failed"),
                }
            }
        }
    };

    if exit == SubordinateExit::Quit {
        subordinate.on_quit().await;
        tokio::time::sleep(config.quit_delay).await;
    }
    if let Err(e) = exporter.unexport(&own) {
        tracing::debug!(error = %e, "Failed to withdraw subordinate endpoint");
    }

    tracing::info!(?exit, "Subordinate exiting");
    Ok(exit)
}

async fn start_entry_point(
    args: &SubordinateArgs,
    registry: &SubordinateRegistry,
    master: &MasterProxy,
) -> Result<Arc<dyn Subordinate>, SubordinateError> {
    let code_service = CodeServiceProxy::new(read_stub(&args.code_service_stub)?);
    let subordinate = registry
        .create(&args.entry_point)
        .ok_or_else(|| SubordinateError::UnknownEntryPoint(args.entry_point.clone()))?;

    let ctx = SubordinateContext {
        master: master.clone(),
        code_service,
        entry_point: args.entry_point.clone(),
        classpath: args.classpath.clone(),
    };
    subordinate.start(&ctx).await?;
    Ok(subordinate)
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
enum IdleCall {
    Echo { value: serde_json::Value },
    ProcessId,
}

/// Does nothing until told to quit. Answers `echo` and `process_id`.
pub struct IdleSubordinate;

#[async_trait]
impl Subordinate for IdleSubordinate {
    async fn handle_call(&self, call: serde_json::Value) -> Result<serde_json::Value, String> {
        match decode_call::<IdleCall>(call)? {
            IdleCall::Echo { value } => Ok(value),
            IdleCall::ProcessId => encode_value(&std::process::id()),
        }
    }
}

/// What `ResourceProbe` found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub resource: String,
    pub size: usize,
    pub classpath: Vec<PathBuf>,
}

/// Loads one resource through the code service during startup; fails startup
/// if the master cannot serve it. Answers `describe` with a `ProbeReport`.
pub struct ResourceProbe {
    resource: String,
    loaded: OnceLock<(usize, Vec<PathBuf>)>,
}

impl ResourceProbe {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            loaded: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Subordinate for ResourceProbe {
    async fn start(&self, ctx: &SubordinateContext) -> Result<(), SubordinateError> {
        let bytes = ctx.code_service.load(&self.resource).await.map_err(|e| {
            SubordinateError::startup(format!("cannot load '{}': {}", self.resource, e))
        })?;
        tracing::info!(resource = %self.resource, size = bytes.len(), classpath = ?ctx.classpath, "Loaded resource from master");
        let _ = self.loaded.set((bytes.len(), ctx.classpath.clone()));
        Ok(())
    }

    async fn handle_call(&self, call: serde_json::Value) -> Result<serde_json::Value, String> {
        match call.get("method").and_then(|m| m.as_str()) {
            Some("describe") => {
                let (size, classpath) = self
                    .loaded
                    .get()
                    .ok_or_else(|| "resource not loaded".to_string())?;
                encode_value(&ProbeReport {
                    resource: self.resource.clone(),
                    size: *size,
                    classpath: classpath.clone(),
                })
            }
            _ => Err(format!("unsupported call: {}", call)),
        }
    }
}
