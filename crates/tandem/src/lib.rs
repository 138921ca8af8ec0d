//! tandem: launch a subordinate process, hand it a way to call back, and
//! supervise it until it quits.

pub mod bootstrap;
pub mod bridge;
pub mod code_service;
mod config;
mod controller;
mod handle;
pub mod launcher;
pub mod logging;
mod monitor;
pub mod remote;
pub mod subordinate;

pub use config::{
    ControllerConfig, DEFAULT_QUIT_TIMEOUT, DEFAULT_RUNNER_NAME, LaunchRequest, RUNNER_ENV,
};
pub use controller::{
    ControllerError, LifecycleState, MasterController, MasterRemote, SubordinateEvents,
};
pub use handle::SubordinateHandle;
pub use launcher::{CommandLauncher, LaunchError, LaunchSpec, ProcessLauncher};
pub use remote::{RemoteObject, RemoteObjectExporter, SocketExporter, Stub};

pub const TANDEM_VERSION: &str = env!("CARGO_PKG_VERSION");
