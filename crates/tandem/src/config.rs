//! Controller and launch configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::launcher::{CommandLauncher, LaunchError, ProcessLauncher};
use crate::remote::RemoteObjectExporter;

/// Overrides the runner executable.
pub const RUNNER_ENV: &str = "TANDEM_RUNNER";

/// Runner looked up next to the current executable when nothing else is set.
pub const DEFAULT_RUNNER_NAME: &str = "tandem-subordinate";

/// How long `request_quit` waits for the subordinate to acknowledge.
pub const DEFAULT_QUIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControllerConfig {
    /// Name of the subordinate-side entry point to instantiate.
    pub entry_point: String,
    pub runner: Option<PathBuf>,
    /// Arguments placed before any per-launch arguments.
    pub runner_args: Vec<String>,
    pub launcher: Arc<dyn ProcessLauncher>,
    /// `None` means a private `SocketExporter` is created with the controller.
    pub exporter: Option<Arc<dyn RemoteObjectExporter>>,
    /// Where bootstrap stub files are created.
    pub stub_dir: PathBuf,
    /// Bound on the remote `quit` call. The process exit, not the reply,
    /// ends the cycle.
    pub quit_timeout: Duration,
}

impl ControllerConfig {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            runner: None,
            runner_args: Vec::new(),
            launcher: Arc::new(CommandLauncher),
            exporter: None,
            stub_dir: std::env::temp_dir(),
            quit_timeout: DEFAULT_QUIT_TIMEOUT,
        }
    }

    pub fn with_runner(mut self, runner: impl Into<PathBuf>) -> Self {
        self.runner = Some(runner.into());
        self
    }

    pub fn with_runner_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn RemoteObjectExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_stub_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stub_dir = dir.into();
        self
    }

    pub fn with_quit_timeout(mut self, timeout: Duration) -> Self {
        self.quit_timeout = timeout;
        self
    }

    /// Explicit runner, then `TANDEM_RUNNER`, then `tandem-subordinate` next to
    /// the current executable.
    pub fn resolve_runner(&self) -> Result<PathBuf, LaunchError> {
        if let Some(runner) = &self.runner {
            return Ok(runner.clone());
        }
        if let Some(runner) = std::env::var_os(RUNNER_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(runner));
        }

        let exe = std::env::current_exe()
            .map_err(|e| LaunchError::RunnerNotFound(format!("cannot locate current executable: {}", e)))?;
        let sibling = exe
            .parent()
            .map(|dir| dir.join(format!("{}{}", DEFAULT_RUNNER_NAME, std::env::consts::EXE_SUFFIX)))
            .ok_or_else(|| LaunchError::RunnerNotFound(format!("{} has no parent directory", exe.display())))?;
        if sibling.is_file() {
            Ok(sibling)
        } else {
            Err(LaunchError::RunnerNotFound(format!(
                "set {} or place {} next to {}",
                RUNNER_ENV,
                DEFAULT_RUNNER_NAME,
                exe.display()
            )))
        }
    }
}

/// Per-launch parameters, passed through to the launcher uninterpreted.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub args: Vec<String>,
    pub classpath: Vec<PathBuf>,
    pub work_dir: Option<PathBuf>,
}

impl LaunchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_classpath<I, P>(mut self, classpath: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.classpath = classpath.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ControllerConfig::new("idle");
        assert_eq!(config.entry_point, "idle");
        assert!(config.runner.is_none());
        assert!(config.runner_args.is_empty());
        assert!(config.exporter.is_none());
        assert_eq!(config.stub_dir, std::env::temp_dir());
        assert_eq!(config.quit_timeout, DEFAULT_QUIT_TIMEOUT);

        let config = config.with_quit_timeout(Duration::from_millis(250));
        assert_eq!(config.quit_timeout, Duration::from_millis(250));
    }

    #[test]
    fn explicit_runner_wins() {
        let config = ControllerConfig::new("idle").with_runner("/opt/bin/runner");
        assert_eq!(
            config.resolve_runner().unwrap(),
            PathBuf::from("/opt/bin/runner")
        );
    }

    #[test]
    fn launch_request_builder() {
        let request = LaunchRequest::new()
            .with_args(["--fast"])
            .with_classpath(["/a", "/b"])
            .with_work_dir("/work");
        assert_eq!(request.args, vec!["--fast".to_string()]);
        assert_eq!(
            request.classpath,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert_eq!(request.work_dir, Some(PathBuf::from("/work")));
    }
}
