//! Process launching for the subordinate side of a cycle.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};

/// Environment variable carrying the classpath to the subordinate.
pub const CLASSPATH_ENV: &str = "TANDEM_CLASSPATH";

/// Everything needed to start one subordinate process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Program to execute.
    pub runner: PathBuf,
    /// Arguments for the runner itself, placed before the protocol arguments.
    pub runner_args: Vec<String>,
    pub master_stub: PathBuf,
    pub entry_point: String,
    pub code_service_stub: PathBuf,
    pub classpath: Vec<PathBuf>,
    pub work_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// The three positional arguments every subordinate receives, in order.
    pub fn protocol_args(&self) -> [OsString; 3] {
        [
            self.master_stub.clone().into_os_string(),
            OsString::from(&self.entry_point),
            self.code_service_stub.clone().into_os_string(),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: PathBuf, source: io::Error },
    #[error("classpath cannot be encoded: {0}")]
    Classpath(#[from] std::env::JoinPathsError),
    #[error("subordinate runner not found: {0}")]
    RunnerNotFound(String),
}

/// Extension point for different launch strategies (containers, sandboxes,
/// remote shells). The returned child must be waitable; the monitor owns it.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Child, LaunchError>;
}

/// Plain `fork`/`exec` launcher. The subordinate inherits stdout/stderr so its
/// own logs land next to the master's; stdin is closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Child, LaunchError> {
        let mut command = Command::new(&spec.runner);
        command
            .args(&spec.runner_args)
            .args(spec.protocol_args())
            .env(CLASSPATH_ENV, std::env::join_paths(&spec.classpath)?)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &spec.work_dir {
            command.current_dir(dir);
        }

        command.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.runner.clone(),
            source,
        })
    }
}

/// Reduce an exit status to one integer: the exit code, or `128 + signal`
/// when the process was killed (the shell convention).
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Human-readable exit description for logs.
pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return match nix::sys::signal::Signal::try_from(signal) {
                Ok(sig) => format!("killed by {}", sig),
                Err(_) => format!("killed by signal {}", signal),
            };
        }
    }
    "unknown exit".to_string()
}

/// Read the classpath handed over by `CommandLauncher`.
pub fn classpath_from_env() -> Vec<PathBuf> {
    std::env::var_os(CLASSPATH_ENV)
        .map(|value| std::env::split_paths(&value).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(runner: &str, runner_args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            runner: PathBuf::from(runner),
            runner_args: runner_args.iter().map(|s| s.to_string()).collect(),
            master_stub: PathBuf::from("/tmp/master.json"),
            entry_point: "idle".to_string(),
            code_service_stub: PathBuf::from("/tmp/code.json"),
            classpath: vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")],
            work_dir: None,
        }
    }

    #[test]
    fn protocol_args_are_in_order() {
        let args = spec("runner", &[]).protocol_args();
        assert_eq!(args[0], OsString::from("/tmp/master.json"));
        assert_eq!(args[1], OsString::from("idle"));
        assert_eq!(args[2], OsString::from("/tmp/code.json"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_launcher_passes_args_env_and_workdir() {
        let scratch = tempfile::tempdir().unwrap();
        let out = scratch.path().join("out.txt");
        let script = format!(
            "printf '%s|%s|%s|%s|%s' \"$1\" \"$2\" \"$3\" \"${}\" \"$(pwd)\" > {}",
            CLASSPATH_ENV,
            out.display()
        );
        let mut spec = spec("sh", &["-c", &script, "sh"]);
        spec.work_dir = Some(scratch.path().to_path_buf());

        let mut child = CommandLauncher.launch(&spec).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), 0);

        let written = std::fs::read_to_string(&out).unwrap();
        let fields: Vec<&str> = written.split('|').collect();
        assert_eq!(&fields[..4], &["/tmp/master.json", "idle", "/tmp/code.json", "/opt/a:/opt/b"]);
        let cwd = std::fs::canonicalize(fields[4]).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(scratch.path()).unwrap());
    }

    #[tokio::test]
    async fn missing_runner_is_spawn_error() {
        let err = CommandLauncher
            .launch(&spec("/definitely/not/a/runner", &[]))
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_codes_and_signals() {
        let status = Command::new("sh").args(["-c", "exit 3"]).status().await.unwrap();
        assert_eq!(exit_code(status), 3);
        assert_eq!(describe_exit(status), "exit code 3");

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        child.start_kill().unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(status), 128 + 9);
        assert_eq!(describe_exit(status), "killed by SIGKILL");
    }
}
