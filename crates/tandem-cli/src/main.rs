use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tandem::logging::init_tracing;
use tandem::{
    ControllerConfig, ControllerError, LaunchRequest, LifecycleState, MasterController,
    SubordinateEvents, SubordinateHandle, TANDEM_VERSION,
};

struct RunArgs {
    entry_point: String,
    classpath: Vec<PathBuf>,
    work_dir: Option<PathBuf>,
    runner: Option<PathBuf>,
    hold: Duration,
    runner_args: Vec<String>,
}

fn usage() {
    eprintln!(
        "Usage: tandem run <entry-point> [--classpath <list>] [--workdir <dir>] [--runner <path>] [--hold-ms <ms>] [-- <runner args>...]"
    );
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --classpath <list>  Classpath served to the subordinate, ':'-separated");
    eprintln!("  --workdir <dir>     Working directory of the subordinate");
    eprintln!("  --runner <path>     Runner executable [default: $TANDEM_RUNNER or tandem-subordinate]");
    eprintln!("  --hold-ms <ms>      Time to stay connected before requesting quit [default: 1000]");
    eprintln!("  --version           Print version");
}

fn parse_args(args: &[String]) -> Result<RunArgs, String> {
    match args.get(1).map(String::as_str) {
        Some("run") => {}
        Some("--version") | Some("-V") => {
            println!("tandem {}", TANDEM_VERSION);
            process::exit(0);
        }
        Some("--help") | Some("-h") | None => return Err("".to_string()),
        Some(other) => return Err(format!("unknown command: {other}")),
    }

    let mut entry_point: Option<String> = None;
    let mut classpath = Vec::new();
    let mut work_dir = None;
    let mut runner = None;
    let mut hold = Duration::from_millis(1000);
    let mut runner_args = Vec::new();

    let mut i = 2; // skip argv[0] and the command
    while i < args.len() {
        match args[i].as_str() {
            "--classpath" => {
                i += 1;
                let value = args.get(i).ok_or("--classpath requires a value")?;
                classpath = std::env::split_paths(value).collect();
            }
            "--workdir" => {
                i += 1;
                work_dir = Some(PathBuf::from(args.get(i).ok_or("--workdir requires a value")?));
            }
            "--runner" => {
                i += 1;
                runner = Some(PathBuf::from(args.get(i).ok_or("--runner requires a value")?));
            }
            "--hold-ms" => {
                i += 1;
                let value = args.get(i).ok_or("--hold-ms requires a value")?;
                let ms: u64 = value
                    .parse()
                    .map_err(|_| format!("--hold-ms: '{value}' is not a number"))?;
                hold = Duration::from_millis(ms);
            }
            "--" => {
                runner_args = args[i + 1..].to_vec();
                break;
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if entry_point.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                entry_point = Some(arg.to_string());
            }
        }
        i += 1;
    }

    Ok(RunArgs {
        entry_point: entry_point.ok_or("missing required argument: <entry-point>")?,
        classpath,
        work_dir,
        runner,
        hold,
        runner_args,
    })
}

/// Logs callbacks; the CLI itself follows progress through `subscribe`.
struct LoggingEvents;

impl SubordinateEvents for LoggingEvents {
    fn on_connected(&self, subordinate: &SubordinateHandle) {
        tracing::info!(%subordinate, "Subordinate connected");
    }

    fn on_quit(&self, status: i32) {
        tracing::info!(status, "Subordinate quit");
    }
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let mut config = ControllerConfig::new(&args.entry_point).with_runner_args(args.runner_args);
    if let Some(runner) = args.runner {
        config = config.with_runner(runner);
    }
    let controller = MasterController::new(config, Arc::new(LoggingEvents))
        .context("failed to create controller")?;

    let mut request = LaunchRequest::new().with_classpath(args.classpath);
    if let Some(dir) = args.work_dir {
        request = request.with_work_dir(dir);
    }

    let mut states = controller.subscribe();
    controller.launch(request).await?;

    let reached = *states
        .wait_for(|state| *state != LifecycleState::StartingUp)
        .await
        .context("controller state channel closed")?;

    if reached == LifecycleState::Connected {
        tracing::info!(hold_ms = args.hold.as_millis() as u64, "Holding connection");
        tokio::time::sleep(args.hold).await;
        controller.request_quit().await?;
    }

    match controller.wait_for_exit().await {
        Ok(status) => {
            println!("subordinate exited with status {status}");
            Ok(status)
        }
        Err(ControllerError::StartupFailed { status }) => {
            println!("subordinate failed to start (status {status})");
            Ok(if status == 0 { 1 } else { status })
        }
        Err(e) => bail!(e),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let run_args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    init_tracing();

    match run(run_args).await {
        Ok(status) => process::exit(status.clamp(0, 255)),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}
