use std::process;
use std::time::Duration;

use tandem::logging::init_tracing;
use tandem::subordinate::{
    EXIT_USAGE, SubordinateArgs, SubordinateConfig, SubordinateRegistry, run_subordinate,
};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let (config, positionals) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!(
                "Usage: tandem-subordinate [options] <master-stub> <entry-point> <code-service-stub>"
            );
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --ping-interval-ms <ms>  Master liveness check period, 0 disables [default: 1000]");
            eprintln!("  --quit-delay-ms <ms>     Pause before exiting after quit [default: 100]");
            process::exit(EXIT_USAGE);
        }
    };

    let args = match SubordinateArgs::parse(positionals) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(e.exit_code());
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    let registry = SubordinateRegistry::with_builtins();
    let code = match runtime.block_on(run_subordinate(&args, &registry, &config)) {
        Ok(exit) => exit.code(),
        Err(e) => {
            tracing::error!(error = %e, "Subordinate failed");
            e.exit_code()
        }
    };
    drop(runtime);
    process::exit(code);
}

fn parse_args(args: &[String]) -> Result<(SubordinateConfig, Vec<String>), String> {
    let mut config = SubordinateConfig::default();
    let mut positionals = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--ping-interval-ms" => {
                i += 1;
                let ms = parse_millis(args.get(i), "--ping-interval-ms")?;
                config.ping_interval = (ms > 0).then(|| Duration::from_millis(ms));
            }
            "--quit-delay-ms" => {
                i += 1;
                config.quit_delay = Duration::from_millis(parse_millis(args.get(i), "--quit-delay-ms")?);
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => positionals.push(arg.to_string()),
        }
        i += 1;
    }

    Ok((config, positionals))
}

fn parse_millis(value: Option<&String>, flag: &str) -> Result<u64, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|_| format!("{flag}: '{value}' is not a number of milliseconds"))
}
