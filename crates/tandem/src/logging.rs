//! Tracing setup shared by the master CLI and the subordinate runner.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Coarse level knob used when `RUST_LOG` is unset.
pub const LOG_ENV: &str = "TANDEM_LOG";

/// `RUST_LOG` wins; otherwise `TANDEM_LOG` (debug|warn|error, default info)
/// sets the level for the tandem crates. `LOG_FORMAT=json` switches to JSON
/// lines. Always writes to stderr: subordinate stdout belongs to the
/// application. Safe to call more than once.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(std::env::var(LOG_ENV).ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!(
        "tandem={level},tandem_cli={level},tandem_subordinate={level},tandem::bridge=warn",
        level = level
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_defaults_to_info() {
        assert!(default_directives(None).starts_with("tandem=info,"));
        assert!(default_directives(Some("bogus")).starts_with("tandem=info,"));
    }

    #[test]
    fn level_aliases() {
        assert!(default_directives(Some("warning")).starts_with("tandem=warn,"));
        assert!(default_directives(Some("debug")).contains("tandem_cli=debug"));
        assert!(default_directives(Some("error")).ends_with("tandem::bridge=warn"));
    }
}
