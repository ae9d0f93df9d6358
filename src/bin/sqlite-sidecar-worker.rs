use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// SQLite worker process. Speaks newline-delimited JSON-RPC with its
/// parent; not intended to be run by hand.
#[derive(Parser, Debug)]
#[command(name = "sqlite-sidecar-worker", version)]
struct Args {
    /// `host:port` of the parent's loopback listener to connect back to.
    /// When absent the worker serves its standard streams.
    endpoint: Option<String>,
}

fn main() -> ExitCode {
    // Diagnostics go to stderr, which the parent leaves attached to its
    // own so worker output stays visible.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let code = sqlite_sidecar::worker::run(args.endpoint.as_deref());
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
