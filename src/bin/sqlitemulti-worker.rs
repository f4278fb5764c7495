//! sqlitemulti Worker Process
//!
//! The program a dispatcher starts for each worker when `own_process = true`
//! and no other `worker_program` is configured. It is not meant to be run by
//! hand: the parent passes the configuration in `SQLITEMULTI_WORKER_CONFIG`
//! and speaks JSON lines over stdin/stdout.
//!
//! Logs go to stderr (stdout carries reply frames). Set `RUST_LOG` to change
//! the filter, e.g. `RUST_LOG=sqlitemulti=debug`.

use std::process::ExitCode;

use sqlitemulti::process::{run_if_worker, WORKER_CONFIG_ENV};

/// Initializes the tracing subscriber on stderr.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sqlitemulti=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    match run_if_worker() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("sqlitemulti-worker is started by a dispatcher; {WORKER_CONFIG_ENV} is not set");
            ExitCode::from(2)
        }
        Err(err) => {
            tracing::error!(error = %err, "worker process failed");
            ExitCode::FAILURE
        }
    }
}
