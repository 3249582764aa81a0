//! filecast: a concurrent HTTP/1.0 and HTTP/1.1 file server.
//!
//! Serves GET and PUT requests for files under a fixed root directory,
//! rate-limiting each connection to a configured byte allowance per
//! one-second burst. Blocking file I/O runs on a small worker pool so the
//! single event-loop thread never stalls on disk.

mod bucket;
mod config;
mod connection;
mod registry;
mod request;
mod response;
mod server;
mod worker;

use std::process::ExitCode;

use config::Config;
use server::Server;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::info!(
        root = %config.root.display(),
        port = config.port,
        rate = config.rate,
        "starting filecast"
    );

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server exited with error");
            ExitCode::FAILURE
        }
    }
}
