//! Relay between editors and a completion backend.
//!
//! Each editor socket gets its own upstream connection, opened when the
//! editor connects and closed when it goes away.
//!
//! Environment:
//! - `QUILL_TARGET_HOST` (required) upstream `ws://` / `wss://` URL
//! - `QUILL_WS_HOST`, `QUILL_WS_PORT` listen address (default `0.0.0.0:8080`)
//! - `QUILL_IDLE_TIMEOUT_MILLIS` upstream idle close, `0` disables
//! - `QUILL_REQUEST_TIMEOUT_MILLIS` upstream request deadline
//! - `QUILL_HEARTBEAT_SECS` heartbeat interval towards editors

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use quill_link::{Hub, LinkConfig, ServerConfig, Transport};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let link = match LinkConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid upstream configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let server = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid listener configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Starting Quill relay on {} -> {} (idle {:?}, request timeout {:?})",
        server.bind_addr, link.url, link.idle_timeout, link.request_timeout
    );

    let hub = Arc::new(Hub::new(link));
    let transport = Arc::new(Transport::new(server, hub));

    let runner = Arc::clone(&transport);
    tokio::select! {
        result = runner.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            transport.shutdown();
        }
    }

    ExitCode::SUCCESS
}
