//! Accept demo
//!
//! Listens on one address and logs every accept notification. Accepted
//! streams are parked in a connection table and dropped right away.
//!
//! Run: RUST_LOG=info ./target/release/accept-demo [address] [port] [backlog]
//! Defaults: 127.0.0.1 9000, backlog from TCPSRV_DEFAULT_BACKLOG.
//! Pause/resume: every 5th connection pauses the socket for one second.

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use tcpsrv::{ConnectionTable, ManagerConfig, ServerSocketManager};
use tcpsrv_core::{AcceptEvent, SocketProperties};

const PAUSE_EVERY: u64 = 5;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match args.next().map(|p| p.parse::<u16>()) {
        None => 9000,
        Some(Ok(port)) => port,
        Some(Err(e)) => {
            error!("bad port: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let backlog = args.next().and_then(|b| b.parse::<i32>().ok());

    let table = Arc::new(ConnectionTable::new());
    let manager = match ServerSocketManager::with_connection_registry(ManagerConfig::from_env(), table.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let accepts = manager.subscribe_accept_notifications();
    let id = manager.create(&SocketProperties::default().name("accept-demo"));
    if let Err(e) = manager.listen(id, &address, port, backlog) {
        error!("listen failed ({}): {}", e.result_code(), e);
        return ExitCode::FAILURE;
    }
    match manager.get_info(id) {
        Ok(info) => info!("{:?}", info),
        Err(e) => warn!("{}", e),
    }

    let mut accepted = 0u64;
    for event in accepts.iter() {
        match event {
            AcceptEvent::Accepted { socket_id, client_socket_id } => {
                accepted += 1;
                let peer = table
                    .take(client_socket_id)
                    .and_then(|stream| stream.peer_addr().ok());
                info!("socket {} accepted connection {} from {:?}", socket_id, client_socket_id, peer);

                if accepted % PAUSE_EVERY == 0 {
                    info!("pausing socket {} for 1s", socket_id);
                    if let Err(e) = manager.set_paused(socket_id, true).and_then(|c| c.wait()) {
                        warn!("pause failed: {}", e);
                    }
                    thread::sleep(Duration::from_secs(1));
                    if let Err(e) = manager.set_paused(socket_id, false).and_then(|c| c.wait()) {
                        warn!("resume failed: {}", e);
                    }
                }
            }
            AcceptEvent::Failed { socket_id, error } => {
                error!("accept failure on {:?}: {} ({})", socket_id, error.message, error.result_code);
                if socket_id.is_none() {
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}
