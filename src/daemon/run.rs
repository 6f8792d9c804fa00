//! Daemon bootstrap.
//!
//! Wires everything together: schema load, settings reload, peer
//! listener, bus link, signal handling, and the state thread. Returns the
//! process exit code so `main` stays a thin shell.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::core::{Schema, SettingStore, persist};
use crate::daemon::core::Daemon;
use crate::daemon::net::{self, Event};
use crate::daemon::server::run_state_loop;
use crate::error::Error;

const BUS_CONNECT_ATTEMPTS: u32 = 10;

/// The two directories whose definitions always win; a configured search
/// path is appended after them.
const FIXED_DEFINITIONS: &str =
    "/usr/share/fluid-settings/definitions:/var/lib/fluid-settings/definitions";

fn definitions_search_path(configured: &str) -> String {
    if configured == FIXED_DEFINITIONS || configured.is_empty() {
        FIXED_DEFINITIONS.to_string()
    } else {
        format!("{FIXED_DEFINITIONS}:{configured}")
    }
}

/// Run the daemon in the current process until shutdown.
pub fn run_daemon(config: Config) -> Result<i32, Error> {
    config.validate()?;

    let schema = Schema::load(&definitions_search_path(&config.definitions));
    tracing::info!(
        definitions = %config.definitions,
        settings = schema.len(),
        "schema loaded"
    );

    let mut store = SettingStore::new();
    persist::load(&mut store, &schema, &config.settings)?;
    tracing::info!(settings = store.len(), "settings reloaded from disk");

    // failing to bind the peer listener is fatal
    let listener = TcpListener::bind(&config.listen).map_err(|source| Error::Bind {
        endpoint: config.listen.clone(),
        source,
    })?;
    tracing::info!("listening for peers on {}", config.listen);

    // so is failing to reach the bus after all retries
    let bus_stream =
        net::connect_bus_with_retries(&config.bus, BUS_CONNECT_ATTEMPTS).map_err(|source| {
            Error::BusUnreachable {
                endpoint: config.bus.clone(),
                source,
            }
        })?;
    tracing::info!("connected to the bus at {}", config.bus);

    let (events_tx, events_rx) = crossbeam::channel::unbounded::<Event>();

    // SIGTERM/SIGINT turn into an ordinary shutdown event
    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());
    {
        let events_tx = events_tx.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    let _ = events_tx.send(Event::Shutdown);
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        });
    }

    net::spawn_peer_listener(listener, config.listen.clone(), events_tx.clone());
    net::spawn_bus_supervisor(bus_stream, config.bus.clone(), events_tx.clone());

    let daemon = Daemon::new(config, schema, store, events_tx);
    let code = run_state_loop(daemon, events_rx);
    tracing::info!(code, "daemon stopped");
    Ok(code)
}
