//! The state loop.
//!
//! This is THE serialization point: one thread owns the [`Daemon`] and
//! processes bus messages, peer traffic, and timer deadlines one at a
//! time. Connection threads never touch state; they only exchange
//! [`Event`]s and outbound messages with this loop.

use std::time::Instant;

use crossbeam::channel::Receiver;

use crate::daemon::core::Daemon;
use crate::daemon::net::Event;

/// Run until an exit is requested (signal, bus `STOP`/`RESTART`) or every
/// event producer is gone. Returns the process exit code.
pub fn run_state_loop(mut daemon: Daemon, events: Receiver<Event>) -> i32 {
    loop {
        let tick = match daemon.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                crossbeam::channel::after(wait)
            }
            None => crossbeam::channel::never(),
        };

        crossbeam::select! {
            recv(events) -> event => match event {
                Ok(event) => daemon.handle_event(event),
                Err(_) => {
                    tracing::error!("all event sources disconnected");
                    daemon.request_exit(1);
                }
            },
            recv(tick) -> _ => daemon.on_tick(Instant::now()),
        }

        if let Some(code) = daemon.exit_code() {
            daemon.final_save();
            return code;
        }
    }
}
