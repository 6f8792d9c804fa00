//! Socket plumbing.
//!
//! Three kinds of connections feed the state loop, all speaking the same
//! ndjson message framing:
//!
//! - the bus link, a permanent client connection that re-registers after
//!   every reconnect;
//! - the peer listener, accepting direct channels from other daemons;
//! - outbound peer channels we dial after a gossip.
//!
//! Every connection gets a reader thread that turns messages into
//! [`Event`]s and a writer thread that drains an outbound channel, so the
//! state loop never blocks on I/O.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::proto::{Message, MessageReader, commands, write_message};

/// The service name the daemon registers on the bus.
pub const SERVICE_NAME: &str = "fluid_settings";

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const BUS_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Everything the state loop reacts to.
pub enum Event {
    /// A message arrived on the bus.
    Bus(Message),
    /// The bus link is (re-)established; send through this handle.
    BusConnected(Sender<Message>),
    /// The bus link dropped; the supervisor is already reconnecting.
    BusDown,
    /// A direct peer channel identified itself.
    PeerConnected {
        endpoint: String,
        tx: Sender<Message>,
    },
    /// A message arrived on an identified peer channel.
    PeerMessage { endpoint: String, msg: Message },
    /// An identified peer channel closed.
    PeerClosed { endpoint: String, error: bool },
    /// A dial attempt failed before the channel was identified.
    PeerDialFailed { endpoint: String },
    /// SIGTERM/SIGINT.
    Shutdown,
}

/// Connect to the bus once, retrying a bounded number of times.
///
/// Start-up is the only moment a bus failure is fatal; afterwards
/// [`spawn_bus_supervisor`] reconnects forever.
pub fn connect_bus_with_retries(addr: &str, attempts: u32) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..attempts {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    attempts,
                    "bus connection to {addr} failed: {e}"
                );
                last_err = Some(e);
                std::thread::sleep(BUS_RECONNECT_DELAY);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no connection attempts made")))
}

/// Own the bus link for the life of the daemon.
///
/// Each established connection is registered under [`SERVICE_NAME`], gets
/// a writer thread, and is read until it drops; then the supervisor dials
/// again. The initial connection is handed in so start-up failures stay
/// fatal in `run_daemon`.
pub fn spawn_bus_supervisor(initial: TcpStream, addr: String, events: Sender<Event>) {
    std::thread::spawn(move || {
        let mut stream = Some(initial);
        loop {
            let connection = match stream.take() {
                Some(connection) => connection,
                None => match TcpStream::connect(&addr) {
                    Ok(connection) => connection,
                    Err(e) => {
                        tracing::warn!("bus reconnection to {addr} failed: {e}");
                        std::thread::sleep(BUS_RECONNECT_DELAY);
                        continue;
                    }
                },
            };

            if run_bus_session(connection, &events).is_err() {
                // the daemon is shutting down; stop reconnecting
                return;
            }
            std::thread::sleep(BUS_RECONNECT_DELAY);
        }
    });
}

/// Drive one bus connection until it drops.
///
/// Returns `Err` only when the state loop is gone and events cannot be
/// delivered anymore.
fn run_bus_session(stream: TcpStream, events: &Sender<Event>) -> Result<(), ()> {
    let (tx, rx) = unbounded::<Message>();
    let writer_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            tracing::error!("cannot clone bus stream: {e}");
            events.send(Event::BusDown).map_err(drop)?;
            return Ok(());
        }
    };
    let writer = spawn_writer("bus-writer", writer_stream, rx);

    // announce ourselves before anything else goes out
    let register = Message::new(commands::REGISTER)
        .with_parameter("service", SERVICE_NAME)
        .with_parameter("version", env!("CARGO_PKG_VERSION"));
    let _ = tx.send(register);

    events.send(Event::BusConnected(tx)).map_err(drop)?;

    let mut reader = MessageReader::new(BufReader::new(stream));
    loop {
        match reader.read_next() {
            Ok(Some(msg)) => events.send(Event::Bus(msg)).map_err(drop)?,
            Ok(None) => {
                tracing::warn!("bus closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("bus connection lost: {e}");
                break;
            }
        }
    }
    events.send(Event::BusDown).map_err(drop)?;
    let _ = writer.join();
    Ok(())
}

/// Bind the peer listener and accept direct channels from other daemons.
pub fn spawn_peer_listener(
    listener: TcpListener,
    local_endpoint: String,
    events: Sender<Event>,
) {
    std::thread::spawn(move || {
        for incoming in listener.incoming() {
            match incoming {
                Ok(stream) => {
                    let local = local_endpoint.clone();
                    let events = events.clone();
                    std::thread::spawn(move || run_peer_session(stream, local, events));
                }
                Err(e) => {
                    tracing::error!("peer listener accept failed: {e}");
                }
            }
        }
    });
}

/// Dial a peer discovered through gossip.
pub fn connect_to_peer(endpoint: String, local_endpoint: String, events: Sender<Event>) {
    std::thread::spawn(move || {
        let stream = match endpoint.to_socket_addrs().map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => TcpStream::connect_timeout(&addr, DIAL_TIMEOUT),
            Ok(None) => Err(std::io::Error::other("peer endpoint resolves to nothing")),
            Err(e) => Err(e),
        };
        match stream {
            Ok(stream) => run_peer_session(stream, local_endpoint, events),
            Err(e) => {
                tracing::warn!(peer = %endpoint, "peer dial failed: {e}");
                let _ = events.send(Event::PeerDialFailed { endpoint });
            }
        }
    });
}

/// Drive one direct peer channel.
///
/// Both sides open with `CONNECTED{my_ip}` so each end learns the other's
/// listener endpoint; everything after the hello is ordinary replication
/// traffic routed through the state loop.
fn run_peer_session(stream: TcpStream, local_endpoint: String, events: Sender<Event>) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let writer_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            tracing::warn!(peer = %peer_addr, "cannot clone peer stream: {e}");
            return;
        }
    };
    let (tx, rx) = unbounded::<Message>();
    let writer = spawn_writer("peer-writer", writer_stream, rx);

    let hello = Message::new(commands::CONNECTED).with_parameter("my_ip", &local_endpoint);
    let _ = tx.send(hello);

    let mut reader = MessageReader::new(BufReader::new(stream));

    // the hello identifies which daemon is on the other side
    let endpoint = match reader.read_next() {
        Ok(Some(msg)) if msg.command == commands::CONNECTED => {
            match msg.parameter("my_ip") {
                Some(endpoint) => endpoint.to_string(),
                None => {
                    tracing::warn!(peer = %peer_addr, "peer hello is missing my_ip");
                    return;
                }
            }
        }
        Ok(Some(msg)) => {
            tracing::warn!(
                peer = %peer_addr,
                command = %msg.command,
                "peer spoke before identifying itself"
            );
            return;
        }
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(peer = %peer_addr, "peer hello failed: {e}");
            return;
        }
    };

    if events
        .send(Event::PeerConnected {
            endpoint: endpoint.clone(),
            tx,
        })
        .is_err()
    {
        return;
    }

    let error = loop {
        match reader.read_next() {
            Ok(Some(msg)) => {
                let event = Event::PeerMessage {
                    endpoint: endpoint.clone(),
                    msg,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => break false,
            Err(e) => {
                tracing::warn!(peer = %endpoint, "peer channel lost: {e}");
                break true;
            }
        }
    };

    let _ = events.send(Event::PeerClosed { endpoint, error });
    let _ = writer.join();
}

/// Drain an outbound channel onto a socket. Exits when the channel closes
/// or the socket errors; the paired reader notices the loss.
fn spawn_writer(
    name: &'static str,
    mut stream: TcpStream,
    rx: Receiver<Message>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for msg in rx {
            if let Err(e) = write_message(&mut stream, &msg) {
                tracing::warn!("{name}: write failed: {e}");
                break;
            }
        }
        let _ = stream.shutdown(std::net::Shutdown::Both);
    })
}
