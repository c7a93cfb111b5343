//! Socket-owning agent runtime.
//!
//! One agent thread per [`crate::Client`]: it dials, owns the socket and
//! the [`Session`], and multiplexes three inputs with `select!` — caller
//! commands, raw chunks from a dedicated reader thread, and the earliest
//! pending deadline. Writes happen inline on the agent thread, so a
//! pending entry is enqueued only after its frame reached the wire.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, after, never, unbounded};

use crate::config::{BackoffPolicy, Config};
use crate::error::DriverError;
use crate::protocol::{Arg, Op};

use super::{AckSender, Action, Session, Transmit, UserRequest};

/// Commands a client handle can send to its agent.
pub(crate) enum Command {
    Operation(UserRequest),
    NoResponse {
        op: Op,
        args: Vec<Arg>,
        ack: AckSender,
    },
    FetchSchema {
        ack: AckSender,
    },
    Stop {
        ack: Sender<()>,
    },
}

enum ReaderEvent {
    Chunk(Vec<u8>),
    Closed { error: Option<String> },
}

enum EpochEnd {
    /// Socket went down; try again (reconnect configured).
    Reconnect,
    /// Socket went down for good; keep answering `Closed`.
    Disconnected,
    /// Stop, fatal handshake failure, or every handle dropped.
    Exit,
}

pub(crate) fn spawn(config: Config, ready: AckSender) -> Sender<Command> {
    let (command_tx, command_rx) = unbounded();
    thread::spawn(move || agent_loop(config, command_rx, ready));
    command_tx
}

fn agent_loop(config: Config, commands: Receiver<Command>, ready: AckSender) {
    let mut session = Session::new(config.clone());
    session.set_ready_signal(ready);
    let mut backoff = Backoff::new(config.backoff);
    let mut first_attempt = true;

    loop {
        match open_socket(&config) {
            Ok(stream) => {
                backoff.reset();
                first_attempt = false;
                match run_connection(&config, &mut session, stream, &commands) {
                    EpochEnd::Exit => return,
                    EpochEnd::Reconnect => {}
                    EpochEnd::Disconnected => break,
                }
            }
            Err(err) => {
                session.on_connect_failed(&err);
                // An initial dial failure already failed `connect()`;
                // only established sessions come back on their own.
                if first_attempt || !config.reconnect {
                    break;
                }
            }
        }
        if !config.reconnect {
            break;
        }
        // Between dial attempts the session is Disconnected: answer
        // queued commands (they fail fast) and notice dropped handles
        // rather than redialing for nobody.
        loop {
            match commands.try_recv() {
                Ok(Command::Stop { ack }) => {
                    let _ = ack.send(());
                    return;
                }
                Ok(Command::Operation(req)) => {
                    let _ = session.on_request(req, Instant::now());
                }
                Ok(Command::NoResponse { ack, .. }) | Ok(Command::FetchSchema { ack }) => {
                    let _ = ack.send(Err(DriverError::Closed));
                }
                Err(crossbeam::channel::TryRecvError::Empty) => break,
                Err(crossbeam::channel::TryRecvError::Disconnected) => return,
            }
        }
        thread::sleep(backoff.next_delay());
    }

    serve_disconnected(&mut session, &commands);
}

fn run_connection(
    config: &Config,
    session: &mut Session,
    stream: TcpStream,
    commands: &Receiver<Command>,
) -> EpochEnd {
    if config.socket.nodelay
        && let Err(err) = stream.set_nodelay(true)
    {
        tracing::debug!(error = %err, "set_nodelay failed");
    }

    let reader_stream = match stream.try_clone() {
        Ok(reader_stream) => reader_stream,
        Err(err) => {
            session.on_connect_failed(&err);
            return if config.reconnect {
                EpochEnd::Reconnect
            } else {
                EpochEnd::Disconnected
            };
        }
    };

    let (event_tx, event_rx) = unbounded();
    let chunk_bytes = config.limits.read_chunk_bytes.max(1);
    let reader = thread::spawn(move || read_loop(reader_stream, event_tx, chunk_bytes));

    let mut writer = stream;
    session.on_connected();
    tracing::debug!(host = %config.host, port = config.port, "connected");

    let end = drive(session, &mut writer, commands, &event_rx);

    let _ = writer.shutdown(Shutdown::Both);
    let _ = reader.join();
    end
}

fn drive(
    session: &mut Session,
    writer: &mut TcpStream,
    commands: &Receiver<Command>,
    events: &Receiver<ReaderEvent>,
) -> EpochEnd {
    loop {
        let deadline = match session.next_deadline() {
            Some(at) => after(at.saturating_duration_since(Instant::now())),
            None => never(),
        };

        crossbeam::select! {
            recv(commands) -> command => {
                let now = Instant::now();
                let actions = match command {
                    // Every handle dropped: drain and exit quietly.
                    Err(_) => session.on_stop(),
                    Ok(Command::Operation(req)) => session.on_request(req, now),
                    Ok(Command::NoResponse { op, args, ack }) => {
                        session.on_no_response(op, args, ack)
                    }
                    Ok(Command::FetchSchema { ack }) => session.on_fetch_schema(ack, now),
                    Ok(Command::Stop { ack }) => {
                        let stop_actions = session.on_stop();
                        let end = apply(session, writer, stop_actions);
                        let _ = ack.send(());
                        return end.unwrap_or(EpochEnd::Exit);
                    }
                };
                if let Some(end) = apply(session, writer, actions) {
                    return end;
                }
            }
            recv(events) -> event => {
                let now = Instant::now();
                let actions = match event {
                    Ok(ReaderEvent::Chunk(bytes)) => session.on_bytes(&bytes, now),
                    Ok(ReaderEvent::Closed { error }) => {
                        let reason = match error {
                            Some(error) => DriverError::Transport(error),
                            None => DriverError::Closed,
                        };
                        session.on_disconnected(reason)
                    }
                    Err(_) => session.on_disconnected(DriverError::Closed),
                };
                if let Some(end) = apply(session, writer, actions) {
                    return end;
                }
            }
            recv(deadline) -> _ => {
                let actions = session.on_tick(Instant::now());
                if let Some(end) = apply(session, writer, actions) {
                    return end;
                }
            }
        }
    }
}

/// Executes session actions. Writes must not mutate the queue until they
/// succeed: the pending slot rides along in the action and is committed
/// only after `write_all` returns.
fn apply(session: &mut Session, writer: &mut TcpStream, actions: Vec<Action>) -> Option<EpochEnd> {
    let mut end = None;
    for action in actions {
        match action {
            Action::Transmit(transmit) => {
                if end.is_some() {
                    settle_unwritten(transmit);
                    continue;
                }
                let Transmit { frame, pending, ack } = transmit;
                match writer.write_all(&frame) {
                    Ok(()) => {
                        if let Some(pending) = pending {
                            session.commit_pending(pending);
                        }
                        if let Some(ack) = ack {
                            ack.settle(Ok(()));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "socket write failed");
                        let reason = DriverError::transport(&err);
                        if let Some(pending) = pending {
                            pending.fail(reason.clone());
                        }
                        if let Some(ack) = ack {
                            ack.settle(Err(reason.clone()));
                        }
                        for follow_up in session.on_disconnected(reason) {
                            if let Action::Close { reconnect } = follow_up {
                                end = Some(close_end(reconnect));
                            }
                        }
                    }
                }
            }
            Action::Close { reconnect } => {
                end = Some(close_end(reconnect));
            }
            Action::Exit => {
                end = Some(EpochEnd::Exit);
            }
        }
    }
    end
}

fn close_end(reconnect: bool) -> EpochEnd {
    if reconnect {
        EpochEnd::Reconnect
    } else {
        EpochEnd::Disconnected
    }
}

fn settle_unwritten(transmit: Transmit) {
    if let Some(pending) = transmit.pending {
        pending.fail(DriverError::Closed);
    }
    if let Some(ack) = transmit.ack {
        ack.settle(Err(DriverError::Closed));
    }
}

/// No socket and no reconnect: answer `Closed` until stopped or dropped.
fn serve_disconnected(session: &mut Session, commands: &Receiver<Command>) {
    loop {
        match commands.recv() {
            Err(_) => return,
            Ok(Command::Stop { ack }) => {
                let _ = ack.send(());
                return;
            }
            Ok(Command::Operation(req)) => {
                let _ = session.on_request(req, Instant::now());
            }
            Ok(Command::NoResponse { ack, .. }) | Ok(Command::FetchSchema { ack }) => {
                let _ = ack.send(Err(DriverError::Closed));
            }
        }
    }
}

fn read_loop(mut stream: TcpStream, events: Sender<ReaderEvent>, chunk_bytes: usize) {
    let mut buf = vec![0u8; chunk_bytes];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                let _ = events.send(ReaderEvent::Closed { error: None });
                return;
            }
            Ok(n) => {
                if events.send(ReaderEvent::Chunk(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = events.send(ReaderEvent::Closed {
                    error: Some(err.to_string()),
                });
                return;
            }
        }
    }
}

fn open_socket(config: &Config) -> io::Result<TcpStream> {
    let addrs = (config.host.as_str(), config.port).to_socket_addrs()?;
    let timeout = config.socket.connect_timeout_ms.map(Duration::from_millis);
    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")))
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            base: policy.base(),
            max: policy.max(),
            current: policy.base(),
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base_ms: 100,
            max_ms: 350,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
