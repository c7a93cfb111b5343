//! Public request/reply handle over a session agent.

use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, bounded};

use crate::config::Config;
use crate::error::DriverError;
use crate::protocol::{Arg, Op, Reply};
use crate::session::runtime::{self, Command};
use crate::session::UserRequest;

/// A handle to one server or database session.
///
/// Cheap to clone; all clones talk to the same agent thread and share its
/// pipeline. Requests may be issued from any thread and are answered in
/// issue order. Dropping every clone stops the agent.
#[derive(Clone, Debug)]
pub struct Client {
    commands: Sender<Command>,
    default_deadline: Duration,
}

impl Client {
    /// Opens the session and blocks until it is ready: socket connected,
    /// handshake accepted, and (for database targets) the schema cached.
    pub fn connect(config: Config) -> crate::Result<Self> {
        let default_deadline = config.default_deadline();
        let (ready_tx, ready_rx) = bounded(1);
        let commands = runtime::spawn(config, ready_tx);
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                default_deadline,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DriverError::Closed),
        }
    }

    /// Issues one operation and waits for its reply (default deadline).
    pub fn operation(&self, op: Op, args: Vec<Arg>) -> crate::Result<Reply> {
        self.operation_with_deadline(op, args, self.default_deadline)
    }

    /// Issues one operation with an explicit per-call deadline. The agent
    /// enforces it: an expired call gets `Timeout` and its reply slot is
    /// drained when the server eventually answers.
    pub fn operation_with_deadline(
        &self,
        op: Op,
        args: Vec<Arg>,
        deadline: Duration,
    ) -> crate::Result<Reply> {
        let (reply_tx, reply_rx) = bounded(1);
        let request = UserRequest {
            op,
            args,
            deadline: Instant::now() + deadline,
            reply: reply_tx,
        };
        self.commands
            .send(Command::Operation(request))
            .map_err(|_| DriverError::Closed)?;
        reply_rx.recv().map_err(|_| DriverError::Closed)?
    }

    /// Fire-and-forget ops (`shutdown`, `db_close`): resolves once the
    /// frame reached the wire; no server reply is expected.
    pub fn no_response_operation(&self, op: Op, args: Vec<Arg>) -> crate::Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.commands
            .send(Command::NoResponse {
                op,
                args,
                ack: ack_tx,
            })
            .map_err(|_| DriverError::Closed)?;
        ack_rx.recv().map_err(|_| DriverError::Closed)?
    }

    /// Refetches the global-property schema and replaces the cache.
    /// Useful after `UnknownPropertyId`, before retrying the call.
    pub fn fetch_schema(&self) -> crate::Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.commands
            .send(Command::FetchSchema { ack: ack_tx })
            .map_err(|_| DriverError::Closed)?;
        ack_rx.recv().map_err(|_| DriverError::Closed)?
    }

    /// Cooperative stop: queued callers get `Closed`, the socket closes,
    /// the agent exits. Idempotent from the caller's point of view.
    pub fn stop(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.commands.send(Command::Stop { ack: ack_tx }).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}
