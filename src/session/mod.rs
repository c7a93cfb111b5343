//! Connection state machine.
//!
//! [`Session`] is pure with respect to I/O: the runtime feeds it socket
//! bytes, caller requests, and clock ticks, and it hands back actions
//! (frames to transmit, socket teardown). All session state — the pending
//! queue, the unparsed tail, the schema cache, the transaction counter —
//! lives here and is touched only by the agent thread that owns the
//! socket, so ordering needs no locks and responses need no correlation
//! ids: the server answers in request order and the queue head always
//! names the decoder for the next bytes.

pub mod runtime;

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use crossbeam::channel::Sender;

use crate::config::{Config, Target};
use crate::error::{DriverError, ErrorEntry};
use crate::protocol::{
    self, Arg, Op, Reply, Scope,
    response::{CallFault, DecodeOutcome, decode_response},
};
use crate::record::Schema;

pub type ReplySender = Sender<Result<Reply, DriverError>>;
pub type AckSender = Sender<Result<(), DriverError>>;

/// Session lifecycle. `Handshaking` subdivides the connect sequence: the
/// protocol preamble has been checked and the auth request is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Handshaking,
    Authenticated,
    Ready,
    Draining,
}

/// A caller request as it arrives over the command channel.
#[derive(Debug)]
pub struct UserRequest {
    pub op: Op,
    pub args: Vec<Arg>,
    pub deadline: Instant,
    pub reply: ReplySender,
}

/// Who is waiting on the response at one queue position.
#[derive(Debug)]
enum Waiter {
    /// The connect/db_open reply; drives the phase transition.
    Handshake,
    /// Schema record load. The connect-time fetch is `internal`; an
    /// explicit refetch carries a caller ack (dropped on timeout, the
    /// schema itself is still applied when the record arrives).
    SchemaFetch { internal: bool, ack: Option<AckSender> },
    /// An ordinary call. `None` once the deadline fired: the reply slot
    /// is abandoned and its bytes are drained without a caller.
    Caller(Option<ReplySender>),
}

/// One in-flight request. Queue position is the only correlation.
#[derive(Debug)]
pub struct Pending {
    op: Op,
    waiter: Waiter,
    deadline: Instant,
}

impl Pending {
    /// Fails whoever is waiting; used by the runtime when the write that
    /// would have enqueued this entry did not reach the wire.
    pub fn fail(self, err: DriverError) {
        match self.waiter {
            Waiter::Handshake | Waiter::SchemaFetch { ack: None, .. } => {}
            Waiter::SchemaFetch { ack: Some(ack), .. } => {
                let _ = ack.send(Err(err));
            }
            Waiter::Caller(Some(reply)) => {
                let _ = reply.send(Err(err));
            }
            Waiter::Caller(None) => {}
        }
    }

    fn deadline_matters(&self) -> bool {
        match &self.waiter {
            Waiter::Handshake => true,
            Waiter::SchemaFetch { internal, ack } => *internal || ack.is_some(),
            Waiter::Caller(slot) => slot.is_some(),
        }
    }
}

/// Settled once the runtime knows whether the frame reached the wire.
#[derive(Debug)]
pub enum WriteAck {
    /// `no_response_operation` caller.
    Unit(AckSender),
    /// `operation()` caller on a fire-and-forget op; gets `Reply::Unit`.
    Reply(ReplySender),
}

impl WriteAck {
    pub fn settle(self, result: Result<(), DriverError>) {
        match self {
            WriteAck::Unit(ack) => {
                let _ = ack.send(result);
            }
            WriteAck::Reply(reply) => {
                let _ = reply.send(result.map(|()| Reply::Unit));
            }
        }
    }
}

/// Frame to put on the wire, plus what the write outcome settles.
#[derive(Debug)]
pub struct Transmit {
    pub frame: Vec<u8>,
    /// Enqueued (tail of the pending queue) once the write succeeds.
    pub pending: Option<Pending>,
    /// Acked once the write succeeds (fire-and-forget).
    pub ack: Option<WriteAck>,
}

/// What the runtime must do next.
#[derive(Debug)]
pub enum Action {
    Transmit(Transmit),
    /// Tear down this connection epoch.
    Close { reconnect: bool },
    /// The agent is done (stop, or fatal handshake failure).
    Exit,
}

pub struct Session {
    config: Config,
    phase: SessionPhase,
    session_id: i32,
    queue: VecDeque<Pending>,
    tail: BytesMut,
    schema: Option<Schema>,
    transaction_id: i32,
    /// Requests that arrived while (re)connecting; flushed on Ready.
    deferred: VecDeque<UserRequest>,
    /// Signals the initial `Client::connect` caller exactly once.
    ready_signal: Option<AckSender>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            phase: SessionPhase::Disconnected,
            session_id: protocol::NO_SESSION,
            queue: VecDeque::new(),
            tail: BytesMut::new(),
            schema: None,
            transaction_id: 1,
            deferred: VecDeque::new(),
            ready_signal: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn set_ready_signal(&mut self, signal: AckSender) {
        self.ready_signal = Some(signal);
    }

    fn target_scope(&self) -> Scope {
        match self.config.connection {
            Target::Server => Scope::Server,
            Target::Database { .. } => Scope::Database,
        }
    }

    fn signal_ready(&mut self, result: Result<(), DriverError>) {
        if let Some(signal) = self.ready_signal.take() {
            let _ = signal.send(result);
        }
    }

    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    /// A socket is open; the server speaks first (2-byte protocol).
    pub fn on_connected(&mut self) {
        self.tail.clear();
        self.phase = SessionPhase::Connecting;
    }

    /// The dial itself failed. The initial `connect` caller (if still
    /// waiting) fails fast; reconnect epochs just try again.
    pub fn on_connect_failed(&mut self, err: &std::io::Error) {
        tracing::warn!(error = %err, "connect failed");
        self.signal_ready(Err(DriverError::transport(err)));
        self.phase = SessionPhase::Disconnected;
    }

    /// Socket closed or errored. Every queued caller gets exactly one
    /// `Closed`; counters and caches reset for the next epoch.
    pub fn on_disconnected(&mut self, reason: DriverError) -> Vec<Action> {
        tracing::warn!(phase = ?self.phase, %reason, "session disconnected");
        self.signal_ready(Err(reason));
        self.reset_to_disconnected();

        let reconnect = self.config.reconnect;
        if !reconnect {
            for req in self.deferred.drain(..) {
                let _ = req.reply.send(Err(DriverError::Closed));
            }
        }
        vec![Action::Close { reconnect }]
    }

    fn reset_to_disconnected(&mut self) {
        for pending in self.queue.drain(..) {
            pending.fail(DriverError::Closed);
        }
        self.session_id = protocol::NO_SESSION;
        self.schema = None;
        self.transaction_id = 1;
        self.tail.clear();
        self.phase = SessionPhase::Disconnected;
    }

    /// Handshake-stage failures are final: no reconnect will fix bad
    /// credentials or an old server.
    fn fail_fatally(&mut self, err: DriverError) -> Vec<Action> {
        self.signal_ready(Err(err));
        self.reset_to_disconnected();
        for req in self.deferred.drain(..) {
            let _ = req.reply.send(Err(DriverError::Closed));
        }
        vec![Action::Close { reconnect: false }, Action::Exit]
    }

    /// Enqueues a pending entry whose request reached the wire.
    pub fn commit_pending(&mut self, pending: Pending) {
        self.queue.push_back(pending);
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    pub fn on_bytes(&mut self, chunk: &[u8], now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        self.tail.extend_from_slice(chunk);

        if self.phase == SessionPhase::Connecting {
            self.check_preamble(now, &mut actions);
        }
        if matches!(self.phase, SessionPhase::Disconnected | SessionPhase::Draining) {
            return actions;
        }
        self.drain_tail(now, &mut actions);
        actions
    }

    /// The server-sent protocol short that opens every connection.
    fn check_preamble(&mut self, now: Instant, actions: &mut Vec<Action>) {
        if self.tail.len() < 2 {
            return;
        }
        let server = i16::from_be_bytes([self.tail[0], self.tail[1]]);
        self.tail.advance(2);

        if server < self.config.min_protocol {
            tracing::warn!(server, minimum = self.config.min_protocol, "protocol too old");
            actions.extend(self.fail_fatally(DriverError::UnsupportedProtocol {
                server,
                minimum: self.config.min_protocol,
            }));
            return;
        }

        let (op, frame) = match &self.config.connection {
            Target::Server => (Op::Connect, protocol::connect_request(&self.config)),
            Target::Database { name, kind } => (
                Op::DbOpen,
                protocol::db_open_request(&self.config, name, kind.as_str()),
            ),
        };
        self.phase = SessionPhase::Handshaking;
        actions.push(Action::Transmit(Transmit {
            frame,
            pending: Some(Pending {
                op,
                waiter: Waiter::Handshake,
                deadline: now + self.config.default_deadline(),
            }),
            ack: None,
        }));
    }

    /// Runs the queue-head decoder over the tail until it runs dry. One
    /// inbound chunk may complete several pipelined responses.
    fn drain_tail(&mut self, now: Instant, actions: &mut Vec<Action>) {
        loop {
            let Some(front) = self.queue.front() else {
                return; // stash unparsed bytes until the next request
            };
            let op = front.op;
            let outcome =
                decode_response(op, &self.tail, self.schema.as_ref(), &self.config.limits);
            match outcome {
                DecodeOutcome::Incomplete => return,
                DecodeOutcome::Corrupt { reason } => {
                    tracing::error!(op = op.name(), %reason, "response stream desynchronized");
                    if let Some(head) = self.queue.pop_front() {
                        head.fail(DriverError::MalformedResponse(reason.clone()));
                    }
                    actions.extend(self.on_disconnected(DriverError::MalformedResponse(reason)));
                    return;
                }
                DecodeOutcome::Done { result, consumed } => {
                    self.tail.advance(consumed);
                    let Some(head) = self.queue.pop_front() else {
                        return;
                    };
                    self.settle(head, result, now, actions);
                    if matches!(
                        self.phase,
                        SessionPhase::Disconnected | SessionPhase::Draining
                    ) {
                        return;
                    }
                }
            }
        }
    }

    fn settle(
        &mut self,
        head: Pending,
        result: Result<Reply, CallFault>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        match head.waiter {
            Waiter::Handshake => self.settle_handshake(result, now, actions),
            Waiter::SchemaFetch { internal, ack } => {
                self.settle_schema(internal, ack, result, now, actions);
            }
            Waiter::Caller(Some(reply)) => {
                let _ = reply.send(result.map_err(fault_to_error));
            }
            Waiter::Caller(None) => {
                tracing::debug!(op = head.op.name(), "drained abandoned reply");
            }
        }
    }

    fn settle_handshake(
        &mut self,
        result: Result<Reply, CallFault>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        match result {
            Ok(Reply::Session { session_id, .. }) => {
                self.session_id = session_id;
                self.phase = SessionPhase::Authenticated;
                tracing::debug!(session_id, "authenticated");
                if self.config.is_database() {
                    self.send_schema_fetch(true, None, now, actions);
                } else {
                    self.enter_ready(now, actions);
                }
            }
            Ok(_) => {
                actions.extend(self.fail_fatally(DriverError::MalformedResponse(
                    "handshake reply carried no session".to_string(),
                )));
            }
            Err(fault) => {
                let err = match fault {
                    CallFault::Server(entries) => auth_error(entries),
                    other => fault_to_error(other),
                };
                actions.extend(self.fail_fatally(err));
            }
        }
    }

    fn settle_schema(
        &mut self,
        _internal: bool,
        ack: Option<AckSender>,
        result: Result<Reply, CallFault>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let parsed = match result {
            Ok(Reply::Record(Some(record))) => Schema::from_document(&record.document)
                .map_err(|err| DriverError::MalformedResponse(err.to_string())),
            Ok(Reply::Record(None)) => Err(DriverError::MalformedResponse(
                "schema record #0:1 does not exist".to_string(),
            )),
            Ok(_) => Err(DriverError::MalformedResponse(
                "schema fetch returned a non-record reply".to_string(),
            )),
            Err(fault) => Err(fault_to_error(fault)),
        };

        match parsed {
            Ok(schema) => {
                tracing::debug!(properties = schema.len(), "schema cached");
                self.schema = Some(schema);
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                if self.phase == SessionPhase::Authenticated {
                    self.enter_ready(now, actions);
                }
            }
            Err(err) => {
                // A session without a schema cannot decode schemaful
                // records; tear it down rather than limp along.
                if let Some(ack) = ack {
                    let _ = ack.send(Err(err.clone()));
                }
                actions.extend(self.on_disconnected(err));
            }
        }
    }

    fn enter_ready(&mut self, now: Instant, actions: &mut Vec<Action>) {
        self.phase = SessionPhase::Ready;
        tracing::debug!(session_id = self.session_id, "session ready");
        self.signal_ready(Ok(()));
        let deferred: Vec<UserRequest> = self.deferred.drain(..).collect();
        for req in deferred {
            actions.extend(self.on_request(req, now));
        }
    }

    fn send_schema_fetch(
        &mut self,
        internal: bool,
        ack: Option<AckSender>,
        now: Instant,
        actions: &mut Vec<Action>,
    ) {
        let frame = protocol::encode_request(
            Op::RecordLoad,
            self.session_id,
            &protocol::schema_load_args(),
        );
        actions.push(Action::Transmit(Transmit {
            frame,
            pending: Some(Pending {
                op: Op::RecordLoad,
                waiter: Waiter::SchemaFetch { internal, ack },
                deadline: now + self.config.default_deadline(),
            }),
            ack: None,
        }));
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    pub fn on_request(&mut self, req: UserRequest, _now: Instant) -> Vec<Action> {
        match self.phase {
            SessionPhase::Disconnected | SessionPhase::Draining => {
                let _ = req.reply.send(Err(DriverError::Closed));
                return Vec::new();
            }
            SessionPhase::Connecting | SessionPhase::Handshaking | SessionPhase::Authenticated => {
                // Reconnect window: hold the request until Ready.
                self.deferred.push_back(req);
                return Vec::new();
            }
            SessionPhase::Ready => {}
        }

        let scope = self.target_scope();
        if req.op.scope() != scope {
            let _ = req.reply.send(Err(DriverError::WrongScope {
                op: req.op.name(),
                scope: scope.as_str(),
            }));
            return Vec::new();
        }

        let mut args = req.args;
        if req.op == Op::TxCommit {
            let tx_id = self.next_transaction_id();
            substitute_tx_id(&mut args, tx_id);
        }

        let frame = protocol::encode_request(req.op, self.session_id, &args);
        if req.op.fire_and_forget() {
            return vec![Action::Transmit(Transmit {
                frame,
                pending: None,
                ack: Some(WriteAck::Reply(req.reply)),
            })];
        }

        vec![Action::Transmit(Transmit {
            frame,
            pending: Some(Pending {
                op: req.op,
                waiter: Waiter::Caller(Some(req.reply)),
                deadline: req.deadline,
            }),
            ack: None,
        })]
    }

    /// Fire-and-forget path (`shutdown`, `db_close`): the frame is
    /// written, nothing is enqueued, the ack reports the write result.
    pub fn on_no_response(&mut self, op: Op, args: Vec<Arg>, ack: AckSender) -> Vec<Action> {
        if self.phase != SessionPhase::Ready {
            let _ = ack.send(Err(DriverError::Closed));
            return Vec::new();
        }
        let scope = self.target_scope();
        if op.scope() != scope {
            let _ = ack.send(Err(DriverError::WrongScope {
                op: op.name(),
                scope: scope.as_str(),
            }));
            return Vec::new();
        }
        let frame = protocol::encode_request(op, self.session_id, &args);
        vec![Action::Transmit(Transmit {
            frame,
            pending: None,
            ack: Some(WriteAck::Unit(ack)),
        })]
    }

    pub fn on_fetch_schema(&mut self, ack: AckSender, now: Instant) -> Vec<Action> {
        if self.phase != SessionPhase::Ready {
            let _ = ack.send(Err(DriverError::Closed));
            return Vec::new();
        }
        if self.target_scope() != Scope::Database {
            let _ = ack.send(Err(DriverError::WrongScope {
                op: "fetch_schema",
                scope: Scope::Server.as_str(),
            }));
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.send_schema_fetch(false, Some(ack), now, &mut actions);
        actions
    }

    /// Cooperative stop: queued callers get `Closed`, the socket goes
    /// down, the agent exits. Writes are synchronous so there is nothing
    /// left to flush by the time this runs.
    pub fn on_stop(&mut self) -> Vec<Action> {
        self.phase = SessionPhase::Draining;
        self.reset_to_disconnected();
        for req in self.deferred.drain(..) {
            let _ = req.reply.send(Err(DriverError::Closed));
        }
        vec![Action::Close { reconnect: false }, Action::Exit]
    }

    fn next_transaction_id(&mut self) -> i32 {
        let id = self.transaction_id;
        self.transaction_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // Deadlines
    // ------------------------------------------------------------------

    /// Expires call deadlines. A timed-out caller gets `Timeout` and its
    /// queue slot is abandoned in place, so response ordering holds; an
    /// expired handshake or internal schema fetch tears the session down.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let mut lifecycle_expired = false;
        for pending in &mut self.queue {
            if pending.deadline > now {
                continue;
            }
            match &mut pending.waiter {
                Waiter::Caller(slot) => {
                    if let Some(reply) = slot.take() {
                        tracing::debug!(op = pending.op.name(), "call deadline elapsed");
                        let _ = reply.send(Err(DriverError::Timeout));
                    }
                }
                Waiter::SchemaFetch { internal, ack } => {
                    if let Some(ack) = ack.take() {
                        let _ = ack.send(Err(DriverError::Timeout));
                    } else if *internal {
                        lifecycle_expired = true;
                    }
                }
                Waiter::Handshake => lifecycle_expired = true,
            }
        }

        let mut kept = VecDeque::with_capacity(self.deferred.len());
        for req in self.deferred.drain(..) {
            if req.deadline <= now {
                let _ = req.reply.send(Err(DriverError::Timeout));
            } else {
                kept.push_back(req);
            }
        }
        self.deferred = kept;

        if lifecycle_expired {
            tracing::warn!("handshake or schema fetch timed out");
            return self.on_disconnected(DriverError::Timeout);
        }
        Vec::new()
    }

    /// Earliest deadline the runtime should wake for.
    pub fn next_deadline(&self) -> Option<Instant> {
        let queue = self
            .queue
            .iter()
            .filter(|p| p.deadline_matters())
            .map(|p| p.deadline);
        let deferred = self.deferred.iter().map(|r| r.deadline);
        queue.chain(deferred).min()
    }
}

fn substitute_tx_id(args: &mut Vec<Arg>, tx_id: i32) {
    match args.first_mut() {
        Some(Arg::Int(slot)) => *slot = tx_id,
        _ => args.insert(0, Arg::Int(tx_id)),
    }
}

fn fault_to_error(fault: CallFault) -> DriverError {
    match fault {
        CallFault::Server(entries) => DriverError::ServerError(entries),
        CallFault::UnknownPropertyId(id) => DriverError::UnknownPropertyId(id),
        CallFault::Malformed(reason) => DriverError::MalformedResponse(reason),
    }
}

fn auth_error(entries: Vec<ErrorEntry>) -> DriverError {
    match entries.into_iter().next() {
        Some(entry) => DriverError::AuthFailed {
            class: entry.class,
            message: entry.message,
        },
        None => DriverError::AuthFailed {
            class: String::new(),
            message: "handshake rejected".to_string(),
        },
    }
}

#[cfg(test)]
mod tests;
