use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, unbounded};

use crate::config::{Config, DatabaseKind};
use crate::error::DriverError;
use crate::protocol::{Arg, Op, Reply, tx_commit_args};
use crate::record::{Document, Value, encode_record};
use crate::wire;

use super::{Action, Session, SessionPhase, UserRequest};

fn server_config() -> Config {
    let mut config = Config::server("127.0.0.1", 2424).with_credentials("root", "root");
    config.client_name = "x".to_string();
    config.driver_version = "0".to_string();
    config
}

fn db_config() -> Config {
    let mut config = server_config();
    config.connection = crate::config::Target::Database {
        name: "tickets".to_string(),
        kind: DatabaseKind::Document,
    };
    config
}

/// Plays the runtime's part: "writes" frames into `wire` and enqueues
/// pending slots, as if every write succeeded.
fn perform(session: &mut Session, actions: Vec<Action>, wire: &mut Vec<u8>) {
    for action in actions {
        match action {
            Action::Transmit(t) => {
                wire.extend_from_slice(&t.frame);
                if let Some(pending) = t.pending {
                    session.commit_pending(pending);
                }
                if let Some(ack) = t.ack {
                    ack.settle(Ok(()));
                }
            }
            Action::Close { .. } | Action::Exit => {}
        }
    }
}

fn feed(session: &mut Session, bytes: &[u8], wire: &mut Vec<u8>) {
    let actions = session.on_bytes(bytes, Instant::now());
    perform(session, actions, wire);
}

fn connect_reply(session_id: i32) -> Vec<u8> {
    let mut bytes = vec![0x00];
    wire::put_i32(&mut bytes, session_id);
    wire::put_bytes(&mut bytes, None); // token
    bytes
}

fn db_open_reply(session_id: i32) -> Vec<u8> {
    let mut bytes = connect_reply(session_id);
    wire::put_i16(&mut bytes, 0); // no clusters
    wire::put_bytes(&mut bytes, None); // cluster config
    wire::put_string(&mut bytes, Some("2.2.37"));
    bytes
}

fn schema_reply() -> Vec<u8> {
    let prop = Document::schemaless()
        .with_field("id", Value::Int(0))
        .with_field("name", Value::String("name".to_string()))
        .with_field("type", Value::String("STRING".to_string()));
    let schema_doc = Document::schemaless()
        .with_field("globalProperties", Value::List(vec![Value::Embedded(prop)]));
    record_load_reply(&schema_doc)
}

fn record_load_reply(doc: &Document) -> Vec<u8> {
    let mut bytes = vec![0x00];
    wire::put_i32(&mut bytes, 42); // session echo
    wire::put_u8(&mut bytes, 1);
    wire::put_u8(&mut bytes, b'd');
    wire::put_i32(&mut bytes, 1);
    wire::put_bytes(&mut bytes, Some(&encode_record(doc, None).unwrap()));
    wire::put_u8(&mut bytes, 0);
    bytes
}

fn long_reply(value: i64) -> Vec<u8> {
    let mut bytes = vec![0x00];
    wire::put_i32(&mut bytes, 42);
    wire::put_i64(&mut bytes, value);
    bytes
}

/// Drives a fresh session to Ready over a pretend socket.
fn ready_session(config: Config) -> (Session, Vec<u8>) {
    let is_db = config.is_database();
    let mut session = Session::new(config);
    let (ready_tx, ready_rx) = unbounded();
    session.set_ready_signal(ready_tx);
    session.on_connected();

    let mut wire_out = Vec::new();
    feed(&mut session, &[0x00, 0x1c], &mut wire_out); // protocol 28
    if is_db {
        feed(&mut session, &db_open_reply(42), &mut wire_out);
        feed(&mut session, &schema_reply(), &mut wire_out);
    } else {
        feed(&mut session, &connect_reply(42), &mut wire_out);
    }
    assert_eq!(ready_rx.recv().unwrap(), Ok(()));
    assert_eq!(session.phase(), SessionPhase::Ready);
    (session, wire_out)
}

fn request(
    op: Op,
    args: Vec<Arg>,
) -> (UserRequest, Receiver<Result<Reply, DriverError>>) {
    let (reply_tx, reply_rx) = unbounded();
    (
        UserRequest {
            op,
            args,
            deadline: Instant::now() + Duration::from_secs(5),
            reply: reply_tx,
        },
        reply_rx,
    )
}

fn send(session: &mut Session, req: UserRequest, wire: &mut Vec<u8>) {
    let actions = session.on_request(req, Instant::now());
    perform(session, actions, wire);
}

#[test]
fn server_handshake_stores_session_id() {
    let mut session = Session::new(server_config());
    let (ready_tx, ready_rx) = unbounded();
    session.set_ready_signal(ready_tx);
    session.on_connected();

    let mut wire_out = Vec::new();
    feed(&mut session, &[0x00, 0x1c], &mut wire_out);
    // The connect frame went out with session id -1.
    assert_eq!(wire_out[0], 0x02);
    assert_eq!(&wire_out[1..5], &[0xff, 0xff, 0xff, 0xff]);
    assert_eq!(session.phase(), SessionPhase::Handshaking);

    // 00 || 00 00 00 2A || FF FF FF FF
    feed(
        &mut session,
        &[0x00, 0x00, 0x00, 0x00, 0x2a, 0xff, 0xff, 0xff, 0xff],
        &mut wire_out,
    );
    assert_eq!(session.session_id(), 42);
    assert_eq!(session.phase(), SessionPhase::Ready);
    assert_eq!(ready_rx.recv().unwrap(), Ok(()));
}

#[test]
fn old_server_protocol_is_rejected() {
    let mut session = Session::new(server_config());
    let (ready_tx, ready_rx) = unbounded();
    session.set_ready_signal(ready_tx);
    session.on_connected();

    let actions = session.on_bytes(&[0x00, 0x14], Instant::now()); // protocol 20
    assert!(matches!(
        actions.as_slice(),
        [Action::Close { reconnect: false }, Action::Exit]
    ));
    assert_eq!(
        ready_rx.recv().unwrap(),
        Err(DriverError::UnsupportedProtocol {
            server: 20,
            minimum: 28,
        })
    );
    assert_eq!(session.phase(), SessionPhase::Disconnected);
}

#[test]
fn auth_rejection_is_fatal() {
    let mut session = Session::new(server_config());
    let (ready_tx, ready_rx) = unbounded();
    session.set_ready_signal(ready_tx);
    session.on_connected();

    let mut wire_out = Vec::new();
    feed(&mut session, &[0x00, 0x1c], &mut wire_out);

    let mut reply = vec![0x01];
    wire::put_i32(&mut reply, -1);
    wire::put_u8(&mut reply, 1);
    wire::put_string(&mut reply, Some("OSecurityAccessException"));
    wire::put_string(&mut reply, Some("bad credentials"));
    wire::put_u8(&mut reply, 0);
    wire::put_bytes(&mut reply, None);
    let actions = session.on_bytes(&reply, Instant::now());
    assert!(matches!(
        actions.as_slice(),
        [Action::Close { reconnect: false }, Action::Exit]
    ));
    assert_eq!(
        ready_rx.recv().unwrap(),
        Err(DriverError::AuthFailed {
            class: "OSecurityAccessException".to_string(),
            message: "bad credentials".to_string(),
        })
    );
}

#[test]
fn database_session_fetches_schema_before_ready() {
    let mut session = Session::new(db_config());
    let (ready_tx, ready_rx) = unbounded();
    session.set_ready_signal(ready_tx);
    session.on_connected();

    let mut wire_out = Vec::new();
    feed(&mut session, &[0x00, 0x1c], &mut wire_out);
    assert_eq!(wire_out[0], 0x03); // db_open

    wire_out.clear();
    feed(&mut session, &db_open_reply(42), &mut wire_out);
    // Still not ready: the schema load went out instead.
    assert!(ready_rx.try_recv().is_err());
    assert_eq!(session.phase(), SessionPhase::Authenticated);
    assert_eq!(wire_out[0], 30); // record_load
    assert_eq!(&wire_out[1..5], &42i32.to_be_bytes());
    assert_eq!(&wire_out[5..7], &[0x00, 0x00]); // cluster 0
    assert_eq!(&wire_out[7..15], &1i64.to_be_bytes()); // position 1

    feed(&mut session, &schema_reply(), &mut wire_out);
    assert_eq!(session.phase(), SessionPhase::Ready);
    assert_eq!(ready_rx.recv().unwrap(), Ok(()));
    assert_eq!(session.schema().unwrap().id_of("name"), Some(0));
}

#[test]
fn db_size_roundtrip() {
    let (mut session, mut wire_out) = ready_session(db_config());
    wire_out.clear();

    let (req, reply_rx) = request(Op::DbSize, vec![]);
    send(&mut session, req, &mut wire_out);
    assert_eq!(wire_out, [0x08, 0x00, 0x00, 0x00, 0x2a]);

    feed(&mut session, &long_reply(1_048_576), &mut wire_out);
    assert_eq!(reply_rx.recv().unwrap(), Ok(Reply::Long(1_048_576)));
}

#[test]
fn pipelined_replies_arrive_in_send_order() {
    let (mut session, mut wire_out) = ready_session(db_config());

    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (req, rx) = request(Op::DbCountRecords, vec![]);
        send(&mut session, req, &mut wire_out);
        receivers.push(rx);
    }
    assert_eq!(session.pending_len(), 3);

    // The server coalesces all three replies into one chunk.
    let mut chunk = Vec::new();
    for value in [10i64, 20, 30] {
        chunk.extend_from_slice(&long_reply(value));
    }
    feed(&mut session, &chunk, &mut wire_out);

    assert_eq!(receivers[0].recv().unwrap(), Ok(Reply::Long(10)));
    assert_eq!(receivers[1].recv().unwrap(), Ok(Reply::Long(20)));
    assert_eq!(receivers[2].recv().unwrap(), Ok(Reply::Long(30)));
    assert_eq!(session.pending_len(), 0);
}

#[test]
fn byte_at_a_time_decoding_matches_whole_chunk() {
    let (mut session, mut wire_out) = ready_session(db_config());

    let (req, reply_rx) = request(Op::DbSize, vec![]);
    send(&mut session, req, &mut wire_out);

    for byte in long_reply(7_777) {
        assert!(reply_rx.try_recv().is_err());
        feed(&mut session, &[byte], &mut wire_out);
    }
    assert_eq!(reply_rx.recv().unwrap(), Ok(Reply::Long(7_777)));
}

#[test]
fn abrupt_close_fails_every_queued_caller_once() {
    let (mut session, mut wire_out) = ready_session(db_config());

    let (req_a, rx_a) = request(Op::DbSize, vec![]);
    let (req_b, rx_b) = request(Op::DbCountRecords, vec![]);
    send(&mut session, req_a, &mut wire_out);
    send(&mut session, req_b, &mut wire_out);

    let actions = session.on_disconnected(DriverError::Transport("reset".to_string()));
    assert!(matches!(
        actions.as_slice(),
        [Action::Close { reconnect: false }]
    ));
    assert_eq!(rx_a.recv().unwrap(), Err(DriverError::Closed));
    assert_eq!(rx_b.recv().unwrap(), Err(DriverError::Closed));
    assert!(rx_a.try_recv().is_err(), "exactly one reply");
    assert_eq!(session.pending_len(), 0);
    assert_eq!(session.phase(), SessionPhase::Disconnected);

    // A later request fails immediately.
    let (req_c, rx_c) = request(Op::DbSize, vec![]);
    send(&mut session, req_c, &mut wire_out);
    assert_eq!(rx_c.recv().unwrap(), Err(DriverError::Closed));
}

#[test]
fn transaction_ids_are_monotonic_and_reset_on_reconnect() {
    let (mut session, mut wire_out) = ready_session(db_config());

    let tx_id_of = |wire_frame: &[u8]| i32::from_be_bytes(wire_frame[5..9].try_into().unwrap());

    for expected in 1..=3 {
        wire_out.clear();
        let (req, _rx) = request(Op::TxCommit, tx_commit_args(true, &[]));
        send(&mut session, req, &mut wire_out);
        assert_eq!(wire_out[0], 60);
        assert_eq!(tx_id_of(&wire_out), expected);
    }

    // Drop the link and reconnect the same session: the counter starts
    // over at 1 and a fresh session id is issued.
    session.on_disconnected(DriverError::Transport("reset".to_string()));
    assert_eq!(session.session_id(), -1);

    session.on_connected();
    wire_out.clear();
    feed(&mut session, &[0x00, 0x1c], &mut wire_out);
    feed(&mut session, &db_open_reply(77), &mut wire_out);
    feed(&mut session, &schema_reply(), &mut wire_out);
    assert_eq!(session.phase(), SessionPhase::Ready);
    assert_eq!(session.session_id(), 77);

    wire_out.clear();
    let (req, _rx) = request(Op::TxCommit, tx_commit_args(true, &[]));
    send(&mut session, req, &mut wire_out);
    assert_eq!(tx_id_of(&wire_out), 1);
}

#[test]
fn wrong_scope_is_rejected_without_touching_the_wire() {
    let (mut session, mut wire_out) = ready_session(db_config());
    wire_out.clear();

    let (req, reply_rx) = request(Op::DbCreate, vec![]);
    send(&mut session, req, &mut wire_out);
    assert!(wire_out.is_empty());
    assert_eq!(
        reply_rx.recv().unwrap(),
        Err(DriverError::WrongScope {
            op: "db_create",
            scope: "database",
        })
    );
    assert_eq!(session.pending_len(), 0);
}

#[test]
fn timed_out_slot_is_drained_without_a_caller() {
    let (mut session, mut wire_out) = ready_session(db_config());

    let (mut req, timed_rx) = request(Op::DbSize, vec![]);
    req.deadline = Instant::now() - Duration::from_millis(1);
    send(&mut session, req, &mut wire_out);
    let (req_b, live_rx) = request(Op::DbCountRecords, vec![]);
    send(&mut session, req_b, &mut wire_out);

    let actions = session.on_tick(Instant::now());
    assert!(actions.is_empty());
    assert_eq!(timed_rx.recv().unwrap(), Err(DriverError::Timeout));
    // The slot stays queued so ordering holds.
    assert_eq!(session.pending_len(), 2);

    // The late reply for the abandoned slot is discarded; the next one
    // reaches its caller.
    let mut chunk = long_reply(1);
    chunk.extend_from_slice(&long_reply(2));
    feed(&mut session, &chunk, &mut wire_out);
    assert_eq!(timed_rx.try_recv().ok(), None);
    assert_eq!(live_rx.recv().unwrap(), Ok(Reply::Long(2)));
    assert_eq!(session.pending_len(), 0);
}

#[test]
fn unknown_property_id_reaches_caller_and_session_survives() {
    let (mut session, mut wire_out) = ready_session(db_config());

    let (req, reply_rx) = request(Op::RecordLoad, vec![]);
    send(&mut session, req, &mut wire_out);

    // Record content referencing global id 7, which the schema lacks.
    let content = vec![0x00, 0x00, 0x0f, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00];
    let mut reply = vec![0x00];
    wire::put_i32(&mut reply, 42);
    wire::put_u8(&mut reply, 1);
    wire::put_u8(&mut reply, b'd');
    wire::put_i32(&mut reply, 1);
    wire::put_bytes(&mut reply, Some(&content));
    wire::put_u8(&mut reply, 0);
    feed(&mut session, &reply, &mut wire_out);

    assert_eq!(
        reply_rx.recv().unwrap(),
        Err(DriverError::UnknownPropertyId(7))
    );
    assert_eq!(session.phase(), SessionPhase::Ready);

    // The frame was consumed exactly; the session keeps serving.
    let (req, reply_rx) = request(Op::DbSize, vec![]);
    send(&mut session, req, &mut wire_out);
    feed(&mut session, &long_reply(5), &mut wire_out);
    assert_eq!(reply_rx.recv().unwrap(), Ok(Reply::Long(5)));
}

#[test]
fn explicit_schema_refetch_replaces_the_cache() {
    let (mut session, mut wire_out) = ready_session(db_config());
    wire_out.clear();

    let (ack_tx, ack_rx) = unbounded();
    let actions = session.on_fetch_schema(ack_tx, Instant::now());
    perform(&mut session, actions, &mut wire_out);
    assert_eq!(wire_out[0], 30);

    let prop = Document::schemaless()
        .with_field("id", Value::Int(7))
        .with_field("name", Value::String("title".to_string()))
        .with_field("type", Value::String("STRING".to_string()));
    let doc = Document::schemaless()
        .with_field("globalProperties", Value::List(vec![Value::Embedded(prop)]));
    feed(&mut session, &record_load_reply(&doc), &mut wire_out);

    assert_eq!(ack_rx.recv().unwrap(), Ok(()));
    assert_eq!(session.schema().unwrap().id_of("title"), Some(7));
}

#[test]
fn failed_internal_schema_fetch_disconnects() {
    let mut session = Session::new(db_config());
    let (ready_tx, ready_rx) = unbounded();
    session.set_ready_signal(ready_tx);
    session.on_connected();

    let mut wire_out = Vec::new();
    feed(&mut session, &[0x00, 0x1c], &mut wire_out);
    feed(&mut session, &db_open_reply(42), &mut wire_out);

    let mut reply = vec![0x01];
    wire::put_i32(&mut reply, 42);
    wire::put_u8(&mut reply, 1);
    wire::put_string(&mut reply, Some("ODatabaseException"));
    wire::put_string(&mut reply, Some("no schema"));
    wire::put_u8(&mut reply, 0);
    wire::put_bytes(&mut reply, None);
    feed(&mut session, &reply, &mut wire_out);

    assert_eq!(session.phase(), SessionPhase::Disconnected);
    assert!(matches!(
        ready_rx.recv().unwrap(),
        Err(DriverError::ServerError(_))
    ));
}

#[test]
fn fire_and_forget_ops_are_not_enqueued() {
    let (mut session, mut wire_out) = ready_session(db_config());
    wire_out.clear();

    let (ack_tx, ack_rx) = unbounded();
    let actions = session.on_no_response(Op::DbClose, vec![], ack_tx);
    perform(&mut session, actions, &mut wire_out);
    assert_eq!(wire_out[0], 0x05);
    assert_eq!(session.pending_len(), 0);
    assert_eq!(ack_rx.recv().unwrap(), Ok(()));
}

#[test]
fn stop_replies_closed_to_queued_callers() {
    let (mut session, mut wire_out) = ready_session(db_config());
    let (req, reply_rx) = request(Op::DbSize, vec![]);
    send(&mut session, req, &mut wire_out);

    let actions = session.on_stop();
    assert!(matches!(
        actions.as_slice(),
        [Action::Close { reconnect: false }, Action::Exit]
    ));
    assert_eq!(reply_rx.recv().unwrap(), Err(DriverError::Closed));
}

#[test]
fn corrupt_stream_fails_head_and_disconnects() {
    let (mut session, mut wire_out) = ready_session(db_config());
    let (req, reply_rx) = request(Op::DbSize, vec![]);
    send(&mut session, req, &mut wire_out);

    // 0x07 is not a valid status byte.
    feed(&mut session, &[0x07, 0, 0, 0, 0], &mut wire_out);
    assert!(matches!(
        reply_rx.recv().unwrap(),
        Err(DriverError::MalformedResponse(_))
    ));
    assert_eq!(session.phase(), SessionPhase::Disconnected);
}

#[test]
fn requests_during_reconnect_are_deferred_until_ready() {
    let mut config = db_config();
    config.reconnect = true;
    let mut session = Session::new(config);
    let (ready_tx, _ready_rx) = unbounded();
    session.set_ready_signal(ready_tx);
    session.on_connected();

    let mut wire_out = Vec::new();
    feed(&mut session, &[0x00, 0x1c], &mut wire_out);
    assert_eq!(session.phase(), SessionPhase::Handshaking);

    // Arrives mid-handshake: held, not written, not failed.
    wire_out.clear();
    let (req, reply_rx) = request(Op::DbSize, vec![]);
    send(&mut session, req, &mut wire_out);
    assert!(wire_out.is_empty());
    assert!(reply_rx.try_recv().is_err());

    feed(&mut session, &db_open_reply(42), &mut wire_out);
    feed(&mut session, &schema_reply(), &mut wire_out);
    assert_eq!(session.phase(), SessionPhase::Ready);
    // The deferred frame went out on Ready.
    assert_eq!(*wire_out.last_chunk::<5>().unwrap(), [
        0x08, 0x00, 0x00, 0x00, 0x2a
    ]);

    feed(&mut session, &long_reply(3), &mut wire_out);
    assert_eq!(reply_rx.recv().unwrap(), Ok(Reply::Long(3)));
}
