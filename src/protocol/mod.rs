//! Protocol operations: request framing and typed argument encoding.
//!
//! Every request is `op_code (u8) || session_id (i32) || arguments`. Each
//! operation is a named schema: an ordered argument list on the way out
//! and a response grammar keyed on a status byte on the way back (see
//! [`response`]).

pub mod response;

pub use response::{CallFault, DecodeOutcome};

use crate::config::Config;
use crate::record::{Document, Rid};
use crate::wire;

/// Serializer negotiated during the handshake.
pub const SERIALIZER_NAME: &str = "ORecordSerializerBinary";

/// Protocol version this driver speaks (sent in the handshake).
pub const SUPPORTED_PROTOCOL: i16 = 28;

/// Session id sent before the server has issued one.
pub const NO_SESSION: i32 = -1;

/// Record kind byte for documents.
pub const RECORD_KIND_DOCUMENT: u8 = b'd';

/// Synchronous command execution mode.
pub const COMMAND_MODE_SYNC: u8 = b's';

/// Which session target an operation is valid on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Server,
    Database,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Server => "server",
            Scope::Database => "database",
        }
    }
}

/// The operation catalogue. Codes are stable with the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Shutdown,
    Connect,
    DbOpen,
    DbCreate,
    DbClose,
    DbExist,
    DbDrop,
    DbSize,
    DbCountRecords,
    RecordLoad,
    RecordCreate,
    RecordUpdate,
    RecordDelete,
    Command,
    RecordLoadIfVersionNotLatest,
    TxCommit,
    DbReload,
    DbList,
}

impl Op {
    pub fn code(self) -> u8 {
        match self {
            Op::Shutdown => 1,
            Op::Connect => 2,
            Op::DbOpen => 3,
            Op::DbCreate => 4,
            Op::DbClose => 5,
            Op::DbExist => 6,
            Op::DbDrop => 7,
            Op::DbSize => 8,
            Op::DbCountRecords => 9,
            Op::RecordLoad => 30,
            Op::RecordCreate => 31,
            Op::RecordUpdate => 32,
            Op::RecordDelete => 33,
            Op::Command => 41,
            Op::RecordLoadIfVersionNotLatest => 44,
            Op::TxCommit => 60,
            Op::DbReload => 73,
            Op::DbList => 74,
        }
    }

    pub fn scope(self) -> Scope {
        match self {
            Op::Shutdown | Op::Connect | Op::DbCreate | Op::DbExist | Op::DbDrop | Op::DbList => {
                Scope::Server
            }
            Op::DbOpen
            | Op::DbClose
            | Op::DbSize
            | Op::DbCountRecords
            | Op::RecordLoad
            | Op::RecordCreate
            | Op::RecordUpdate
            | Op::RecordDelete
            | Op::Command
            | Op::RecordLoadIfVersionNotLatest
            | Op::TxCommit
            | Op::DbReload => Scope::Database,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Shutdown => "shutdown",
            Op::Connect => "connect",
            Op::DbOpen => "db_open",
            Op::DbCreate => "db_create",
            Op::DbClose => "db_close",
            Op::DbExist => "db_exist",
            Op::DbDrop => "db_drop",
            Op::DbSize => "db_size",
            Op::DbCountRecords => "db_countrecords",
            Op::RecordLoad => "record_load",
            Op::RecordCreate => "record_create",
            Op::RecordUpdate => "record_update",
            Op::RecordDelete => "record_delete",
            Op::Command => "command",
            Op::RecordLoadIfVersionNotLatest => "record_load_if_version_not_latest",
            Op::TxCommit => "tx_commit",
            Op::DbReload => "db_reload",
            Op::DbList => "db_list",
        }
    }

    /// Ops the server never answers; the frame is written and nothing is
    /// enqueued for a reply.
    pub fn fire_and_forget(self) -> bool {
        matches!(self, Op::Shutdown | Op::DbClose)
    }
}

/// One element of a request argument stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// Pre-encoded bytes, spliced verbatim.
    Raw(Vec<u8>),
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bool(bool),
    String(String),
    /// Length-prefixed blob; `None` encodes as length `-1`.
    Bytes(Option<Vec<u8>>),
    Rid(Rid),
    /// Serialized record content, length-prefixed like `Bytes`.
    Record(Vec<u8>),
}

/// Encodes one request frame.
pub fn encode_request(op: Op, session_id: i32, args: &[Arg]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    wire::put_u8(&mut out, op.code());
    wire::put_i32(&mut out, session_id);
    for arg in args {
        encode_arg(&mut out, arg);
    }
    out
}

fn encode_arg(out: &mut Vec<u8>, arg: &Arg) {
    match arg {
        Arg::Raw(bytes) => out.extend_from_slice(bytes),
        Arg::Byte(v) => wire::put_u8(out, *v),
        Arg::Short(v) => wire::put_i16(out, *v),
        Arg::Int(v) => wire::put_i32(out, *v),
        Arg::Long(v) => wire::put_i64(out, *v),
        Arg::Bool(v) => wire::put_bool(out, *v),
        Arg::String(v) => wire::put_string(out, Some(v)),
        Arg::Bytes(v) => wire::put_bytes(out, v.as_deref()),
        Arg::Rid(rid) => {
            wire::put_i16(out, rid.cluster);
            wire::put_i64(out, rid.position);
        }
        Arg::Record(content) => wire::put_bytes(out, Some(content)),
    }
}

/// Handshake arguments shared by `connect` and `db_open`.
fn handshake_preamble(config: &Config) -> Vec<Arg> {
    vec![
        Arg::String(config.client_name.clone()),
        Arg::String(config.driver_version.clone()),
        Arg::Short(SUPPORTED_PROTOCOL),
        Arg::String(String::new()), // client id
        Arg::String(SERIALIZER_NAME.to_string()),
        Arg::Bool(false), // token-based auth
    ]
}

/// `connect` request frame (server scope, session id -1).
pub fn connect_request(config: &Config) -> Vec<u8> {
    let mut args = handshake_preamble(config);
    args.push(Arg::String(config.user.clone()));
    args.push(Arg::String(config.password.clone()));
    encode_request(Op::Connect, NO_SESSION, &args)
}

/// `db_open` request frame (database scope, session id -1).
pub fn db_open_request(config: &Config, name: &str, kind: &str) -> Vec<u8> {
    let mut args = handshake_preamble(config);
    args.push(Arg::String(name.to_string()));
    args.push(Arg::String(kind.to_string()));
    args.push(Arg::String(config.user.clone()));
    args.push(Arg::String(config.password.clone()));
    encode_request(Op::DbOpen, NO_SESSION, &args)
}

/// The internal schema fetch: `record_load` of `#0:1` with the `"*:-1"`
/// fetch plan, ignoring the cache, skipping tombstones.
pub fn schema_load_args() -> Vec<Arg> {
    vec![
        Arg::Rid(Rid::new(0, 1)),
        Arg::String("*:-1".to_string()),
        Arg::Bool(true),
        Arg::Bool(false),
    ]
}

/// Builds the length-prefixed `command` payload for a sync SQL command.
pub fn encode_command_payload(
    class_name: &str,
    text: &str,
    non_text_limit: i32,
    fetch_plan: &str,
    params: Option<&[u8]>,
) -> Vec<u8> {
    let mut payload = Vec::new();
    wire::put_string(&mut payload, Some(class_name));
    wire::put_string(&mut payload, Some(text));
    wire::put_i32(&mut payload, non_text_limit);
    wire::put_string(&mut payload, Some(fetch_plan));
    wire::put_bytes(&mut payload, params);
    payload
}

/// One record-level operation inside a transaction commit.
#[derive(Clone, Debug, PartialEq)]
pub enum TxOperation {
    Create {
        /// Client-assigned temporary id (negative position).
        temp: Rid,
        content: Vec<u8>,
    },
    Update {
        rid: Rid,
        version: i32,
        content: Vec<u8>,
        update_content: bool,
    },
    Delete {
        rid: Rid,
        version: i32,
    },
}

impl TxOperation {
    fn kind(&self) -> u8 {
        match self {
            TxOperation::Update { .. } => 1,
            TxOperation::Delete { .. } => 2,
            TxOperation::Create { .. } => 3,
        }
    }

    fn rid(&self) -> Rid {
        match self {
            TxOperation::Create { temp, .. } => *temp,
            TxOperation::Update { rid, .. } | TxOperation::Delete { rid, .. } => *rid,
        }
    }
}

/// Builds the `tx_commit` argument list. The leading `Int` is the
/// transaction id placeholder; the connection substitutes a fresh id
/// from its monotonic counter before encoding.
pub fn tx_commit_args(use_log: bool, operations: &[TxOperation]) -> Vec<Arg> {
    let mut entries = Vec::new();
    for op in operations {
        wire::put_u8(&mut entries, 1);
        wire::put_u8(&mut entries, op.kind());
        let rid = op.rid();
        wire::put_i16(&mut entries, rid.cluster);
        wire::put_i64(&mut entries, rid.position);
        wire::put_u8(&mut entries, RECORD_KIND_DOCUMENT);
        match op {
            TxOperation::Create { content, .. } => {
                wire::put_bytes(&mut entries, Some(content));
            }
            TxOperation::Update {
                version,
                content,
                update_content,
                ..
            } => {
                wire::put_i32(&mut entries, *version);
                wire::put_bytes(&mut entries, Some(content));
                wire::put_bool(&mut entries, *update_content);
            }
            TxOperation::Delete { version, .. } => {
                wire::put_i32(&mut entries, *version);
            }
        }
    }
    wire::put_u8(&mut entries, 0); // entry list terminator
    wire::put_i32(&mut entries, 0); // empty index-changes blob

    vec![Arg::Int(0), Arg::Bool(use_log), Arg::Raw(entries)]
}

/// Cluster metadata returned by `db_open` and `db_reload`; parsed and
/// handed to the caller, not consumed by the state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub id: i16,
}

/// A record returned by `record_load` or inside a command result.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedRecord {
    pub kind: u8,
    pub version: i32,
    pub document: Document,
}

/// Result of a synchronous `command`.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandResult {
    Null,
    Record(CommandRecord),
    Collection(Vec<CommandRecord>),
    /// Serialized scalar payload, returned verbatim.
    Scalar(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandRecord {
    Null,
    Reference(Rid),
    Full { rid: Rid, record: FetchedRecord },
}

/// Rid remapping for one record created inside a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxCreated {
    pub temp: Rid,
    pub actual: Rid,
}

/// New version for one record updated inside a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxUpdated {
    pub rid: Rid,
    pub version: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxOutcome {
    pub created: Vec<TxCreated>,
    pub updated: Vec<TxUpdated>,
}

/// Decoded success payload, one variant per response grammar.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Unit,
    Bool(bool),
    Long(i64),
    Session {
        session_id: i32,
        token: Option<Vec<u8>>,
        clusters: Vec<ClusterInfo>,
    },
    Clusters(Vec<ClusterInfo>),
    Document(Document),
    Record(Option<FetchedRecord>),
    Created { rid: Rid, version: i32 },
    Updated { version: i32 },
    Command(CommandResult),
    Tx(TxOutcome),
}
