//! Streaming per-operation response decoders.
//!
//! Every decoder is restartable: fed a prefix of a response it reports
//! [`DecodeOutcome::Incomplete`] without consuming anything, and the
//! connection retries on the same bytes once more arrive. Faults that
//! occur inside a length-prefixed blob (a record payload that does not
//! parse, an unknown global property id) still consume the whole frame,
//! so the session stays aligned with the stream; faults in the outer
//! grammar leave no known frame boundary and are reported as `Corrupt`.

use crate::config::Limits;
use crate::error::ErrorEntry;
use crate::record::{Document, RecordError, Rid, Schema, decode_record};
use crate::wire::{Cursor, WireError};

use super::{
    ClusterInfo, CommandRecord, CommandResult, FetchedRecord, Op, Reply, TxCreated, TxOutcome,
    TxUpdated,
};

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;
pub const STATUS_PUSH: u8 = 3;

/// Result of running a response decoder over the unparsed tail.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeOutcome {
    /// More bytes are needed; nothing was consumed.
    Incomplete,
    /// One full response was parsed; `consumed` bytes belong to it.
    Done {
        result: Result<Reply, CallFault>,
        consumed: usize,
    },
    /// The stream no longer matches the grammar and cannot be re-aligned.
    Corrupt { reason: String },
}

/// A per-call failure that leaves the session intact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallFault {
    /// Server status-1 frame: `(class, message)` pairs.
    Server(Vec<ErrorEntry>),
    /// A record referenced a global property the cached schema lacks.
    UnknownPropertyId(u32),
    /// A length-prefixed payload did not parse.
    Malformed(String),
}

enum Fail {
    Incomplete,
    Fault(CallFault),
    Corrupt(String),
}

impl From<WireError> for Fail {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Incomplete => Fail::Incomplete,
            other => Fail::Corrupt(other.to_string()),
        }
    }
}

/// Decodes one response for `op` from the front of `buf`.
///
/// Push frames (status 3) carry no answer for the pending queue: they are
/// consumed and decoding continues with the next frame.
pub fn decode_response(
    op: Op,
    buf: &[u8],
    schema: Option<&Schema>,
    limits: &Limits,
) -> DecodeOutcome {
    let mut cur = Cursor::new(buf);
    loop {
        let status = match cur.u8() {
            Ok(status) => status,
            Err(_) => return DecodeOutcome::Incomplete,
        };
        // Handshake successes carry the freshly issued session id where
        // every other frame echoes the request's; only the latter is a
        // discardable header field.
        if !(status == STATUS_OK && matches!(op, Op::Connect | Op::DbOpen))
            && cur.i32().is_err()
        {
            return DecodeOutcome::Incomplete;
        }

        let result = match status {
            STATUS_OK => decode_success(op, &mut cur, schema, limits),
            STATUS_ERROR => match decode_error_frame(&mut cur, limits) {
                Ok(fault) => Err(Fail::Fault(fault)),
                Err(fail) => Err(fail),
            },
            STATUS_PUSH => match skip_push(&mut cur, limits) {
                Ok(()) => continue,
                Err(Fail::Incomplete) => return DecodeOutcome::Incomplete,
                Err(Fail::Corrupt(reason)) | Err(Fail::Fault(CallFault::Malformed(reason))) => {
                    return DecodeOutcome::Corrupt { reason };
                }
                Err(Fail::Fault(_)) => {
                    return DecodeOutcome::Corrupt {
                        reason: "unparsable push frame".to_string(),
                    };
                }
            },
            other => {
                return DecodeOutcome::Corrupt {
                    reason: format!("unknown response status byte {other:#04x}"),
                };
            }
        };

        return match result {
            Ok(reply) => DecodeOutcome::Done {
                result: Ok(reply),
                consumed: cur.consumed(),
            },
            Err(Fail::Incomplete) => DecodeOutcome::Incomplete,
            Err(Fail::Fault(fault)) => DecodeOutcome::Done {
                result: Err(fault),
                consumed: cur.consumed(),
            },
            Err(Fail::Corrupt(reason)) => DecodeOutcome::Corrupt { reason },
        };
    }
}

fn decode_success(
    op: Op,
    cur: &mut Cursor<'_>,
    schema: Option<&Schema>,
    limits: &Limits,
) -> Result<Reply, Fail> {
    match op {
        Op::Connect => {
            let session_id = cur.i32()?;
            let token = cur.bytes(limits.max_payload_bytes)?.map(<[u8]>::to_vec);
            Ok(Reply::Session {
                session_id,
                token,
                clusters: Vec::new(),
            })
        }
        Op::DbOpen => {
            let session_id = cur.i32()?;
            let token = cur.bytes(limits.max_payload_bytes)?.map(<[u8]>::to_vec);
            let clusters = read_clusters(cur, limits)?;
            let _cluster_config = cur.bytes(limits.max_payload_bytes)?;
            let _release = read_string(cur, limits)?;
            Ok(Reply::Session {
                session_id,
                token,
                clusters,
            })
        }
        Op::DbCreate | Op::DbDrop => Ok(Reply::Unit),
        Op::DbExist | Op::RecordDelete => Ok(Reply::Bool(cur.bool()?)),
        Op::DbSize | Op::DbCountRecords => Ok(Reply::Long(cur.i64()?)),
        Op::DbReload => Ok(Reply::Clusters(read_clusters(cur, limits)?)),
        Op::DbList => {
            let blob = read_blob(cur, limits)?;
            match decode_content(blob, None) {
                Ok(document) => Ok(Reply::Document(document)),
                Err(fault) => Err(Fail::Fault(fault)),
            }
        }
        Op::RecordLoad | Op::RecordLoadIfVersionNotLatest => decode_record_load(cur, schema, limits),
        Op::RecordCreate => {
            let rid = read_rid(cur)?;
            let version = cur.i32()?;
            skip_collection_changes(cur)?;
            Ok(Reply::Created { rid, version })
        }
        Op::RecordUpdate => {
            let version = cur.i32()?;
            skip_collection_changes(cur)?;
            Ok(Reply::Updated { version })
        }
        Op::Command => decode_command(cur, schema, limits),
        Op::TxCommit => decode_tx_commit(cur),
        Op::Shutdown | Op::DbClose => Err(Fail::Corrupt(format!(
            "{} has no response grammar",
            op.name()
        ))),
    }
}

fn decode_record_load(
    cur: &mut Cursor<'_>,
    schema: Option<&Schema>,
    limits: &Limits,
) -> Result<Reply, Fail> {
    let mut first: Option<Result<FetchedRecord, CallFault>> = None;
    loop {
        match cur.u8()? {
            0 => break,
            1 => {
                let kind = cur.u8()?;
                let version = cur.i32()?;
                let blob = read_blob(cur, limits)?;
                let decoded = decode_content(blob, schema).map(|document| FetchedRecord {
                    kind,
                    version,
                    document,
                });
                // Later iterations are fetch-plan prefetches: structurally
                // consumed, never surfaced.
                if first.is_none() {
                    first = Some(decoded);
                }
            }
            other => {
                return Err(Fail::Corrupt(format!(
                    "unknown record-load payload status {other:#04x}"
                )));
            }
        }
    }
    match first {
        None => Ok(Reply::Record(None)),
        Some(Ok(record)) => Ok(Reply::Record(Some(record))),
        Some(Err(fault)) => Err(Fail::Fault(fault)),
    }
}

fn decode_command(
    cur: &mut Cursor<'_>,
    schema: Option<&Schema>,
    limits: &Limits,
) -> Result<Reply, Fail> {
    let mut fault: Option<CallFault> = None;
    let kind = cur.u8()?;
    let result = match kind {
        b'n' => CommandResult::Null,
        b'r' => CommandResult::Record(read_command_record(cur, schema, limits, &mut fault)?),
        b'l' | b's' => {
            let count = cur.i32()?;
            let count = usize::try_from(count)
                .map_err(|_| Fail::Corrupt(format!("negative result count {count}")))?;
            let mut records = Vec::new();
            for _ in 0..count {
                records.push(read_command_record(cur, schema, limits, &mut fault)?);
            }
            CommandResult::Collection(records)
        }
        b'a' => CommandResult::Scalar(read_string(cur, limits)?),
        other => {
            return Err(Fail::Corrupt(format!(
                "unknown command result kind {other:#04x}"
            )));
        }
    };

    // Fetch-plan prefetches trail the result, zero-byte terminated.
    loop {
        match cur.u8()? {
            0 => break,
            2 => {
                let mut discarded = None;
                read_command_record(cur, schema, limits, &mut discarded)?;
            }
            other => {
                return Err(Fail::Corrupt(format!(
                    "unknown command prefetch status {other:#04x}"
                )));
            }
        }
    }

    match fault {
        Some(fault) => Err(Fail::Fault(fault)),
        None => Ok(Reply::Command(result)),
    }
}

fn read_command_record(
    cur: &mut Cursor<'_>,
    schema: Option<&Schema>,
    limits: &Limits,
    fault: &mut Option<CallFault>,
) -> Result<CommandRecord, Fail> {
    let marker = cur.i16()?;
    match marker {
        -2 => Ok(CommandRecord::Null),
        -3 => Ok(CommandRecord::Reference(read_rid(cur)?)),
        0 => {
            let kind = cur.u8()?;
            let rid = read_rid(cur)?;
            let version = cur.i32()?;
            let blob = read_blob(cur, limits)?;
            match decode_content(blob, schema) {
                Ok(document) => Ok(CommandRecord::Full {
                    rid,
                    record: FetchedRecord {
                        kind,
                        version,
                        document,
                    },
                }),
                Err(record_fault) => {
                    if fault.is_none() {
                        *fault = Some(record_fault);
                    }
                    Ok(CommandRecord::Null)
                }
            }
        }
        other => Err(Fail::Corrupt(format!("unknown record marker {other}"))),
    }
}

fn decode_tx_commit(cur: &mut Cursor<'_>) -> Result<Reply, Fail> {
    let created_count = read_count_i32(cur)?;
    let mut created = Vec::new();
    for _ in 0..created_count {
        let temp = read_rid(cur)?;
        let actual = read_rid(cur)?;
        created.push(TxCreated { temp, actual });
    }
    let updated_count = read_count_i32(cur)?;
    let mut updated = Vec::new();
    for _ in 0..updated_count {
        let rid = read_rid(cur)?;
        let version = cur.i32()?;
        updated.push(TxUpdated { rid, version });
    }
    skip_collection_changes(cur)?;
    Ok(Reply::Tx(TxOutcome { created, updated }))
}

fn decode_error_frame(cur: &mut Cursor<'_>, limits: &Limits) -> Result<CallFault, Fail> {
    let mut entries = Vec::new();
    loop {
        match cur.u8()? {
            0 => break,
            1 => {
                let class = read_string(cur, limits)?;
                let message = read_string(cur, limits)?;
                entries.push(ErrorEntry { class, message });
            }
            other => {
                return Err(Fail::Corrupt(format!(
                    "unknown error continuation byte {other:#04x}"
                )));
            }
        }
    }
    let _exception_blob = cur.bytes(limits.max_payload_bytes).map_err(Fail::from)?;
    Ok(CallFault::Server(entries))
}

fn skip_push(cur: &mut Cursor<'_>, limits: &Limits) -> Result<(), Fail> {
    let _command = cur.u8()?;
    let _payload = cur.bytes(limits.max_payload_bytes)?;
    Ok(())
}

fn read_clusters(cur: &mut Cursor<'_>, limits: &Limits) -> Result<Vec<ClusterInfo>, Fail> {
    let count = cur.i16()?;
    let count = usize::try_from(count)
        .map_err(|_| Fail::Corrupt(format!("negative cluster count {count}")))?;
    let mut clusters = Vec::new();
    for _ in 0..count {
        let name = read_string(cur, limits)?;
        let id = cur.i16()?;
        clusters.push(ClusterInfo { name, id });
    }
    Ok(clusters)
}

fn skip_collection_changes(cur: &mut Cursor<'_>) -> Result<(), Fail> {
    let count = read_count_i32(cur)?;
    for _ in 0..count {
        let _uuid_most = cur.i64()?;
        let _uuid_least = cur.i64()?;
        let _page_index = cur.i64()?;
        let _page_offset = cur.i32()?;
    }
    Ok(())
}

fn read_rid(cur: &mut Cursor<'_>) -> Result<Rid, Fail> {
    let cluster = cur.i16()?;
    let position = cur.i64()?;
    Ok(Rid { cluster, position })
}

fn read_count_i32(cur: &mut Cursor<'_>) -> Result<usize, Fail> {
    let count = cur.i32()?;
    usize::try_from(count).map_err(|_| Fail::Corrupt(format!("negative count {count}")))
}

/// Nullable response string; absent decodes as empty.
fn read_string(cur: &mut Cursor<'_>, limits: &Limits) -> Result<String, Fail> {
    Ok(cur
        .string(limits.max_payload_bytes)?
        .unwrap_or_default())
}

fn read_blob<'a>(cur: &mut Cursor<'a>, limits: &Limits) -> Result<&'a [u8], Fail> {
    match cur.bytes(limits.max_payload_bytes)? {
        Some(blob) => Ok(blob),
        None => Err(Fail::Fault(CallFault::Malformed(
            "null record content".to_string(),
        ))),
    }
}

fn decode_content(blob: &[u8], schema: Option<&Schema>) -> Result<Document, CallFault> {
    decode_record(blob, schema).map_err(|err| match err {
        RecordError::UnknownPropertyId(id) => CallFault::UnknownPropertyId(id),
        other => CallFault::Malformed(other.to_string()),
    })
}
