//! Binary document serializer (`ORecordSerializerBinary`, version 0).
//!
//! Layout: `version (u8) || class name (varint-prefixed) || field table ||
//! data area`. Field-table entries carry an absolute data offset that is
//! written as a placeholder and patched once the data area is laid out; a
//! zero offset marks a present-but-null field. Embedded documents are
//! self-contained blobs whose internal offsets are relative to their own
//! start, so nesting decodes from a sub-slice.

use crate::wire::{self, Cursor, WireError};

use super::{Decimal, Document, RecordError, Rid, Schema, TypeTag, Value};

pub const SERIALIZER_VERSION: u8 = 0;

/// Serializes a top-level record payload.
pub fn encode_record(doc: &Document, schema: Option<&Schema>) -> Result<Vec<u8>, RecordError> {
    let mut out = vec![SERIALIZER_VERSION];
    encode_document_body(&mut out, doc, schema)?;
    Ok(out)
}

/// Deserializes a top-level record payload.
///
/// The schema is consulted only for global-property table entries;
/// name-tagged entries never touch it, which is what lets the schema
/// record itself (stored schemaless on cluster 0) bootstrap.
pub fn decode_record(buf: &[u8], schema: Option<&Schema>) -> Result<Document, RecordError> {
    let mut cur = Cursor::new(buf);
    let version = cur.u8().map_err(wire_fault)?;
    if version != SERIALIZER_VERSION {
        return Err(RecordError::UnsupportedVersion(version));
    }
    let (doc, _) = decode_document_body(buf, 1, schema)?;
    Ok(doc)
}

fn encode_embedded(doc: &Document, schema: Option<&Schema>) -> Result<Vec<u8>, RecordError> {
    let mut out = Vec::new();
    encode_document_body(&mut out, doc, schema)?;
    Ok(out)
}

fn encode_document_body(
    out: &mut Vec<u8>,
    doc: &Document,
    schema: Option<&Schema>,
) -> Result<(), RecordError> {
    wire::put_varint_i64(out, doc.class().len() as i64);
    out.extend_from_slice(doc.class().as_bytes());

    // Field table with placeholder offsets, patched below.
    let mut slots: Vec<(usize, &Value)> = Vec::with_capacity(doc.len());
    for (name, value) in doc.fields() {
        match schema.and_then(|s| s.id_of(name)) {
            Some(id) => wire::put_varint_i64(out, -i64::from(id) - 1),
            None => {
                wire::put_varint_i64(out, name.len() as i64);
                out.extend_from_slice(name.as_bytes());
            }
        }
        let patch_at = out.len();
        wire::put_i32(out, 0);
        wire::put_u8(out, TypeTag::for_value(value).as_u8());
        slots.push((patch_at, value));
    }
    wire::put_varint_i64(out, 0);

    for (patch_at, value) in slots {
        if value.is_null() {
            continue;
        }
        let offset = i32::try_from(out.len())
            .map_err(|_| RecordError::Malformed("document exceeds i32 offsets".to_string()))?;
        out[patch_at..patch_at + 4].copy_from_slice(&offset.to_be_bytes());
        encode_value(out, value, schema)?;
    }
    Ok(())
}

fn encode_value(out: &mut Vec<u8>, value: &Value, schema: Option<&Schema>) -> Result<(), RecordError> {
    match value {
        Value::Null => {}
        Value::Bool(v) => wire::put_bool(out, *v),
        Value::Byte(v) => wire::put_i8(out, *v),
        Value::Short(v) => wire::put_varint_i64(out, i64::from(*v)),
        Value::Int(v) => wire::put_varint_i64(out, i64::from(*v)),
        Value::Long(v) => wire::put_varint_i64(out, *v),
        Value::Float(v) => wire::put_f32(out, *v),
        Value::Double(v) => wire::put_f64(out, *v),
        Value::DateTime(ms) => wire::put_varint_i64(out, *ms),
        Value::Date(days) => wire::put_varint_i64(out, *days),
        Value::String(s) => {
            wire::put_varint_i64(out, s.len() as i64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            wire::put_varint_i64(out, b.len() as i64);
            out.extend_from_slice(b);
        }
        Value::Decimal(Decimal { scale, magnitude }) => {
            wire::put_i32(out, *scale);
            wire::put_i32(out, magnitude.len() as i32);
            out.extend_from_slice(magnitude);
        }
        Value::Embedded(doc) => {
            let blob = encode_embedded(doc, schema)?;
            out.extend_from_slice(&blob);
        }
        Value::List(items) | Value::Set(items) => {
            wire::put_varint_i64(out, items.len() as i64);
            for item in items {
                wire::put_u8(out, TypeTag::for_value(item).as_u8());
                encode_value(out, item, schema)?;
            }
        }
        Value::Map(entries) => {
            wire::put_varint_i64(out, entries.len() as i64);
            for (key, item) in entries {
                wire::put_varint_i64(out, key.len() as i64);
                out.extend_from_slice(key.as_bytes());
                wire::put_u8(out, TypeTag::for_value(item).as_u8());
                encode_value(out, item, schema)?;
            }
        }
        Value::Link(rid) => encode_link(out, *rid),
        Value::LinkList(rids) | Value::LinkSet(rids) => {
            wire::put_varint_i64(out, rids.len() as i64);
            for rid in rids {
                encode_link(out, *rid);
            }
        }
        Value::LinkMap(entries) => {
            wire::put_varint_i64(out, entries.len() as i64);
            for (key, rid) in entries {
                wire::put_varint_i64(out, key.len() as i64);
                out.extend_from_slice(key.as_bytes());
                encode_link(out, *rid);
            }
        }
    }
    Ok(())
}

fn encode_link(out: &mut Vec<u8>, rid: Rid) {
    wire::put_varint_i64(out, i64::from(rid.cluster));
    wire::put_varint_i64(out, rid.position);
}

struct TableEntry {
    name: String,
    offset: i32,
    tag: TypeTag,
}

/// Decodes a document whose header starts at `header_start` and whose
/// data offsets index `buf` from zero. Returns the document and its
/// consumed extent within `buf`.
fn decode_document_body(
    buf: &[u8],
    header_start: usize,
    schema: Option<&Schema>,
) -> Result<(Document, usize), RecordError> {
    let mut cur = Cursor::new(buf);
    cur.take(header_start).map_err(wire_fault)?;

    let class = read_short_string(&mut cur)?;
    let mut entries = Vec::new();
    loop {
        let key = cur.varint_i64().map_err(wire_fault)?;
        if key == 0 {
            break;
        }
        let name = if key > 0 {
            let raw = cur.take(key as usize).map_err(wire_fault)?;
            std::str::from_utf8(raw)
                .map_err(|_| RecordError::Malformed("field name is not utf-8".to_string()))?
                .to_string()
        } else {
            let id = key
                .checked_neg()
                .and_then(|n| n.checked_sub(1))
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    RecordError::Malformed(format!("property key {key} out of range"))
                })?;
            match schema.and_then(|s| s.property(id)) {
                Some(prop) => prop.name.clone(),
                None => return Err(RecordError::UnknownPropertyId(id)),
            }
        };
        let offset = cur.i32().map_err(wire_fault)?;
        let tag = TypeTag::from_u8(cur.u8().map_err(wire_fault)?)?;
        if offset < 0 {
            return Err(RecordError::Malformed(format!(
                "negative data offset {offset} for field {name:?}"
            )));
        }
        entries.push(TableEntry { name, offset, tag });
    }

    let mut doc = Document::new(class);
    let mut end = cur.consumed();
    for entry in entries {
        if entry.offset == 0 {
            doc.set(entry.name, Value::Null);
            continue;
        }
        let (value, value_end) = decode_value(buf, entry.offset as usize, entry.tag, schema)?;
        end = end.max(value_end);
        doc.set(entry.name, value);
    }
    Ok((doc, end))
}

/// Decodes one value at an absolute position in `buf`, returning the
/// value and the position one past its last byte (collections use this
/// to walk inline elements).
fn decode_value(
    buf: &[u8],
    pos: usize,
    tag: TypeTag,
    schema: Option<&Schema>,
) -> Result<(Value, usize), RecordError> {
    if pos > buf.len() {
        return Err(RecordError::Truncated);
    }
    let slice = &buf[pos..];
    let mut cur = Cursor::new(slice);

    let value = match tag {
        TypeTag::Any => Value::Null,
        TypeTag::Boolean => Value::Bool(cur.bool().map_err(wire_fault)?),
        TypeTag::Byte => Value::Byte(cur.i8().map_err(wire_fault)?),
        TypeTag::Short => {
            let v = cur.varint_i64().map_err(wire_fault)?;
            Value::Short(i16::try_from(v).map_err(|_| range_fault("short", v))?)
        }
        TypeTag::Integer => {
            let v = cur.varint_i64().map_err(wire_fault)?;
            Value::Int(i32::try_from(v).map_err(|_| range_fault("integer", v))?)
        }
        TypeTag::Long => Value::Long(cur.varint_i64().map_err(wire_fault)?),
        TypeTag::Float => Value::Float(cur.f32().map_err(wire_fault)?),
        TypeTag::Double => Value::Double(cur.f64().map_err(wire_fault)?),
        TypeTag::DateTime => Value::DateTime(cur.varint_i64().map_err(wire_fault)?),
        TypeTag::Date => Value::Date(cur.varint_i64().map_err(wire_fault)?),
        TypeTag::String => {
            let raw = read_varint_blob(&mut cur)?;
            let text = std::str::from_utf8(raw)
                .map_err(|_| RecordError::Malformed("string value is not utf-8".to_string()))?;
            Value::String(text.to_string())
        }
        TypeTag::Binary => Value::Bytes(read_varint_blob(&mut cur)?.to_vec()),
        TypeTag::Decimal => {
            let scale = cur.i32().map_err(wire_fault)?;
            let len = cur.i32().map_err(wire_fault)?;
            if len < 0 {
                return Err(RecordError::Malformed(format!(
                    "negative decimal length {len}"
                )));
            }
            let magnitude = cur.take(len as usize).map_err(wire_fault)?.to_vec();
            Value::Decimal(Decimal { scale, magnitude })
        }
        TypeTag::Embedded => {
            let (doc, rel_end) = decode_document_body(slice, 0, schema)?;
            return Ok((Value::Embedded(doc), pos + rel_end));
        }
        TypeTag::EmbeddedList | TypeTag::EmbeddedSet => {
            let count = read_count(&mut cur)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let element_tag = TypeTag::from_u8(cur.u8().map_err(wire_fault)?)?;
                if element_tag == TypeTag::Any {
                    items.push(Value::Null);
                    continue;
                }
                let at = pos + cur.consumed();
                let (item, item_end) = decode_value(buf, at, element_tag, schema)?;
                cur.take(item_end - at).map_err(wire_fault)?;
                items.push(item);
            }
            if tag == TypeTag::EmbeddedList {
                Value::List(items)
            } else {
                Value::Set(items)
            }
        }
        TypeTag::EmbeddedMap => {
            let count = read_count(&mut cur)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = read_short_string(&mut cur)?;
                let element_tag = TypeTag::from_u8(cur.u8().map_err(wire_fault)?)?;
                if element_tag == TypeTag::Any {
                    entries.push((key, Value::Null));
                    continue;
                }
                let at = pos + cur.consumed();
                let (item, item_end) = decode_value(buf, at, element_tag, schema)?;
                cur.take(item_end - at).map_err(wire_fault)?;
                entries.push((key, item));
            }
            Value::Map(entries)
        }
        TypeTag::Link => Value::Link(decode_link(&mut cur)?),
        TypeTag::LinkList | TypeTag::LinkSet => {
            let count = read_count(&mut cur)?;
            let mut rids = Vec::with_capacity(count);
            for _ in 0..count {
                rids.push(decode_link(&mut cur)?);
            }
            if tag == TypeTag::LinkList {
                Value::LinkList(rids)
            } else {
                Value::LinkSet(rids)
            }
        }
        TypeTag::LinkMap => {
            let count = read_count(&mut cur)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = read_short_string(&mut cur)?;
                entries.push((key, decode_link(&mut cur)?));
            }
            Value::LinkMap(entries)
        }
    };

    Ok((value, pos + cur.consumed()))
}

fn decode_link(cur: &mut Cursor<'_>) -> Result<Rid, RecordError> {
    let cluster = cur.varint_i64().map_err(wire_fault)?;
    let position = cur.varint_i64().map_err(wire_fault)?;
    Ok(Rid {
        cluster: i16::try_from(cluster).map_err(|_| range_fault("cluster id", cluster))?,
        position,
    })
}

fn read_count(cur: &mut Cursor<'_>) -> Result<usize, RecordError> {
    let count = cur.varint_i64().map_err(wire_fault)?;
    let count = usize::try_from(count)
        .map_err(|_| RecordError::Malformed(format!("negative count {count}")))?;
    // Every element takes at least one byte, so a count beyond the
    // remaining payload cannot be satisfied.
    if count > cur.remaining() {
        return Err(RecordError::Truncated);
    }
    Ok(count)
}

/// Varint-prefixed string (class names, field names, map keys, values).
fn read_short_string(cur: &mut Cursor<'_>) -> Result<String, RecordError> {
    let raw = read_varint_blob(cur)?;
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| RecordError::Malformed("string is not utf-8".to_string()))
}

fn read_varint_blob<'a>(cur: &mut Cursor<'a>) -> Result<&'a [u8], RecordError> {
    let len = cur.varint_i64().map_err(wire_fault)?;
    let len =
        usize::try_from(len).map_err(|_| RecordError::Malformed(format!("negative length {len}")))?;
    cur.take(len).map_err(wire_fault)
}

/// Inside a record payload the whole blob is in hand, so a short read is
/// truncation, not a retryable partial frame.
fn wire_fault(err: WireError) -> RecordError {
    match err {
        WireError::Incomplete => RecordError::Truncated,
        other => RecordError::Malformed(other.to_string()),
    }
}

fn range_fault(what: &str, value: i64) -> RecordError {
    RecordError::Malformed(format!("{what} value {value} out of range"))
}
