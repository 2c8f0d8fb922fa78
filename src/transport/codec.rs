//! Binary frame codec.
//!
//! Frame layout: `[version u8][kind tag u8][fields...]`. Strings and blobs
//! are `u32` big-endian length prefixed; optional fields carry a one-byte
//! presence flag. Any-valued payloads (`arguments`, `result`, `data`) are
//! opaque JSON blobs inside the frame so arbitrary values round-trip.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};
use thiserror::Error;

use super::protocol::{Message, MessageKind};
use super::MAX_FRAME_SIZE;

/// Version byte leading every frame.
pub const PROTOCOL_VERSION: u8 = 0x02;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Frame too large: {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol version mismatch: {0}")]
    VersionMismatch(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Message shown when the peer speaks the JSON text protocol.
pub fn json_peer_mismatch() -> CodecError {
    CodecError::VersionMismatch(format!(
        "peer sent a JSON text frame but this relay speaks binary protocol v{PROTOCOL_VERSION}. \
         Update the sandbox relay (or host client) so both sides use the binary protocol."
    ))
}

/// Encode a message into a frame.
pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
    msg.validate().map_err(CodecError::Invalid)?;

    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg.kind().tag());

    match msg {
        Message::ToolCall {
            id,
            tool,
            arguments,
        } => {
            put_str(&mut buf, id);
            put_str(&mut buf, tool);
            put_blob(&mut buf, &Value::Object(arguments.clone()))?;
        }
        Message::ToolResult {
            id,
            success,
            result,
            error,
        } => {
            put_str(&mut buf, id);
            buf.put_u8(u8::from(*success));
            match result {
                Some(value) => {
                    buf.put_u8(1);
                    put_blob(&mut buf, value)?;
                }
                None => buf.put_u8(0),
            }
            put_opt_str(&mut buf, error.as_deref());
        }
        Message::Execute {
            code,
            remote_tools,
            local_tools,
        } => {
            put_str(&mut buf, code);
            put_len(&mut buf, remote_tools.len());
            for name in remote_tools {
                put_str(&mut buf, name);
            }
            put_len(&mut buf, local_tools.len());
            for (name, source) in local_tools {
                put_str(&mut buf, name);
                put_str(&mut buf, source);
            }
        }
        Message::Result { data } => put_blob(&mut buf, data)?,
        Message::Error { id, error, code } => {
            put_opt_str(&mut buf, id.as_deref());
            put_str(&mut buf, error);
            put_opt_str(&mut buf, code.as_deref());
        }
        Message::Ping { id } | Message::Pong { id } => put_str(&mut buf, id),
    }

    if buf.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: buf.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(buf.freeze())
}

/// Build and encode a message from a kind name and a JSON payload.
///
/// Fails with [`CodecError::UnknownMessageType`] for kinds outside the
/// protocol instead of producing a corrupt frame.
pub fn encode_kind(kind: &str, payload: &Value) -> Result<Bytes, CodecError> {
    let kind: MessageKind = kind.parse().map_err(CodecError::UnknownMessageType)?;

    let mut object = match payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(CodecError::Invalid(format!(
                "payload must be an object, got {other}"
            )))
        }
    };
    object.insert("type".into(), Value::String(kind.as_str().into()));

    let msg: Message = serde_json::from_value(Value::Object(object))
        .map_err(|e| CodecError::Invalid(e.to_string()))?;
    encode(&msg)
}

/// Decode a frame into a message.
pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = frame;
    let version = get_u8(&mut buf)?;
    if version == b'{' {
        return Err(json_peer_mismatch());
    }
    if version != PROTOCOL_VERSION {
        return Err(CodecError::VersionMismatch(format!(
            "peer uses binary protocol v{version}, expected v{PROTOCOL_VERSION}. \
             Update the older side of the relay."
        )));
    }

    let tag = get_u8(&mut buf)?;
    let kind = MessageKind::from_tag(tag)
        .ok_or_else(|| CodecError::Decode(format!("unknown message tag {tag}")))?;

    let msg = match kind {
        MessageKind::ToolCall => {
            let id = get_str(&mut buf)?;
            let tool = get_str(&mut buf)?;
            let arguments = match get_blob(&mut buf)? {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                _ => return Err(CodecError::Decode("arguments must be an object".into())),
            };
            Message::ToolCall {
                id,
                tool,
                arguments,
            }
        }
        MessageKind::ToolResult => {
            let id = get_str(&mut buf)?;
            let success = get_bool(&mut buf)?;
            let result = if get_bool(&mut buf)? {
                Some(get_blob(&mut buf)?)
            } else {
                None
            };
            let error = get_opt_str(&mut buf)?;
            Message::ToolResult {
                id,
                success,
                result,
                error,
            }
        }
        MessageKind::Execute => {
            let code = get_str(&mut buf)?;
            let count = get_len(&mut buf)?;
            let mut remote_tools = Vec::with_capacity(count.min(buf.remaining()));
            for _ in 0..count {
                remote_tools.push(get_str(&mut buf)?);
            }
            let count = get_len(&mut buf)?;
            let mut local_tools = BTreeMap::new();
            for _ in 0..count {
                let name = get_str(&mut buf)?;
                let source = get_str(&mut buf)?;
                local_tools.insert(name, source);
            }
            Message::Execute {
                code,
                remote_tools,
                local_tools,
            }
        }
        MessageKind::Result => Message::Result {
            data: get_blob(&mut buf)?,
        },
        MessageKind::Error => Message::Error {
            id: get_opt_str(&mut buf)?,
            error: get_str(&mut buf)?,
            code: get_opt_str(&mut buf)?,
        },
        MessageKind::Ping => Message::Ping {
            id: get_str(&mut buf)?,
        },
        MessageKind::Pong => Message::Pong {
            id: get_str(&mut buf)?,
        },
    };

    if buf.has_remaining() {
        return Err(CodecError::Decode(format!(
            "{} trailing bytes after {kind} frame",
            buf.remaining()
        )));
    }
    msg.validate().map_err(CodecError::Invalid)?;
    Ok(msg)
}

fn put_len(buf: &mut BytesMut, len: usize) {
    // Frames are capped well below u32::MAX, oversize is caught after encoding.
    buf.put_u32(u32::try_from(len).unwrap_or(u32::MAX));
}

fn put_str(buf: &mut BytesMut, value: &str) {
    put_len(buf, value.len());
    buf.put_slice(value.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_str(buf, value);
        }
        None => buf.put_u8(0),
    }
}

fn put_blob(buf: &mut BytesMut, value: &Value) -> Result<(), CodecError> {
    let bytes = serde_json::to_vec(value).map_err(|e| CodecError::Invalid(e.to_string()))?;
    put_len(buf, bytes.len());
    buf.put_slice(&bytes);
    Ok(())
}

fn need(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Decode(format!(
            "unexpected end of frame (needed {n} bytes, {} left)",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    need(*buf, 1)?;
    Ok(buf.get_u8())
}

fn get_bool(buf: &mut &[u8]) -> Result<bool, CodecError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::Decode(format!("invalid flag byte {other}"))),
    }
}

fn get_len(buf: &mut &[u8]) -> Result<usize, CodecError> {
    need(*buf, 4)?;
    Ok(buf.get_u32() as usize)
}

fn get_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let len = get_len(buf)?;
    need(*buf, len)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn get_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Decode("invalid UTF-8".into()))
}

fn get_opt_str(buf: &mut &[u8]) -> Result<Option<String>, CodecError> {
    if get_bool(buf)? {
        get_str(buf).map(Some)
    } else {
        Ok(None)
    }
}

fn get_blob(buf: &mut &[u8]) -> Result<Value, CodecError> {
    let bytes = get_bytes(buf)?;
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(format!("invalid payload: {e}")))
}
