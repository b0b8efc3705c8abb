//! Wire codec (§4.B): encodes outbound frames and decodes inbound ones
//! in either the JSON positional-array form or the compact binary form.

use serde_json::Value;

use crate::error::Error;
use crate::message::{Frame, FramePayload};

/// What actually goes out over (or comes in from) the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireData {
    Text(String),
    Binary(Vec<u8>),
}

const KIND_PUSH: u8 = 0;
const KIND_REPLY: u8 = 1;
const KIND_BROADCAST: u8 = 2;

/// Encode a frame. Binary is selected when the payload is a raw byte
/// buffer; JSON otherwise.
pub fn encode(frame: &Frame) -> WireData {
    match &frame.payload {
        FramePayload::Json(payload) => WireData::Text(encode_json(frame, payload)),
        FramePayload::Binary(bytes) => WireData::Binary(encode_binary_push_or_broadcast(frame, bytes)),
        FramePayload::BinaryReply { status, response } => {
            WireData::Binary(encode_binary_reply(frame, status, response))
        }
    }
}

fn encode_json(frame: &Frame, payload: &Value) -> String {
    let arr = Value::Array(vec![
        opt_str_to_value(&frame.join_ref),
        opt_str_to_value(&frame.ref_),
        Value::String(frame.topic.clone()),
        Value::String(frame.event.clone()),
        payload.clone(),
    ]);
    arr.to_string()
}

fn opt_str_to_value(s: &Option<String>) -> Value {
    match s {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn encode_binary_push_or_broadcast(frame: &Frame, payload: &[u8]) -> Vec<u8> {
    let topic = frame.topic.as_bytes();
    let event = frame.event.as_bytes();

    let mut out = Vec::new();
    match &frame.join_ref {
        Some(join_ref) => {
            let join_ref = join_ref.as_bytes();
            out.push(KIND_PUSH);
            out.push(join_ref.len() as u8);
            out.push(topic.len() as u8);
            out.push(event.len() as u8);
            out.extend_from_slice(join_ref);
        }
        None => {
            out.push(KIND_BROADCAST);
            out.push(topic.len() as u8);
            out.push(event.len() as u8);
        }
    }
    out.extend_from_slice(topic);
    out.extend_from_slice(event);
    out.extend_from_slice(payload);
    out
}

fn encode_binary_reply(frame: &Frame, status: &str, response: &[u8]) -> Vec<u8> {
    let join_ref = frame.join_ref.clone().unwrap_or_default();
    let ref_ = frame.ref_.clone().unwrap_or_default();
    let join_ref = join_ref.as_bytes();
    let ref_ = ref_.as_bytes();
    let topic = frame.topic.as_bytes();
    let status = status.as_bytes();

    let mut out = Vec::new();
    out.push(KIND_REPLY);
    out.push(join_ref.len() as u8);
    out.push(ref_.len() as u8);
    out.push(topic.len() as u8);
    out.push(status.len() as u8);
    out.extend_from_slice(join_ref);
    out.extend_from_slice(ref_);
    out.extend_from_slice(topic);
    out.extend_from_slice(status);
    out.extend_from_slice(response);
    out
}

/// Decode an inbound wire message, dispatching on text vs. binary.
pub fn decode(data: &WireData) -> Result<Frame, Error> {
    match data {
        WireData::Text(text) => decode_json(text),
        WireData::Binary(bytes) => decode_binary(bytes),
    }
}

fn decode_json(text: &str) -> Result<Frame, Error> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::BadFrame(format!("invalid json: {e}")))?;

    if let Value::Array(items) = &value {
        if items.len() == 5 {
            let join_ref = value_to_opt_str(&items[0]);
            let ref_ = value_to_opt_str(&items[1]);
            let topic = items[2]
                .as_str()
                .ok_or_else(|| Error::BadFrame("topic must be a string".into()))?
                .to_string();
            let event = items[3]
                .as_str()
                .ok_or_else(|| Error::BadFrame("event must be a string".into()))?
                .to_string();
            let payload = items[4].clone();
            return Ok(Frame {
                join_ref,
                ref_,
                topic,
                event,
                payload: FramePayload::Json(payload),
            });
        }
        return Err(Error::BadFrame(format!(
            "expected a 5-element array, got {}",
            items.len()
        )));
    }

    if let Value::Object(map) = &value {
        let join_ref = map.get("join_ref").and_then(|v| value_to_opt_str(v));
        let ref_ = map.get("ref").and_then(|v| value_to_opt_str(v));
        let topic = map
            .get("topic")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadFrame("missing topic field".into()))?
            .to_string();
        let event = map
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadFrame("missing event field".into()))?
            .to_string();
        let payload = map.get("payload").cloned().unwrap_or(Value::Null);
        return Ok(Frame {
            join_ref,
            ref_,
            topic,
            event,
            payload: FramePayload::Json(payload),
        });
    }

    Err(Error::BadFrame(
        "text frame is neither a 5-tuple nor an object with the required fields".into(),
    ))
}

fn value_to_opt_str(v: &Value) -> Option<String> {
    v.as_str().map(|s| s.to_string())
}

fn decode_binary(bytes: &[u8]) -> Result<Frame, Error> {
    let mut cursor = Cursor::new(bytes);
    let kind = cursor.take_u8()?;
    match kind {
        KIND_PUSH => {
            let join_ref_len = cursor.take_u8()? as usize;
            let topic_len = cursor.take_u8()? as usize;
            let event_len = cursor.take_u8()? as usize;
            let join_ref = cursor.take_str(join_ref_len)?;
            let topic = cursor.take_str(topic_len)?;
            let event = cursor.take_str(event_len)?;
            let payload = cursor.take_rest();
            Ok(Frame {
                join_ref: Some(join_ref),
                ref_: None,
                topic,
                event,
                payload: FramePayload::Binary(payload),
            })
        }
        KIND_REPLY => {
            let join_ref_len = cursor.take_u8()? as usize;
            let ref_len = cursor.take_u8()? as usize;
            let topic_len = cursor.take_u8()? as usize;
            let status_len = cursor.take_u8()? as usize;
            let join_ref = cursor.take_str(join_ref_len)?;
            let ref_ = cursor.take_str(ref_len)?;
            let topic = cursor.take_str(topic_len)?;
            let status = cursor.take_str(status_len)?;
            let response = cursor.take_rest();
            Ok(Frame {
                join_ref: Some(join_ref),
                ref_: Some(ref_),
                topic,
                event: crate::message::PHX_REPLY.to_string(),
                payload: FramePayload::BinaryReply { status, response },
            })
        }
        KIND_BROADCAST => {
            let topic_len = cursor.take_u8()? as usize;
            let event_len = cursor.take_u8()? as usize;
            let topic = cursor.take_str(topic_len)?;
            let event = cursor.take_str(event_len)?;
            let payload = cursor.take_rest();
            Ok(Frame {
                join_ref: None,
                ref_: None,
                topic,
                event,
                payload: FramePayload::Binary(payload),
            })
        }
        other => Err(Error::BadFrame(format!("unknown binary frame kind {other}"))),
    }
}

/// Tiny bounds-checked reader over the binary wire format.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_u8(&mut self) -> Result<u8, Error> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| Error::BadFrame("unexpected end of binary frame".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take_str(&mut self, len: usize) -> Result<String, Error> {
        let bytes = self.take_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| Error::BadFrame(format!("invalid utf8: {e}")))
    }

    fn take_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let end = self.pos.checked_add(len).ok_or_else(|| {
            Error::BadFrame("declared length overflowed while reading binary frame".into())
        })?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| Error::BadFrame("declared length reads past end of buffer".into()))?;
        self.pos = end;
        Ok(slice.to_vec())
    }

    fn take_rest(&mut self) -> Vec<u8> {
        let rest = self.bytes[self.pos..].to_vec();
        self.pos = self.bytes.len();
        rest
    }
}
