//! Response decoding.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::Verb;
use crate::error::{Result, SessionError};

/// Stage position reported by `get_pos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

/// Decoded response.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Echo of a `move` or `focus` command.
    Ack(Value),
    Position(Position),
    Image(Vec<u8>),
    /// Scan tiles in device order.
    Images(Vec<Vec<u8>>),
}

/// Request id echoed by the device, if any.
pub fn request_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// Device-reported error, if the response carries one.
pub fn device_error(value: &Value) -> Option<String> {
    value.get("error").map(|e| match e {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Whether `value` could be the response to a `verb` command.
///
/// Used to detect misattributed responses when correlating by arrival order.
pub fn shape_matches(verb: Verb, value: &Value) -> bool {
    if !value.is_object() {
        return false;
    }
    if value.get("error").is_some() {
        return true;
    }
    match verb {
        Verb::GetPos => value.get("pos").map_or(false, Value::is_object),
        Verb::TakeImage => value.get("image").map_or(false, Value::is_string),
        Verb::Scan => value.get("images").map_or(false, Value::is_array),
        Verb::Move | Verb::Focus => value.get("image").is_none() && value.get("images").is_none(),
    }
}

/// Decode a response for the command that produced it.
pub fn decode(verb: Verb, value: Value) -> Result<Reply> {
    if let Some(err) = device_error(&value) {
        return Err(SessionError::Device(err));
    }

    let fail = |reason: String| SessionError::Decode { verb, reason };

    match verb {
        Verb::Move | Verb::Focus => {
            if !value.is_object() {
                return Err(fail("expected a JSON object".into()));
            }
            Ok(Reply::Ack(value))
        }
        Verb::GetPos => {
            let pos = value
                .get("pos")
                .cloned()
                .ok_or_else(|| fail("missing 'pos'".into()))?;
            let pos: Position = serde_json::from_value(pos).map_err(|e| fail(e.to_string()))?;
            Ok(Reply::Position(pos))
        }
        Verb::TakeImage => {
            let image = value
                .get("image")
                .and_then(Value::as_str)
                .ok_or_else(|| fail("missing 'image'".into()))?;
            Ok(Reply::Image(decode_image(image).map_err(fail)?))
        }
        Verb::Scan => {
            let images = value
                .get("images")
                .and_then(Value::as_array)
                .ok_or_else(|| fail("missing 'images'".into()))?;
            let tiles = images
                .iter()
                .enumerate()
                .map(|(i, img)| {
                    let img = img
                        .as_str()
                        .ok_or_else(|| format!("tile {} is not a string", i))?;
                    decode_image(img).map_err(|e| format!("tile {}: {}", i, e))
                })
                .collect::<std::result::Result<Vec<_>, String>>()
                .map_err(fail)?;
            Ok(Reply::Images(tiles))
        }
    }
}

fn decode_image(data: &str) -> std::result::Result<Vec<u8>, String> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| format!("invalid base64: {}", e))
}

/// Encode image bytes the way devices put them on the wire.
pub fn encode_image(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
