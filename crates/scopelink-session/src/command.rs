//! Command wire model.
//!
//! Commands travel as a JSON object with the verb under `"command"` and the
//! arguments flattened next to it:
//!
//! ```json
//! {"command":"move","x":10,"y":0,"z":null,"relative":true}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Verb of a command as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Move,
    Focus,
    GetPos,
    TakeImage,
    Scan,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Move => "move",
            Verb::Focus => "focus",
            Verb::GetPos => "get_pos",
            Verb::TakeImage => "take_image",
            Verb::Scan => "scan",
        };
        f.write_str(s)
    }
}

/// Named focus step sizes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusPreset {
    Huge,
    Fast,
    Medium,
    Fine,
}

/// How far to focus: a preset or a raw step count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FocusAmount {
    Preset(FocusPreset),
    Steps(i64),
}

impl Default for FocusAmount {
    fn default() -> Self {
        FocusAmount::Preset(FocusPreset::Fast)
    }
}

impl FromStr for FocusAmount {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "huge" => Ok(FocusAmount::Preset(FocusPreset::Huge)),
            "fast" => Ok(FocusAmount::Preset(FocusPreset::Fast)),
            "medium" => Ok(FocusAmount::Preset(FocusPreset::Medium)),
            "fine" => Ok(FocusAmount::Preset(FocusPreset::Fine)),
            other => other.parse::<i64>().map(FocusAmount::Steps).map_err(|_| {
                format!(
                    "invalid focus amount '{}': expected huge, fast, medium, fine or an integer",
                    s
                )
            }),
        }
    }
}

/// Scan corner: explicit stage coordinates or a position name known to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Corner {
    Coordinates(Vec<i64>),
    Named(String),
}

impl FromStr for Corner {
    type Err = String;

    /// `"100,200"` or `"100,200,0"` parse as coordinates, anything else is a name.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty scan corner".to_string());
        }
        let parsed: std::result::Result<Vec<i64>, _> =
            s.split(',').map(|part| part.trim().parse::<i64>()).collect();
        Ok(match parsed {
            Ok(coords) => Corner::Coordinates(coords),
            Err(_) => Corner::Named(s.to_string()),
        })
    }
}

fn default_overlap() -> i64 {
    1200
}

/// Rectangle to scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanArea {
    pub c1: Corner,
    pub c2: Corner,
    /// Overlap between neighbouring tiles
    #[serde(default = "default_overlap")]
    pub ov: i64,
    /// Focus adjustment between tiles
    #[serde(default)]
    pub foc: i64,
}

impl ScanArea {
    pub fn new(c1: Corner, c2: Corner) -> Self {
        Self {
            c1,
            c2,
            ov: default_overlap(),
            foc: 0,
        }
    }

    pub fn with_overlap(mut self, ov: i64) -> Self {
        self.ov = ov;
        self
    }

    pub fn with_focus_step(mut self, foc: i64) -> Self {
        self.foc = foc;
        self
    }
}

/// A command for the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Move {
        x: i64,
        y: i64,
        /// `None` leaves the focus axis untouched.
        z: Option<i64>,
        relative: bool,
    },
    Focus {
        #[serde(default)]
        amount: FocusAmount,
    },
    GetPos,
    TakeImage,
    Scan(ScanArea),
}

impl Command {
    /// Absolute move.
    pub fn move_to(x: i64, y: i64, z: Option<i64>) -> Self {
        Command::Move {
            x,
            y,
            z,
            relative: false,
        }
    }

    /// Move relative to the current position.
    pub fn move_by(x: i64, y: i64, z: Option<i64>) -> Self {
        Command::Move {
            x,
            y,
            z,
            relative: true,
        }
    }

    pub fn verb(&self) -> Verb {
        match self {
            Command::Move { .. } => Verb::Move,
            Command::Focus { .. } => Verb::Focus,
            Command::GetPos => Verb::GetPos,
            Command::TakeImage => Verb::TakeImage,
            Command::Scan(_) => Verb::Scan,
        }
    }

    /// Encode for the command topic, adding the request id when given.
    pub fn to_wire(&self, request_id: Option<&str>) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        if let (Some(id), Some(obj)) = (request_id, value.as_object_mut()) {
            obj.insert("id".to_string(), Value::String(id.to_string()));
        }
        Ok(serde_json::to_vec(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(cmd: &Command, id: Option<&str>) -> Value {
        serde_json::from_slice(&cmd.to_wire(id).unwrap()).unwrap()
    }

    #[test]
    fn test_move_wire_format() {
        assert_eq!(
            wire(&Command::move_by(10, 0, None), None),
            json!({"command": "move", "x": 10, "y": 0, "z": null, "relative": true})
        );
        assert_eq!(
            wire(&Command::move_to(1, 2, Some(3)), Some("abc")),
            json!({"command": "move", "x": 1, "y": 2, "z": 3, "relative": false, "id": "abc"})
        );
    }

    #[test]
    fn test_unit_verbs() {
        assert_eq!(wire(&Command::GetPos, None), json!({"command": "get_pos"}));
        assert_eq!(wire(&Command::TakeImage, None), json!({"command": "take_image"}));
    }

    #[test]
    fn test_focus_amounts() {
        let default: Command = serde_json::from_value(json!({"command": "focus"})).unwrap();
        assert_eq!(
            default,
            Command::Focus {
                amount: FocusAmount::Preset(FocusPreset::Fast)
            }
        );
        assert_eq!(
            wire(&Command::Focus { amount: FocusAmount::Steps(-250) }, None),
            json!({"command": "focus", "amount": -250})
        );
        assert_eq!("Fine".parse::<FocusAmount>().unwrap(), FocusAmount::Preset(FocusPreset::Fine));
        assert_eq!("40".parse::<FocusAmount>().unwrap(), FocusAmount::Steps(40));
        assert!("slow".parse::<FocusAmount>().is_err());
    }

    #[test]
    fn test_scan_wire_format() {
        let area = ScanArea::new(Corner::Coordinates(vec![0, 0]), "home".parse().unwrap());
        assert_eq!(
            wire(&Command::Scan(area), None),
            json!({"command": "scan", "c1": [0, 0], "c2": "home", "ov": 1200, "foc": 0})
        );

        let parsed: Command =
            serde_json::from_value(json!({"command": "scan", "c1": [1, 2, 3], "c2": [4, 5, 6]}))
                .unwrap();
        match parsed {
            Command::Scan(area) => {
                assert_eq!(area.c2, Corner::Coordinates(vec![4, 5, 6]));
                assert_eq!(area.ov, 1200);
                assert_eq!(area.foc, 0);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_corner_parsing() {
        assert_eq!(
            "100, -200".parse::<Corner>().unwrap(),
            Corner::Coordinates(vec![100, -200])
        );
        assert_eq!(
            "top-left".parse::<Corner>().unwrap(),
            Corner::Named("top-left".into())
        );
        assert!("".parse::<Corner>().is_err());
    }
}
