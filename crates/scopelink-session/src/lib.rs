//! ScopeLink command sessions.
//!
//! Call/return semantics over a device's `<device>/command` and
//! `<device>/return` topics:
//!
//! - [`CommandSession`]: one device, one caller; request-id or ordinal correlation
//! - [`CallPolicy`]: publish retry and per-call deadline
//! - [`Command`] / [`Reply`]: the JSON wire model and decoded responses
//! - [`stitch`]: external stitching of scan tiles
//! - [`StatusRegistry`]: latest `devices/<id>/status` per device

pub mod command;
pub mod error;
pub mod policy;
pub mod response;
pub mod session;
pub mod status;
pub mod stitch;

pub use command::{Command, Corner, FocusAmount, FocusPreset, ScanArea, Verb};
pub use error::{Result, SessionError};
pub use policy::{retry_publish, with_deadline, CallPolicy};
pub use response::{Position, Reply};
pub use session::{CommandSession, Correlation, SessionOptions, SessionStats};
pub use status::{DeviceStatus, StatusRegistry};
pub use stitch::StitchTool;
