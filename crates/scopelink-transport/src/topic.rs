//! Topic filters with MQTT wildcard semantics.
//!
//! `+` matches exactly one level, a trailing `#` matches the parent level and
//! everything below it. Wildcards never match topics starting with `$`.

use std::fmt;

use crate::error::{Result, TransportError};

/// A validated subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter(String);

impl TopicFilter {
    /// Parse and validate a filter.
    pub fn new(filter: impl Into<String>) -> Result<Self> {
        let filter = filter.into();
        let invalid = |reason: &str| TransportError::InvalidTopicFilter {
            filter: filter.clone(),
            reason: reason.to_string(),
        };

        if filter.is_empty() {
            return Err(invalid("filter is empty"));
        }

        let levels: Vec<&str> = filter.split('/').collect();
        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
                return Err(invalid("'#' must be the whole last level"));
            }
            if level.contains('+') && *level != "+" {
                return Err(invalid("'+' must occupy a whole level"));
            }
        }

        Ok(Self(filter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the filter contains a wildcard level.
    pub fn is_wildcard(&self) -> bool {
        self.0.split('/').any(|l| l == "+" || l == "#")
    }

    /// Whether `topic` is matched by this filter.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && !self.0.starts_with('$') {
            return false;
        }

        let mut filter_levels = self.0.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(f), Some(t)) if f == t => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for TopicFilter {
    type Error = TransportError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

/// Validate a concrete publish topic (no wildcards, not empty).
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains('+') || topic.contains('#') {
        return Err(TransportError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Command topic of a device.
pub fn command_topic(device: &str) -> String {
    format!("{}/command", device)
}

/// Return (response) topic of a device.
pub fn return_topic(device: &str) -> String {
    format!("{}/return", device)
}

/// Wildcard filter covering every device status topic.
pub const STATUS_FILTER: &str = "devices/+/status";

/// Extract the device id from a `devices/<id>/status` topic.
pub fn status_device_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["devices", id, "status"] if !id.is_empty() => Some(*id),
        _ => None,
    }
}
