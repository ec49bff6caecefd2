//! Window granularities and storage key derivation.

use std::fmt;

/// Endpoint used when the caller does not name one.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowType {
    /// One hour
    Hourly,
    /// One minute
    Minute,
    /// Ten seconds, caps short spikes
    Burst,
    /// Caller-chosen window in seconds
    Custom(u64),
}

impl WindowType {
    /// Length of this window in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            WindowType::Hourly => 3600,
            WindowType::Minute => 60,
            WindowType::Burst => 10,
            WindowType::Custom(secs) => *secs,
        }
    }

    /// Name used as the last key segment.
    pub fn name(&self) -> String {
        match self {
            WindowType::Hourly => "hourly".to_string(),
            WindowType::Minute => "minute".to_string(),
            WindowType::Burst => "burst".to_string(),
            WindowType::Custom(secs) => format!("custom{}", secs),
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A key that uniquely identifies one window counter.
///
/// Rendered as `{prefix}:{identifier}:{endpoint}:{window}`. Identifier and
/// endpoint are escaped so that neither can forge a separator or a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub prefix: String,
    pub identifier: String,
    pub endpoint: String,
    pub window: WindowType,
}

impl WindowKey {
    pub fn new(prefix: &str, identifier: &str, endpoint: &str, window: WindowType) -> Self {
        Self {
            prefix: prefix.to_string(),
            identifier: identifier.to_string(),
            endpoint: endpoint.to_string(),
            window,
        }
    }

    /// Storage key for this window.
    pub fn to_storage_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.prefix,
            escape_component(&self.identifier),
            escape_component(&self.endpoint),
            self.window.name()
        )
    }

    /// Pattern matching every window key of an identifier, optionally scoped
    /// to one endpoint.
    pub fn pattern(prefix: &str, identifier: &str, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(endpoint) => format!(
                "{}:{}:{}:*",
                prefix,
                escape_component(identifier),
                escape_component(endpoint)
            ),
            None => format!("{}:{}:*", prefix, escape_component(identifier)),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage_key())
    }
}

/// Percent-encode the characters that carry meaning in keys or patterns.
pub fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' | ':' | '*' | '?' | '[' | ']' | '\\' => out.push_str(&format!("%{:02X}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}
