//! Usage record keys.

/// Namespace of every usage record in the coordination backend.
pub const KEY_PREFIX: &str = "ratelimit";

/// Backend key holding one identifier's usage record.
///
/// The identifier is used verbatim: no escaping, and the empty string maps
/// to its own key like any other identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey(String);

impl UsageKey {
    pub fn new(identifier: &str) -> Self {
        Self(format!("{}:{}", KEY_PREFIX, identifier))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UsageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
