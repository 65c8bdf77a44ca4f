//! Per-call context bag passed through policy executions.

use std::collections::HashMap;

/// Carries an operation key (used by the cache policy as the cache key) and
/// an arbitrary string bag available to observability callbacks. Never used
/// for control flow by the policies themselves.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    key: String,
    values: HashMap<String, String>,
}

impl CallContext {
    /// Context with the given operation key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), values: HashMap::new() }
    }

    /// The operation key; empty for anonymous calls.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attach a value to the bag, builder-style.
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Look up a bag value.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}
