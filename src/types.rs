//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: process-unique, monotonically increasing connection id
//! - `ClientIdGenerator`: the counter that hands ids out

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique client identifier (newtype pattern)
///
/// Ids are handed out by a [`ClientIdGenerator`] and never reused for the
/// lifetime of the process. Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Nickname a connection holds until it renames itself.
    ///
    /// Unique because ids are unique, and always passes nickname validation.
    pub fn default_nickname(&self) -> String {
        format!("user-{}", self.0)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of fresh client ids
///
/// Owned by whoever accepts connections and passed around explicitly.
#[derive(Debug)]
pub struct ClientIdGenerator {
    next: AtomicU64,
}

impl ClientIdGenerator {
    /// Create a generator whose first id is 1
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Take the next id
    pub fn next_id(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::is_valid_nickname;

    #[test]
    fn test_client_ids_increase() {
        let ids = ClientIdGenerator::new();
        let id1 = ids.next_id();
        let id2 = ids.next_id();
        assert_eq!(id1, ClientId(1));
        assert_eq!(id2, ClientId(2));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_default_nickname() {
        let id = ClientId(42);
        assert_eq!(id.default_nickname(), "user-42");
        assert!(is_valid_nickname(&id.default_nickname()));
    }
}
