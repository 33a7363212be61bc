use std::fmt;

use dashmap::DashMap;
use tracing::info;

use crate::transport::ContextId;

// ---------------------------------------------------------------------------
// Owner
// ---------------------------------------------------------------------------

/// Which context currently serves an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// The broker context's own handler table.
    Local,
    /// A satellite context.
    Remote(ContextId),
}

impl Owner {
    #[must_use]
    pub fn context_id(self) -> ContextId {
        match self {
            Owner::Local => ContextId::BROKER,
            Owner::Remote(id) => id,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Local => f.write_str("broker"),
            Owner::Remote(id) => write!(f, "{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// The broker's map from operation name to owning context.
///
/// Last writer wins: registering a name again replaces its owner, and the
/// previous owner silently stops receiving calls for it. Entries are never
/// removed, so an entry may point at a satellite that has since gone away;
/// routing checks reachability when the call is made.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    owners: DashMap<String, Owner>,
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as served by the broker context. Idempotent.
    pub fn register_local(&self, name: &str) -> Option<Owner> {
        self.register(name, Owner::Local)
    }

    /// Marks `name` as served by satellite `context`.
    pub fn register_remote(&self, name: &str, context: ContextId) -> Option<Owner> {
        self.register(name, Owner::Remote(context))
    }

    /// Sets the owner of `name`, returning the previous one.
    ///
    /// Logs when ownership moves to a different context.
    pub fn register(&self, name: &str, owner: Owner) -> Option<Owner> {
        let previous = self.owners.insert(name.to_string(), owner);
        if let Some(prev) = previous {
            if prev != owner {
                info!(operation = name, from = %prev, to = %owner, "operation owner overwritten");
            }
        }
        previous
    }

    #[must_use]
    pub fn owner(&self, name: &str) -> Option<Owner> {
        self.owners.get(name).map(|entry| *entry.value())
    }

    /// Names currently owned by `context`, sorted.
    #[must_use]
    pub fn owned_by(&self, context: ContextId) -> Vec<String> {
        let mut names: Vec<String> = self
            .owners
            .iter()
            .filter(|entry| entry.value().context_id() == context)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Snapshot of every entry, sorted by name.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Owner)> {
        let mut entries: Vec<(String, Owner)> = self
            .owners
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
