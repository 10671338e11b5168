//! Shard directory types
//!
//! A shard (forest) is a horizontally-partitioned slice of the document
//! store, queryable independently and addressable at a currently preferred
//! host. Shard identity is the stable shard id: hosts move between
//! directory updates while identity stays fixed, so equality and hashing
//! consider the id only.

use std::hash::{Hash, Hasher};

/// One shard of the document store
#[derive(Debug, Clone)]
pub struct Shard {
    /// Stable shard id
    id: u64,

    /// Shard name, as addressed in page requests
    name: String,

    /// The host the directory currently recommends for this shard
    preferred_host: String,

    /// Database this shard belongs to
    database: String,
}

impl Shard {
    /// Create a new shard descriptor
    pub fn new(
        id: u64,
        name: impl Into<String>,
        preferred_host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            preferred_host: preferred_host.into(),
            database: database.into(),
        }
    }

    /// Stable shard id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Shard name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently preferred host for this shard
    pub fn preferred_host(&self) -> &str {
        &self.preferred_host
    }

    /// Database name
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl PartialEq for Shard {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Shard {}

impl Hash for Shard {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Snapshot source of the cluster's shard layout.
///
/// Implementations are typically backed by a discovery service; the engine
/// only ever asks for the full current list and computes deltas itself.
pub trait ShardDirectory: Send + Sync {
    /// List every shard the store currently exposes
    fn list_shards(&self) -> Vec<Shard>;
}

impl ShardDirectory for Vec<Shard> {
    fn list_shards(&self) -> Vec<Shard> {
        self.clone()
    }
}

impl ShardDirectory for [Shard] {
    fn list_shards(&self) -> Vec<Shard> {
        self.to_vec()
    }
}

/// Distinct preferred hosts in directory order, first occurrence wins.
///
/// The order is load-bearing: the iterating engine round-robins batches
/// over this list by batch number.
pub fn preferred_hosts(shards: &[Shard]) -> Vec<String> {
    let mut hosts = Vec::new();
    for shard in shards {
        if !hosts.iter().any(|h| h == shard.preferred_host()) {
            hosts.push(shard.preferred_host().to_string());
        }
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shard_identity_is_the_id() {
        let a = Shard::new(7, "docs-1", "node1", "docs");
        let b = Shard::new(7, "docs-1", "node2", "docs");
        let c = Shard::new(8, "docs-2", "node1", "docs");

        // same id, different host: still the same shard
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_preferred_hosts_dedup_in_order() {
        let shards = vec![
            Shard::new(1, "f1", "node1", "docs"),
            Shard::new(2, "f2", "node2", "docs"),
            Shard::new(3, "f3", "node1", "docs"),
        ];
        assert_eq!(preferred_hosts(&shards), vec!["node1", "node2"]);
    }
}
