use std::collections::HashSet;
use std::sync::RwLock;

use crate::digest::Digest;

/// Mutable set of digests whose cache entries must be evicted last
/// (component C6). The only mutator is `set`, which replaces the whole set
/// in one step; readers never see a partial view (spec §4.6).
#[derive(Debug, Default)]
pub struct PriorityIndex {
    digests: RwLock<HashSet<Digest>>,
}

impl PriorityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replaces the priority set.
    pub fn set(&self, new_set: HashSet<Digest>) {
        *self.digests.write().expect("priority index lock poisoned") = new_set;
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.digests.read().expect("priority index lock poisoned").contains(digest)
    }

    pub fn snapshot(&self) -> HashSet<Digest> {
        self.digests.read().expect("priority index lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_whole_set_atomically() {
        let index = PriorityIndex::new();
        let a = Digest::from_hex("a".repeat(40));
        let b = Digest::from_hex("b".repeat(40));

        index.set(HashSet::from([a.clone()]));
        assert!(index.contains(&a));
        assert!(!index.contains(&b));

        index.set(HashSet::from([b.clone()]));
        assert!(!index.contains(&a));
        assert!(index.contains(&b));
    }
}
