use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(2);

/// Tag attached to a transaction, identifying who made it.
///
/// Undo managers capture only transactions whose origin they track, so a
/// document, a cell, or an undo manager each carry their own origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin(u64);

impl Origin {
    /// Changes that arrived from another replica (merge, sync, incremental load).
    pub const REMOTE: Origin = Origin(0);

    /// Local changes that no undo manager should capture.
    pub const UNTRACKED: Origin = Origin(1);

    /// Allocate a fresh origin, distinct from every other origin in the process.
    pub fn unique() -> Self {
        Origin(NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_remote(self) -> bool {
        self == Self::REMOTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_origins_are_distinct() {
        let a = Origin::unique();
        let b = Origin::unique();
        assert_ne!(a, b);
        assert_ne!(a, Origin::REMOTE);
        assert_ne!(a, Origin::UNTRACKED);
        assert!(Origin::REMOTE.is_remote());
        assert!(!Origin::UNTRACKED.is_remote());
    }
}
