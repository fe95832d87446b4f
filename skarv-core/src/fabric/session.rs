//! Consumer-context identity.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::data::SyncMode;

/// Identity of one consumer context, alive for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Random stable identifier for this context.
    pub tab_id: String,
    /// Whether this context currently owns the feed (leader fabric).
    pub is_leader: bool,
    /// Which fabric variant the context selected.
    pub sync_mode: SyncMode,
}

impl Session {
    pub fn new(sync_mode: SyncMode) -> Self {
        Self {
            tab_id: random_tab_id(),
            is_leader: false,
            sync_mode,
        }
    }
}

/// 12-character random alphanumeric id.
pub fn random_tab_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_ids_are_unique_enough() {
        let a = random_tab_id();
        let b = random_tab_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
