use std::fmt;

/// Synchronization state of a [`StorageProxy`](crate::StorageProxy).
///
/// ```text
/// NoSync -> ReadyToSync -> AwaitingSync -> Sync <-> Desync
///                                    (any) -> Closed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyState {
    /// No reader has asked for data. Write-only proxies stay here.
    NoSync,
    /// A reader is attached but has not requested data yet.
    ReadyToSync,
    /// A sync request is outstanding.
    AwaitingSync,
    /// The local model is consistent with the store.
    Sync,
    /// Operations from the store failed to apply; a resync was requested.
    Desync,
    Closed,
}

impl ProxyState {
    /// Whether the local model may be read.
    pub fn is_readable(self) -> bool {
        matches!(self, ProxyState::Sync | ProxyState::Desync)
    }

    /// Whether local writes notify update listeners.
    pub fn notifies_local_writes(self) -> bool {
        self.is_readable()
    }

    /// Whether model updates from the store are ignored in this state.
    pub fn ignores_model_updates(self) -> bool {
        matches!(self, ProxyState::NoSync | ProxyState::ReadyToSync | ProxyState::Closed)
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::NoSync => "no-sync",
            ProxyState::ReadyToSync => "ready-to-sync",
            ProxyState::AwaitingSync => "awaiting-sync",
            ProxyState::Sync => "sync",
            ProxyState::Desync => "desync",
            ProxyState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_synced_states_are_readable() {
        assert!(ProxyState::Sync.is_readable());
        assert!(ProxyState::Desync.is_readable());
        assert!(!ProxyState::AwaitingSync.is_readable());
        assert!(!ProxyState::NoSync.is_readable());
    }

    #[test]
    fn early_states_ignore_model_updates() {
        assert!(ProxyState::NoSync.ignores_model_updates());
        assert!(ProxyState::ReadyToSync.ignores_model_updates());
        assert!(!ProxyState::AwaitingSync.ignores_model_updates());
        assert_eq!(ProxyState::AwaitingSync.to_string(), "awaiting-sync");
    }
}
