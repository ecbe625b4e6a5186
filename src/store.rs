use std::sync::Arc;

use tokio::sync::watch;

use crate::hetzner::ServerRecord;

pub type Snapshot = Arc<Vec<ServerRecord>>;

/// Holds the most recently synchronized inventory.
///
/// Publishing swaps a single pointer, so readers either see the previous
/// snapshot or the new one in full, never a partially updated mix. Before
/// the first sync completes there is no snapshot at all, which is an
/// explicit state rather than an error.
#[derive(Clone)]
pub struct SnapshotStore {
    sender: Arc<watch::Sender<Option<Snapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(None);

        Self {
            sender: Arc::new(sender),
        }
    }

    /// Replace the current snapshot and wake all subscribers.
    pub fn publish(&self, servers: Vec<ServerRecord>) {
        self.sender.send_replace(Some(Arc::new(servers)));
    }

    pub fn current(&self) -> Option<Snapshot> {
        self.sender.borrow().clone()
    }

    /// Change notifications for parties interested in refreshed inventory.
    pub fn subscribe(&self) -> watch::Receiver<Option<Snapshot>> {
        self.sender.subscribe()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}
