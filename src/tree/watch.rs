use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::{DataPath, DataTree, TreeError};

/// Value of a subscribed path at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub path: DataPath,
    pub value: Option<Value>,
}

/// Live view of one path. The first [`Subscription::next`] returns the
/// current value; each later call waits for a committed write that touches
/// the path and returns the new value.
pub struct Subscription {
    tree: DataTree,
    path: DataPath,
    changes: broadcast::Receiver<DataPath>,
    primed: bool,
}

impl Subscription {
    pub(super) fn new(tree: DataTree, path: DataPath, changes: broadcast::Receiver<DataPath>) -> Self {
        Self {
            tree,
            path,
            changes,
            primed: false,
        }
    }

    pub fn path(&self) -> &DataPath {
        &self.path
    }

    /// `Ok(None)` once the tree has gone away.
    pub async fn next(&mut self) -> Result<Option<Snapshot>, TreeError> {
        if self.primed && !self.wait_for_change().await {
            return Ok(None);
        }
        self.primed = true;

        let value = self.tree.get(&self.path)?;
        Ok(Some(Snapshot {
            path: self.path.clone(),
            value,
        }))
    }

    pub fn unsubscribe(self) {
        tracing::debug!(path = %self.path, "unsubscribed");
    }

    async fn wait_for_change(&mut self) -> bool {
        loop {
            match self.changes.recv().await {
                Ok(changed) if changed.overlaps(&self.path) => break,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    // Missed notifications may have touched us; re-read
                    tracing::debug!(path = %self.path, skipped, "subscriber lagged");
                    break;
                }
                Err(RecvError::Closed) => return false,
            }
        }

        // Fold anything already queued into this one delivery
        loop {
            match self.changes.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return true,
            }
        }
    }
}
