//! Cached head-of-chain (last irreversible block) state.
//!
//! Decode tasks run concurrently, so every update is a single replace of the
//! whole value through a `watch` channel; readers never see a mix of two
//! updates. A later update overwrites an earlier one even if it describes an
//! older block.

use std::sync::Arc;

use tokio::sync::watch;

use chainstream_core::ChainHead;

#[derive(Debug, Clone)]
pub struct HeadState {
    tx: Arc<watch::Sender<Option<ChainHead>>>,
}

impl Default for HeadState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the cached head. Re-applying the current value is a no-op and
    /// does not wake watchers.
    pub fn apply(&self, head: ChainHead) {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&head) {
                false
            } else {
                *current = Some(head);
                true
            }
        });
    }

    pub fn get(&self) -> Option<ChainHead> {
        self.tx.borrow().clone()
    }

    /// Last irreversible block number, 0 before the first update.
    pub fn lib_num(&self) -> u64 {
        self.tx.borrow().as_ref().map_or(0, |h| h.block_num)
    }

    /// Receiver that is notified on every change.
    pub fn watch(&self) -> watch::Receiver<Option<ChainHead>> {
        self.tx.subscribe()
    }
}
