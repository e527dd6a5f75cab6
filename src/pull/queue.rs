use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::pull::types::{BlockInfo, FileInfo};

/// Work plan for one needed file: the target descriptor, the blocks the
/// local version already holds, and the blocks to obtain.
#[derive(Debug, Clone)]
pub struct BlockQueueAdd {
    pub file: FileInfo,
    pub have: Vec<BlockInfo>,
    pub need: Vec<BlockInfo>,
}

/// One unit of work for the dispatcher. An item carries either a copy
/// plan or a target block, never both; an item with neither closes the
/// file through the empty-block path. `last` marks the terminal item of
/// its file's plan.
#[derive(Debug, Clone)]
pub struct QueuedBlock {
    pub file: FileInfo,
    pub block: Option<BlockInfo>,
    pub copy: Vec<BlockInfo>,
    pub last: bool,
}

/// FIFO of per-file work items. The reconciler refills it between pull
/// cycles; the filler task drains it one item at a time.
#[derive(Debug, Default)]
pub struct BlockQueue {
    queued: Mutex<VecDeque<QueuedBlock>>,
    notify: Notify,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expands a file plan into queue items. Files already queued are
    /// skipped so a refill cannot produce a second open file for the
    /// same name.
    ///
    /// The expansion is: one copy item when there is anything to copy,
    /// one item per needed block with `last` on the final one, and a
    /// trailing empty `last` item when nothing needs fetching. The
    /// trailing item is what drives deletions, metadata-only changes and
    /// empty files through to finalization.
    pub fn put(&self, add: BlockQueueAdd) {
        let mut queued = self.lock();
        if queued.iter().any(|b| b.file.name == add.file.name) {
            return;
        }

        if !add.have.is_empty() {
            queued.push_back(QueuedBlock {
                file: add.file.clone(),
                block: None,
                copy: add.have,
                last: false,
            });
        }

        let need_len = add.need.len();
        for (i, block) in add.need.into_iter().enumerate() {
            queued.push_back(QueuedBlock {
                file: add.file.clone(),
                block: Some(block),
                copy: Vec::new(),
                last: i == need_len - 1,
            });
        }

        if need_len == 0 {
            queued.push_back(QueuedBlock {
                file: add.file,
                block: None,
                copy: Vec::new(),
                last: true,
            });
        }

        drop(queued);
        self.notify.notify_one();
    }

    /// Pops the next item, waiting until one is available.
    pub async fn get(&self) -> QueuedBlock {
        loop {
            let notified = self.notify.notified();
            if let Some(b) = self.lock().pop_front() {
                // Wake any other waiter in case more items remain.
                self.notify.notify_one();
                return b;
            }
            notified.await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedBlock>> {
        match self.queued.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            flags: 0,
            modified: 0,
            blocks: Vec::new(),
        }
    }

    fn block(offset: u64, tag: u8) -> BlockInfo {
        BlockInfo {
            offset,
            size: 128,
            hash: vec![tag; 32],
        }
    }

    #[tokio::test]
    async fn expands_have_and_need_into_items() {
        let q = BlockQueue::new();
        q.put(BlockQueueAdd {
            file: file("a"),
            have: vec![block(0, 1)],
            need: vec![block(128, 2), block(256, 3)],
        });

        let copy = q.get().await;
        assert_eq!(copy.copy.len(), 1);
        assert!(copy.block.is_none());
        assert!(!copy.last);

        let first = q.get().await;
        assert_eq!(first.block.as_ref().expect("block").offset, 128);
        assert!(first.copy.is_empty());
        assert!(!first.last);

        let second = q.get().await;
        assert_eq!(second.block.as_ref().expect("block").offset, 256);
        assert!(second.last);

        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn plan_without_needed_blocks_gets_trailing_empty_item() {
        let q = BlockQueue::new();
        q.put(BlockQueueAdd {
            file: file("meta"),
            have: vec![block(0, 1)],
            need: Vec::new(),
        });

        let copy = q.get().await;
        assert!(!copy.copy.is_empty());
        assert!(!copy.last);

        let empty = q.get().await;
        assert!(empty.block.is_none());
        assert!(empty.copy.is_empty());
        assert!(empty.last);
    }

    #[tokio::test]
    async fn tombstone_plan_is_a_single_empty_item() {
        let q = BlockQueue::new();
        q.put(BlockQueueAdd {
            file: file("gone"),
            have: Vec::new(),
            need: Vec::new(),
        });

        let only = q.get().await;
        assert!(only.block.is_none());
        assert!(only.copy.is_empty());
        assert!(only.last);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn duplicate_file_names_are_not_requeued() {
        let q = BlockQueue::new();
        let add = BlockQueueAdd {
            file: file("a"),
            have: Vec::new(),
            need: vec![block(0, 1)],
        };
        q.put(add.clone());
        q.put(add);

        let _ = q.get().await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_wakes_up_on_put() {
        let q = std::sync::Arc::new(BlockQueue::new());
        let q2 = std::sync::Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.get().await });

        tokio::task::yield_now().await;
        q.put(BlockQueueAdd {
            file: file("late"),
            have: Vec::new(),
            need: Vec::new(),
        });

        let got = waiter.await.expect("join");
        assert_eq!(got.file.name, "late");
    }
}
