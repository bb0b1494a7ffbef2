//! Deferred release of evicted page storage.
//!
//! A pushed device context keeps the entries of its snapshot until it is
//! pushed again or released, and a launch may read them at any point until
//! then. Storage of a page that lost its entry therefore stays allocated
//! until every context that could still map it has moved past the
//! retirement: its next push has been installed on the device stream, or
//! the context went back to the pool.

use std::collections::HashSet;

use crate::paging::EvictedPage;

struct RetiredBatch {
    sequence: u64,
    pages: Vec<EvictedPage>,
    /// Context slots that may still map these pages
    waiting: HashSet<usize>,
}

/// Retired pages waiting for the contexts that may still map them.
#[derive(Default)]
pub(crate) struct RetiredPages {
    /// Number of retirements so far
    sequence: u64,
    /// Slots holding installed mappings
    live: HashSet<usize>,
    batches: Vec<RetiredBatch>,
}

impl RetiredPages {
    /// Retire `pages`. Returns them right away when no context holds
    /// mappings.
    pub(crate) fn retire(&mut self, pages: Vec<EvictedPage>) -> Vec<EvictedPage> {
        if self.live.is_empty() || pages.is_empty() {
            return pages;
        }
        self.sequence += 1;
        self.batches.push(RetiredBatch {
            sequence: self.sequence,
            pages,
            waiting: self.live.clone(),
        });
        Vec::new()
    }

    /// `slot` is about to snapshot the resident entries.
    ///
    /// Returns the sequence the snapshot supersedes: pages retired up to it
    /// are not part of the snapshot.
    pub(crate) fn begin_push(&mut self, slot: usize) -> u64 {
        self.live.insert(slot);
        self.sequence
    }

    /// The snapshot taken at `through` is installed in `slot`. Returns the
    /// pages no context can map anymore.
    pub(crate) fn installed(&mut self, slot: usize, through: u64) -> Vec<EvictedPage> {
        self.collect(|batch| {
            if batch.sequence <= through {
                batch.waiting.remove(&slot);
            }
        })
    }

    /// `slot` went back to the pool.
    pub(crate) fn release_slot(&mut self, slot: usize) -> Vec<EvictedPage> {
        self.live.remove(&slot);
        self.collect(|batch| {
            batch.waiting.remove(&slot);
        })
    }

    /// Pages still waiting for a context
    pub(crate) fn pending(&self) -> usize {
        self.batches.iter().map(|batch| batch.pages.len()).sum()
    }

    fn collect(&mut self, mut update: impl FnMut(&mut RetiredBatch)) -> Vec<EvictedPage> {
        let mut ready = Vec::new();
        self.batches.retain_mut(|batch| {
            update(batch);
            if batch.waiting.is_empty() {
                ready.append(&mut batch.pages);
                false
            } else {
                true
            }
        });
        ready
    }
}
