//! Per-device residency bookkeeping.
//!
//! The [`PagingSystem`] tracks every page with activity through
//! `NonResident -> Requested -> Filling -> Resident`, decides which requested
//! pages to fill, publishes filled entries, and chooses pages to evict when
//! resident bytes exceed the texture budget. It never touches page data
//! itself: evicted and invalidated pages are handed back to the caller, which
//! returns their storage through the owning handler.
//!
//! All state lives behind one mutex. Mapping snapshots, fill publication and
//! the eviction re-check all happen under it, so a snapshot never contains a
//! half-published entry and a page is never evicted while pinned.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use demand_loading_memory::{ContextHandle, MemoryBudget, PageId};
use demand_loading_scheduler::{SchedulerError, Stream};

use crate::handler::FilledPage;
use crate::options::Options;
use crate::page_table::PageTableEntry;
use crate::FillError;

/// Residency of a single page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    NonResident,
    Requested,
    Filling,
    Resident,
}

/// Decides which pages of an invalidated range lose their entry.
pub trait PageInvalidator: Send + Sync {
    /// Whether the page currently mapped to `entry` must be dropped
    fn should_invalidate(&self, page_id: PageId, entry: PageTableEntry) -> bool;

    /// Whether a dropped page is requested again right away
    fn reload(&self) -> bool {
        false
    }
}

impl<F> PageInvalidator for F
where
    F: Fn(PageId, PageTableEntry) -> bool + Send + Sync,
{
    fn should_invalidate(&self, page_id: PageId, entry: PageTableEntry) -> bool {
        self(page_id, entry)
    }
}

/// Wraps a predicate so invalidated pages are reloaded.
pub struct Reload<F>(pub F);

impl<F> PageInvalidator for Reload<F>
where
    F: Fn(PageId, PageTableEntry) -> bool + Send + Sync,
{
    fn should_invalidate(&self, page_id: PageId, entry: PageTableEntry) -> bool {
        (self.0)(page_id, entry)
    }

    fn reload(&self) -> bool {
        true
    }
}

/// Pages `[start, end)` waiting to be invalidated.
#[derive(Clone)]
pub struct InvalidationRange {
    pub start: PageId,
    pub end: PageId,
    pub predicate: Arc<dyn PageInvalidator>,
}

impl InvalidationRange {
    pub fn new(start: PageId, end: PageId, predicate: Arc<dyn PageInvalidator>) -> Self {
        Self {
            start,
            end,
            predicate,
        }
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        page_id >= self.start && page_id < self.end
    }
}

impl std::fmt::Debug for InvalidationRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationRange")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("reload", &self.predicate.reload())
            .finish()
    }
}

/// A page that lost its entry and whose storage must be released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictedPage {
    pub page_id: PageId,
    pub entry: PageTableEntry,
}

/// Paging counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingStats {
    /// Pull cycles processed
    pub cycles: u64,
    /// Page ids reported by the device, duplicates included
    pub requests_seen: u64,
    /// Requests merged into an identical or in-flight request
    pub coalesced: u64,
    /// Requests for pages that were already resident
    pub already_resident: u64,
    /// Requests left for a later pull by the fill limit
    pub deferred: u64,
    pub fills_dispatched: u64,
    pub fills_succeeded: u64,
    pub fills_failed: u64,
    pub evictions: u64,
    /// Queued evictions dropped by the re-check
    pub evictions_skipped: u64,
    pub invalidations: u64,
    pub resident_pages: usize,
    pub resident_bytes: usize,
}

impl PagingStats {
    /// Fraction of requests that did not need a fill of their own
    pub fn coalesce_rate(&self) -> f64 {
        if self.requests_seen == 0 {
            return 0.0;
        }
        (self.coalesced + self.already_resident) as f64 / self.requests_seen as f64
    }
}

struct PageRecord {
    state: PageState,
    entry: PageTableEntry,
    evictable: bool,
    bytes: usize,
    /// Last cycle the page was referenced or filled
    last_used: u64,
    /// Invalidations that arrived while the page was in flight
    deferred: Vec<Arc<dyn PageInvalidator>>,
}

impl PageRecord {
    fn requested(cycle: u64) -> Self {
        Self {
            state: PageState::Requested,
            entry: PageTableEntry::default(),
            evictable: false,
            bytes: 0,
            last_used: cycle,
            deferred: Vec::new(),
        }
    }

    fn resident(entry: PageTableEntry, evictable: bool, bytes: usize, cycle: u64) -> Self {
        Self {
            state: PageState::Resident,
            entry,
            evictable,
            bytes,
            last_used: cycle,
            deferred: Vec::new(),
        }
    }
}

#[derive(Default)]
struct PagingState {
    pages: HashMap<PageId, PageRecord>,
    cycle: u64,
    /// Pages the latest pull reported; pinned until the next pull
    current_requested: HashSet<PageId>,
    eviction_queue: Vec<PageId>,
    /// Invalidated pages to dispatch with the next pull
    reload_queue: VecDeque<PageId>,
    stats: PagingStats,
}

impl PagingState {
    fn is_pinned(&self, page_id: PageId) -> bool {
        self.current_requested.contains(&page_id)
    }

    fn is_evictable(&self, page_id: PageId) -> bool {
        match self.pages.get(&page_id) {
            Some(record) => {
                record.state == PageState::Resident && record.evictable && !self.is_pinned(page_id)
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PagingLimits {
    num_pages: u32,
    max_filled_pages: usize,
    max_stale_pages: usize,
    max_evictable_pages: usize,
    max_invalidated_pages: usize,
}

/// Residency state machine of one device.
pub struct PagingSystem {
    limits: PagingLimits,
    eviction_active: AtomicBool,
    budget: MemoryBudget,
    state: Mutex<PagingState>,
}

impl PagingSystem {
    pub fn new(options: &Options) -> Self {
        Self {
            limits: PagingLimits {
                num_pages: options.num_pages,
                max_filled_pages: options.max_filled_pages,
                max_stale_pages: options.max_stale_pages,
                max_evictable_pages: options.max_evictable_pages,
                max_invalidated_pages: options.max_invalidated_pages,
            },
            eviction_active: AtomicBool::new(options.eviction_active),
            budget: MemoryBudget::with_limit(options.max_texture_memory),
            state: Mutex::new(PagingState::default()),
        }
    }

    pub fn page_state(&self, page_id: PageId) -> PageState {
        self.state
            .lock()
            .pages
            .get(&page_id)
            .map_or(PageState::NonResident, |record| record.state)
    }

    /// Entry of a resident page
    pub fn entry(&self, page_id: PageId) -> Option<PageTableEntry> {
        self.state
            .lock()
            .pages
            .get(&page_id)
            .filter(|record| record.state == PageState::Resident)
            .map(|record| record.entry)
    }

    /// Every resident page and its entry, ordered by page id
    pub fn resident_entries(&self) -> Vec<(PageId, PageTableEntry)> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state
            .pages
            .iter()
            .filter(|(_, record)| record.state == PageState::Resident)
            .map(|(&page_id, record)| (page_id, record.entry))
            .collect();
        entries.sort_unstable_by_key(|&(page_id, _)| page_id);
        entries
    }

    /// Snapshot the resident entries and install them in `context` on
    /// `stream`. Launches enqueued afterwards see the whole snapshot.
    pub fn push_mappings(&self, stream: &Stream, context: &ContextHandle) -> Result<(), SchedulerError> {
        let mappings: Vec<(PageId, u64)> = self
            .resident_entries()
            .into_iter()
            .map(|(page_id, entry)| (page_id, entry.value()))
            .collect();
        tracing::trace!(
            stream = stream.id(),
            context = context.slot(),
            pages = mappings.len(),
            "pushing mappings"
        );

        let context = context.clone();
        stream.enqueue(move || context.lock().install_mappings(&mappings))
    }

    /// Classify one batch of device requests and return the pages to fill.
    ///
    /// `referenced` refreshes the usage signal of resident pages. Returned
    /// pages are `Requested`; reloads queued by invalidation come first.
    pub fn process_requests(&self, requested: &[PageId], referenced: &[PageId]) -> Vec<PageId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.cycle += 1;
        state.stats.cycles += 1;
        let cycle = state.cycle;

        for page_id in referenced.iter().take(self.limits.max_stale_pages) {
            if let Some(record) = state.pages.get_mut(page_id) {
                if record.state == PageState::Resident {
                    record.last_used = cycle;
                }
            }
        }

        let mut to_fill = Vec::new();
        while to_fill.len() < self.limits.max_filled_pages {
            match state.reload_queue.pop_front() {
                Some(page_id) => to_fill.push(page_id),
                None => break,
            }
        }

        state.current_requested.clear();
        let mut seen = HashSet::with_capacity(requested.len());
        for &page_id in requested {
            state.stats.requests_seen += 1;
            if page_id >= self.limits.num_pages {
                tracing::warn!(page_id, "request outside the page table ignored");
                continue;
            }
            state.current_requested.insert(page_id);
            if !seen.insert(page_id) {
                state.stats.coalesced += 1;
                continue;
            }

            match state.pages.get_mut(&page_id) {
                Some(record) if record.state == PageState::Resident => {
                    // The context was pushed before the page became resident
                    record.last_used = cycle;
                    state.stats.already_resident += 1;
                }
                Some(_) => state.stats.coalesced += 1,
                None if to_fill.len() >= self.limits.max_filled_pages => {
                    state.stats.deferred += 1;
                }
                None => {
                    state.pages.insert(page_id, PageRecord::requested(cycle));
                    to_fill.push(page_id);
                }
            }
        }

        state.stats.fills_dispatched += to_fill.len() as u64;
        self.select_eviction_candidates(state, 0);
        tracing::debug!(
            cycle,
            requested = requested.len(),
            dispatched = to_fill.len(),
            "requests processed"
        );
        to_fill
    }

    /// Move a page into `Filling`. Returns false if it was not `Requested`.
    pub fn begin_fill(&self, page_id: PageId) -> bool {
        let mut state = self.state.lock();
        match state.pages.get_mut(&page_id) {
            Some(record) if record.state == PageState::Requested => {
                record.state = PageState::Filling;
                true
            }
            _ => false,
        }
    }

    /// Publish the outcome of a fill.
    ///
    /// A filled page becomes resident; a failed one returns to
    /// `NonResident` and can be requested again. Returns pages whose storage
    /// must now be released: pages evicted to make room, a page invalidated
    /// while it was filling, or the filled page itself if nobody wants it
    /// anymore.
    pub fn complete_fill(
        &self,
        page_id: PageId,
        outcome: Result<&FilledPage, &FillError>,
    ) -> Vec<EvictedPage> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let cycle = state.cycle;
        let mut released = Vec::new();
        let mut force_pages = 0;

        match outcome {
            Ok(filled) => {
                let in_flight = matches!(
                    state.pages.get(&page_id).map(|record| record.state),
                    Some(PageState::Requested | PageState::Filling)
                );
                if in_flight {
                    let deferred = state
                        .pages
                        .insert(
                            page_id,
                            PageRecord::resident(filled.entry, filled.evictable, filled.bytes, cycle),
                        )
                        .map(|old| old.deferred)
                        .unwrap_or_default();
                    self.budget.record_allocation(filled.bytes);
                    state.stats.fills_succeeded += 1;
                    tracing::trace!(page_id, entry = filled.entry.value(), "page resident");

                    if let Some(predicate) = deferred
                        .iter()
                        .find(|predicate| predicate.should_invalidate(page_id, filled.entry))
                    {
                        let reload = predicate.reload();
                        self.invalidate_resident(state, page_id, reload, &mut released);
                    }
                } else {
                    tracing::debug!(page_id, "fill completed for a page no longer in flight");
                    released.push(EvictedPage {
                        page_id,
                        entry: filled.entry,
                    });
                }
            }
            Err(err) => {
                state.pages.remove(&page_id);
                state.stats.fills_failed += 1;
                if matches!(err, FillError::OutOfMemory(_)) {
                    force_pages = 1;
                }
                tracing::debug!(page_id, %err, "fill failed");
            }
        }

        self.select_eviction_candidates(state, force_pages);
        released.extend(self.execute_evictions(state));
        released
    }

    /// Install a client-provided entry; the page is resident immediately.
    ///
    /// Returns the entry this replaces when the page was resident with a
    /// different one; its storage must be released.
    pub fn set_page_table_entry(
        &self,
        page_id: PageId,
        evictable: bool,
        entry: PageTableEntry,
    ) -> Option<EvictedPage> {
        let mut state = self.state.lock();
        let cycle = state.cycle;
        let (bytes, replaced) = match state.pages.remove(&page_id) {
            Some(old) if old.state == PageState::Resident && old.entry == entry => (old.bytes, None),
            Some(old) if old.state == PageState::Resident => {
                self.budget.record_deallocation(old.bytes);
                let replaced = EvictedPage {
                    page_id,
                    entry: old.entry,
                };
                (0, Some(replaced))
            }
            _ => (0, None),
        };
        state
            .pages
            .insert(page_id, PageRecord::resident(entry, evictable, bytes, cycle));
        replaced
    }

    /// Apply queued invalidations, examining at most `max_invalidated_pages`
    /// pages. Ranges not finished stay in `ranges`.
    pub fn apply_invalidations(&self, ranges: &mut Vec<InvalidationRange>) -> Vec<EvictedPage> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut budget = self.limits.max_invalidated_pages;
        let mut released = Vec::new();
        let mut remaining = Vec::new();

        for mut range in ranges.drain(..) {
            if budget == 0 {
                remaining.push(range);
                continue;
            }

            let mut pages: Vec<PageId> = state
                .pages
                .keys()
                .copied()
                .filter(|&page_id| range.contains(page_id))
                .collect();
            pages.sort_unstable();

            let mut unfinished = None;
            for page_id in pages {
                if budget == 0 {
                    unfinished = Some(page_id);
                    break;
                }
                budget -= 1;

                let Some(record) = state.pages.get_mut(&page_id) else {
                    continue;
                };
                match record.state {
                    PageState::Resident => {
                        if range.predicate.should_invalidate(page_id, record.entry) {
                            let reload = range.predicate.reload();
                            self.invalidate_resident(state, page_id, reload, &mut released);
                        }
                    }
                    PageState::Requested | PageState::Filling => {
                        record.deferred.push(range.predicate.clone());
                    }
                    PageState::NonResident => {}
                }
            }

            if let Some(page_id) = unfinished {
                range.start = page_id;
                remaining.push(range);
            }
        }

        *ranges = remaining;
        released
    }

    /// Select and evict pages until resident bytes are back on target.
    pub fn evict_all_unpinned(&self) -> Vec<EvictedPage> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.select_eviction_candidates(state, 0);
        self.execute_evictions(state)
    }

    pub fn enable_eviction(&self, active: bool) {
        self.eviction_active.store(active, Ordering::Release);
        if !active {
            self.state.lock().eviction_queue.clear();
        }
    }

    pub fn is_eviction_active(&self) -> bool {
        self.eviction_active.load(Ordering::Acquire)
    }

    /// Change the resident byte budget; 0 removes the limit.
    pub fn set_max_texture_memory(&self, bytes: usize) {
        self.budget.set_total_budget(bytes);
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    pub fn stats(&self) -> PagingStats {
        let state = self.state.lock();
        let mut stats = state.stats;
        for record in state.pages.values() {
            if record.state == PageState::Resident {
                stats.resident_pages += 1;
                stats.resident_bytes += record.bytes;
            }
        }
        stats
    }

    fn invalidate_resident(
        &self,
        state: &mut PagingState,
        page_id: PageId,
        reload: bool,
        released: &mut Vec<EvictedPage>,
    ) {
        let Some(record) = state.pages.remove(&page_id) else {
            return;
        };
        self.budget.record_deallocation(record.bytes);
        state.stats.invalidations += 1;
        released.push(EvictedPage {
            page_id,
            entry: record.entry,
        });

        if reload {
            state.pages.insert(page_id, PageRecord::requested(state.cycle));
            state.reload_queue.push_back(page_id);
        }
        tracing::debug!(page_id, reload, "page invalidated");
    }

    /// Queue the least recently used unpinned pages until the queue covers
    /// the bytes over target, and at least `min_pages` pages.
    fn select_eviction_candidates(&self, state: &mut PagingState, min_pages: usize) {
        if !self.is_eviction_active() {
            return;
        }

        let queued: HashSet<PageId> = state.eviction_queue.iter().copied().collect();
        let queued_bytes: usize = queued
            .iter()
            .filter_map(|page_id| state.pages.get(page_id))
            .map(|record| record.bytes)
            .sum();
        let needed = self.budget.bytes_to_evict().saturating_sub(queued_bytes);
        let limit = self
            .limits
            .max_evictable_pages
            .saturating_sub(state.eviction_queue.len());
        if (needed == 0 && min_pages == 0) || limit == 0 {
            return;
        }

        let mut candidates: Vec<(u64, PageId, usize)> = state
            .pages
            .iter()
            .filter(|(page_id, _)| !queued.contains(*page_id) && state.is_evictable(**page_id))
            .map(|(&page_id, record)| (record.last_used, page_id, record.bytes))
            .collect();
        if candidates.len() > limit {
            candidates.select_nth_unstable_by_key(limit, |&(last_used, page_id, _)| (last_used, page_id));
            candidates.truncate(limit);
        }
        candidates.sort_unstable_by_key(|&(last_used, page_id, _)| (last_used, page_id));

        let mut freed = 0;
        for (taken, (_, page_id, bytes)) in candidates.into_iter().enumerate() {
            if freed >= needed && taken >= min_pages {
                break;
            }
            state.eviction_queue.push(page_id);
            freed += bytes;
        }
    }

    /// Evict queued pages that are still resident, evictable and unpinned.
    fn execute_evictions(&self, state: &mut PagingState) -> Vec<EvictedPage> {
        let queue = std::mem::take(&mut state.eviction_queue);
        let mut evicted = Vec::with_capacity(queue.len());
        for page_id in queue {
            if !state.is_evictable(page_id) {
                state.stats.evictions_skipped += 1;
                continue;
            }
            if let Some(record) = state.pages.remove(&page_id) {
                self.budget.record_deallocation(record.bytes);
                state.stats.evictions += 1;
                evicted.push(EvictedPage {
                    page_id,
                    entry: record.entry,
                });
            }
        }
        if !evicted.is_empty() {
            tracing::debug!(
                pages = evicted.len(),
                usage = self.budget.current_usage(),
                "pages evicted"
            );
        }
        evicted
    }
}

impl std::fmt::Debug for PagingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagingSystem")
            .field("limits", &self.limits)
            .field("eviction_active", &self.is_eviction_active())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use demand_loading_memory::DeviceContextPool;

    fn paging(max_texture_memory: usize) -> PagingSystem {
        PagingSystem::new(
            &Options::default()
                .with_num_pages(1024)
                .with_max_texture_memory(max_texture_memory),
        )
    }

    fn filled(entry: u64, bytes: usize) -> FilledPage {
        FilledPage {
            entry: PageTableEntry(entry),
            evictable: true,
            bytes,
        }
    }

    /// Run one pull cycle whose fills all succeed with `bytes` each
    fn fill_all(paging: &PagingSystem, requested: &[PageId], bytes: usize) -> Vec<EvictedPage> {
        let mut released = Vec::new();
        for page_id in paging.process_requests(requested, &[]) {
            assert!(paging.begin_fill(page_id));
            released.extend(paging.complete_fill(page_id, Ok(&filled(1000 + page_id as u64, bytes))));
        }
        released
    }

    #[test]
    fn test_duplicates_within_a_batch_coalesce() {
        let paging = paging(0);
        let to_fill = paging.process_requests(&[3, 3, 40], &[]);
        assert_eq!(to_fill, vec![3, 40]);
        assert_eq!(paging.page_state(3), PageState::Requested);

        let stats = paging.stats();
        assert_eq!(stats.requests_seen, 3);
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.fills_dispatched, 2);
    }

    #[test]
    fn test_in_flight_pages_are_not_dispatched_again() {
        let paging = paging(0);
        assert_eq!(paging.process_requests(&[7], &[]), vec![7]);
        assert!(paging.begin_fill(7));

        // Reported again by the next two launches before the fill finishes
        assert!(paging.process_requests(&[7], &[]).is_empty());
        assert_eq!(paging.process_requests(&[7, 8], &[]), vec![8]);
        assert_eq!(paging.stats().coalesced, 2);

        paging.complete_fill(7, Ok(&filled(70, 0)));
        assert_eq!(paging.entry(7), Some(PageTableEntry(70)));
        assert!(paging.process_requests(&[7], &[]).is_empty());
        assert_eq!(paging.stats().already_resident, 1);
    }

    #[test]
    fn test_failed_fill_returns_to_non_resident() {
        let paging = paging(0);
        paging.process_requests(&[5], &[]);
        paging.begin_fill(5);
        paging.complete_fill(5, Err(&FillError::Callback("unreadable".into())));

        assert_eq!(paging.page_state(5), PageState::NonResident);
        assert_eq!(paging.stats().fills_failed, 1);
        // Not cached as failed: the next request dispatches it again
        assert_eq!(paging.process_requests(&[5], &[]), vec![5]);
    }

    #[test]
    fn test_fill_limit_defers_the_rest() {
        let paging = PagingSystem::new(&Options::default().with_num_pages(64).with_max_filled_pages(2));
        assert_eq!(paging.process_requests(&[1, 2, 3, 4], &[]), vec![1, 2]);
        assert_eq!(paging.page_state(3), PageState::NonResident);
        assert_eq!(paging.stats().deferred, 2);
        assert_eq!(paging.process_requests(&[3, 4], &[]), vec![3, 4]);
    }

    #[test]
    fn test_out_of_range_requests_ignored() {
        let paging = paging(0);
        assert_eq!(paging.process_requests(&[1023, 1024, 5000], &[]), vec![1023]);
    }

    #[test]
    fn test_eviction_returns_to_target_lru_first() {
        // Target is 90% of the budget: 225 of 250 bytes
        let paging = paging(250);
        assert!(fill_all(&paging, &[1, 2], 100).is_empty());

        let released = fill_all(&paging, &[3], 100);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].page_id, 1);
        assert_eq!(released[0].entry, PageTableEntry(1001));
        assert_eq!(paging.page_state(1), PageState::NonResident);
        assert_eq!(paging.stats().resident_bytes, 200);
        assert_eq!(paging.stats().evictions, 1);
    }

    #[test]
    fn test_referenced_pages_survive_eviction() {
        let paging = paging(0);
        fill_all(&paging, &[1, 2], 100);
        fill_all(&paging, &[3, 4], 100);

        // Page 1 is referenced by a launch, making 2 the oldest
        paging.process_requests(&[], &[1]);
        paging.set_max_texture_memory(300);
        let evicted: Vec<PageId> = paging.evict_all_unpinned().iter().map(|page| page.page_id).collect();

        // 400 resident, target 270: two pages go, oldest first
        assert_eq!(evicted, vec![2, 3]);
        assert_eq!(paging.page_state(1), PageState::Resident);
    }

    #[test]
    fn test_pinned_candidate_skipped_at_execution() {
        let paging = paging(0);
        fill_all(&paging, &[1, 2], 100);
        fill_all(&paging, &[3, 4], 100);

        // Over budget at the next pull: pages 1 and 2 are queued
        paging.set_max_texture_memory(250);
        paging.process_requests(&[], &[]);

        // Page 1 is requested again before the eviction executes
        paging.process_requests(&[1], &[]);
        let evicted = paging.evict_all_unpinned();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].page_id, 2);
        assert_eq!(paging.page_state(1), PageState::Resident);
        assert_eq!(paging.stats().evictions_skipped, 1);
    }

    #[test]
    fn test_in_flight_pages_never_evicted() {
        let paging = paging(150);
        fill_all(&paging, &[1], 100);
        paging.process_requests(&[2], &[]);
        paging.begin_fill(2);

        // Completing 2 pushes usage over budget; only 1 may go
        let released = paging.complete_fill(2, Ok(&filled(2002, 100)));
        assert_eq!(released.iter().map(|page| page.page_id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(paging.page_state(2), PageState::Resident);
    }

    #[test]
    fn test_non_evictable_pages_stay() {
        let paging = paging(100);
        paging.process_requests(&[1], &[]);
        paging.begin_fill(1);
        let pinned = FilledPage {
            evictable: false,
            ..filled(11, 200)
        };
        assert!(paging.complete_fill(1, Ok(&pinned)).is_empty());
        assert_eq!(paging.page_state(1), PageState::Resident);
    }

    #[test]
    fn test_eviction_disabled() {
        let paging = paging(100);
        paging.enable_eviction(false);
        assert!(fill_all(&paging, &[1, 2, 3], 100).is_empty());
        assert_eq!(paging.stats().resident_pages, 3);

        // A pull without requests releases the pins of the last batch
        paging.process_requests(&[], &[]);
        paging.enable_eviction(true);
        assert_eq!(paging.evict_all_unpinned().len(), 3);
    }

    #[test]
    fn test_round_trip_after_eviction() {
        let paging = paging(0);
        fill_all(&paging, &[9], 64);
        paging.process_requests(&[], &[]);
        paging.set_max_texture_memory(32);
        assert_eq!(paging.evict_all_unpinned()[0].page_id, 9);
        assert_eq!(paging.entry(9), None);

        fill_all(&paging, &[9], 16);
        assert_eq!(paging.entry(9), Some(PageTableEntry(1009)));
    }

    #[test]
    fn test_out_of_memory_failure_frees_a_page() {
        let paging = paging(0);
        fill_all(&paging, &[1, 2], 100);
        paging.process_requests(&[3], &[]);
        paging.begin_fill(3);

        let err = FillError::OutOfMemory(demand_loading_memory::MemoryError::OutOfBlocks {
            pool: "device",
            requested: 2,
            available: 0,
        });
        let released = paging.complete_fill(3, Err(&err));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].page_id, 1);
    }

    #[test]
    fn test_invalidation_of_resident_pages() {
        let paging = paging(0);
        fill_all(&paging, &[1, 2, 3, 10], 8);

        let mut ranges = vec![InvalidationRange::new(
            0,
            5,
            Arc::new(|page_id: PageId, _entry: PageTableEntry| page_id != 2),
        )];
        let released = paging.apply_invalidations(&mut ranges);

        assert!(ranges.is_empty());
        let pages: Vec<PageId> = released.iter().map(|page| page.page_id).collect();
        assert_eq!(pages, vec![1, 3]);
        assert_eq!(paging.page_state(2), PageState::Resident);
        assert_eq!(paging.page_state(10), PageState::Resident);
        assert_eq!(paging.stats().invalidations, 2);
        assert_eq!(paging.budget().current_usage(), 16);
    }

    #[test]
    fn test_invalidation_with_reload() {
        let paging = paging(0);
        fill_all(&paging, &[4], 8);

        let mut ranges = vec![InvalidationRange::new(
            0,
            8,
            Arc::new(Reload(|_: PageId, _: PageTableEntry| true)),
        )];
        assert_eq!(paging.apply_invalidations(&mut ranges).len(), 1);
        assert_eq!(paging.page_state(4), PageState::Requested);

        // Dispatched with the next pull even though nobody asked
        assert_eq!(paging.process_requests(&[], &[]), vec![4]);
    }

    #[test]
    fn test_invalidation_of_filling_page_is_deferred() {
        let paging = paging(0);
        paging.process_requests(&[6], &[]);
        paging.begin_fill(6);

        let mut ranges = vec![InvalidationRange::new(
            6,
            7,
            Arc::new(|_: PageId, entry: PageTableEntry| entry == PageTableEntry(66)),
        )];
        assert!(paging.apply_invalidations(&mut ranges).is_empty());
        assert_eq!(paging.page_state(6), PageState::Filling);

        // The fill produced the stale entry: dropped as soon as it lands
        let released = paging.complete_fill(6, Ok(&filled(66, 8)));
        assert_eq!(released, vec![EvictedPage { page_id: 6, entry: PageTableEntry(66) }]);
        assert_eq!(paging.page_state(6), PageState::NonResident);
    }

    #[test]
    fn test_invalidation_budget_carries_over() {
        let paging = PagingSystem::new(
            &Options::default()
                .with_num_pages(64)
                .with_max_invalidated_pages(2),
        );
        fill_all(&paging, &[1, 2, 3, 4, 5], 0);

        let mut ranges = vec![InvalidationRange::new(
            0,
            64,
            Arc::new(|_: PageId, _: PageTableEntry| true),
        )];
        assert_eq!(paging.apply_invalidations(&mut ranges).len(), 2);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 3);

        assert_eq!(paging.apply_invalidations(&mut ranges).len(), 2);
        assert_eq!(paging.apply_invalidations(&mut ranges).len(), 1);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_set_page_table_entry() {
        let paging = paging(0);
        assert_eq!(paging.set_page_table_entry(900, false, PageTableEntry(0xdead)), None);
        assert_eq!(paging.page_state(900), PageState::Resident);
        assert_eq!(paging.entry(900), Some(PageTableEntry(0xdead)));
        assert!(paging.process_requests(&[900], &[]).is_empty());
    }

    #[test]
    fn test_set_page_table_entry_returns_replaced_storage() {
        let paging = paging(0);
        fill_all(&paging, &[12], 4096);
        assert_eq!(paging.budget().current_usage(), 4096);

        // Same entry again keeps the storage and its charge
        assert_eq!(paging.set_page_table_entry(12, true, PageTableEntry(1012)), None);
        assert_eq!(paging.stats().resident_bytes, 4096);

        let replaced = paging.set_page_table_entry(12, false, PageTableEntry(0xbeef));
        assert_eq!(
            replaced,
            Some(EvictedPage {
                page_id: 12,
                entry: PageTableEntry(1012),
            })
        );
        assert_eq!(paging.entry(12), Some(PageTableEntry(0xbeef)));
        assert_eq!(paging.budget().current_usage(), 0);
        assert_eq!(paging.stats().resident_bytes, 0);
    }

    #[test]
    fn test_push_mappings_installs_snapshot() {
        let paging = paging(0);
        fill_all(&paging, &[3, 40], 0);
        let pool = DeviceContextPool::new(1, 1024, 16, 0x1000);
        let context = pool.allocate().unwrap();
        let stream = Stream::new("test").unwrap();

        paging.push_mappings(&stream, &context).unwrap();
        stream.synchronize().unwrap();

        let mut guard = context.lock();
        assert_eq!(guard.map_or_request(3), Some(1003));
        assert_eq!(guard.map_or_request(40), Some(1040));
        assert_eq!(guard.map_or_request(41), None);
        assert_eq!(guard.requested_pages(), &[41]);
    }
}
