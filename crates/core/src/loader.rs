//! Demand page loader for one device.
//!
//! A loader owns everything a device needs to serve page requests: the
//! paging state, its device contexts, tile and staging memory, the fill
//! workers, and one handler per registered resource. The control thread
//! drives it once per launch:
//!
//! 1. [`DemandPageLoader::push_mappings`] before the launch,
//! 2. the launch looks pages up with [`DeviceContext::map_or_request`],
//! 3. [`DemandPageLoader::pull_requests`] after it, which dispatches fills
//!    and returns a [`Ticket`] without waiting for them.
//!
//! [`DeviceContext::map_or_request`]: demand_loading_memory::DeviceContext::map_or_request

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use demand_loading_memory::{
    ContextHandle, DeviceAddress, DeviceContextPool, MemoryError, MemoryPool, PageId, PoolStats,
};
use demand_loading_scheduler::{
    JobQueue, SchedulerError, Stream, TaskStatus, Ticket, WorkerPool, WorkerPoolConfig,
};

use crate::handler::{DeviceMemory, RequestHandler};
use crate::options::Options;
use crate::page_table::{PageIdRange, PageTableEntry, PageTableManager};
use crate::paging::{EvictedPage, InvalidationRange, PageInvalidator, PageState, PagingStats, PagingSystem};
use crate::retire::RetiredPages;
use crate::trace::{TraceFileWriter, TraceRecord};
use crate::{DeviceId, FillError, PagingError};

/// Offset of the tile pool within a device's address space
const TILE_POOL_OFFSET: DeviceAddress = 0x1000;
/// Offset of the staging pool within a device's address space
const STAGING_POOL_OFFSET: DeviceAddress = 1 << 40;
/// Offset of the device contexts within a device's address space
const CONTEXT_OFFSET: DeviceAddress = 1 << 42;

/// Base of a device's address space. Devices never share addresses.
fn device_base(device: DeviceId) -> DeviceAddress {
    (device as DeviceAddress + 1) << 44
}

/// Snapshot of a loader's counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoaderStats {
    pub device: DeviceId,
    pub requests_seen: u64,
    pub coalesced: u64,
    pub fills_dispatched: u64,
    pub fills_succeeded: u64,
    pub fills_failed: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub resident_pages: usize,
    pub resident_bytes: usize,
    pub device_bytes_in_use: usize,
    pub device_utilization: f64,
    pub staging_bytes_in_use: usize,
    /// Evicted pages whose storage a pushed context may still map
    pub retired_pages: usize,
    pub contexts_available: usize,
    pub pending_fills: usize,
}

struct HandlerEntry {
    range: PageIdRange,
    handler: Arc<dyn RequestHandler>,
}

/// State shared between the loader and its fill jobs
struct LoaderShared {
    device: DeviceId,
    paging: PagingSystem,
    /// Sorted by range start
    handlers: RwLock<Vec<HandlerEntry>>,
    retired: Mutex<RetiredPages>,
    failure: Mutex<Option<String>>,
}

impl LoaderShared {
    fn handler_for(&self, page_id: PageId) -> Option<Arc<dyn RequestHandler>> {
        let handlers = self.handlers.read();
        let index = handlers.partition_point(|entry| entry.range.end <= page_id);
        handlers
            .get(index)
            .filter(|entry| entry.range.contains(page_id))
            .map(|entry| entry.handler.clone())
    }

    /// Release storage of pages that lost their entry once no pushed
    /// context can map it anymore
    fn release(&self, pages: Vec<EvictedPage>) {
        let ready = self.retired.lock().retire(pages);
        self.unmap(ready);
    }

    /// Runs on the device stream once the push of `slot` taken at
    /// `through` is installed
    fn installed(&self, slot: usize, through: u64) {
        let ready = self.retired.lock().installed(slot, through);
        self.unmap(ready);
    }

    /// Hand storage back to the owning handlers
    fn unmap(&self, pages: Vec<EvictedPage>) {
        for page in pages {
            match self.handler_for(page.page_id) {
                Some(handler) => handler.unmap(page.page_id, page.entry),
                None => tracing::trace!(page_id = page.page_id, "released page has no handler"),
            }
        }
    }

    fn poison(&self, reason: &str) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            tracing::error!(device = self.device, reason, "device failure; loader disabled");
            *failure = Some(reason.to_string());
        }
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Body of one fill job
    fn fill(&self, stream: &Stream, handler: &dyn RequestHandler, page_id: PageId, ticket: &Ticket) {
        if !self.paging.begin_fill(page_id) {
            // Mapped by the client while the job was queued
            tracing::debug!(page_id, "fill skipped; page no longer requested");
            ticket.task_done(page_id as u64, TaskStatus::Succeeded);
            return;
        }

        let result = match self.failure() {
            Some(reason) => Err(FillError::Device(reason)),
            None => handler.fill_request(stream, page_id),
        };
        let status = match &result {
            Ok(_) => TaskStatus::Succeeded,
            Err(err) if err.is_fatal() => {
                self.poison(&err.to_string());
                TaskStatus::Fatal(err.to_string())
            }
            Err(err) => {
                tracing::warn!(device = self.device, page_id, %err, "fill failed");
                TaskStatus::Failed(err.to_string())
            }
        };

        let released = self.paging.complete_fill(page_id, result.as_ref());
        self.release(released);
        ticket.task_done(page_id as u64, status);
    }
}

/// Serves page requests of one device.
pub struct DemandPageLoader {
    shared: Arc<LoaderShared>,
    options: Options,
    page_table: Arc<PageTableManager>,
    contexts: DeviceContextPool,
    memory: Arc<DeviceMemory>,
    queue: Arc<JobQueue>,
    workers: Mutex<Option<WorkerPool>>,
    invalidations: Mutex<Vec<InvalidationRange>>,
    trace: Option<Arc<TraceFileWriter>>,
}

impl DemandPageLoader {
    /// Build a loader for `device` over a page table shared with the other
    /// devices of the session.
    ///
    /// # Errors
    ///
    /// Fails if the options are invalid, do not match the page table, or
    /// the fill workers cannot be started.
    pub fn new(
        device: DeviceId,
        options: Options,
        page_table: Arc<PageTableManager>,
        trace: Option<Arc<TraceFileWriter>>,
    ) -> Result<Self, PagingError> {
        options.validate()?;
        if options.num_pages != page_table.num_pages() {
            return Err(PagingError::InvalidArgument(format!(
                "options describe {} pages but the page table has {}",
                options.num_pages,
                page_table.num_pages()
            )));
        }

        let base = device_base(device);
        let memory = Arc::new(DeviceMemory::new(
            MemoryPool::with_capacity_bytes(
                "device",
                base + TILE_POOL_OFFSET,
                options.block_size,
                options.device_memory_capacity,
            ),
            MemoryPool::with_capacity_bytes(
                "staging",
                base + STAGING_POOL_OFFSET,
                options.block_size,
                options.staging_memory_capacity,
            ),
        ));
        let contexts = DeviceContextPool::new(
            options.max_active_streams,
            options.num_pages,
            options.max_requested_pages,
            base + CONTEXT_OFFSET,
        );

        let queue = Arc::new(JobQueue::new());
        let workers = WorkerPool::new(
            queue.clone(),
            WorkerPoolConfig::new(options.max_threads).with_thread_name(format!("fill-d{device}")),
        )?;
        tracing::info!(
            device,
            workers = workers.num_workers(),
            contexts = options.max_active_streams,
            "demand page loader created"
        );

        Ok(Self {
            shared: Arc::new(LoaderShared {
                device,
                paging: PagingSystem::new(&options),
                handlers: RwLock::new(Vec::new()),
                retired: Mutex::new(RetiredPages::default()),
                failure: Mutex::new(None),
            }),
            options,
            page_table,
            contexts,
            memory,
            queue,
            workers: Mutex::new(Some(workers)),
            invalidations: Mutex::new(Vec::new()),
            trace,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.shared.device
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Tile and staging memory of this device
    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    /// Route fills of `range` to `handler`.
    pub fn register_handler(&self, range: PageIdRange, handler: Arc<dyn RequestHandler>) {
        let mut handlers = self.shared.handlers.write();
        let index = handlers.partition_point(|entry| entry.range.start < range.start);
        handlers.insert(index, HandlerEntry { range, handler });
    }

    /// Reserve `num_pages` page ids without a handler.
    ///
    /// Backed pages come from the bottom of the id space, unbacked pages
    /// from the top. Entries for them are installed with
    /// [`DemandPageLoader::set_page_table_entry`].
    pub fn allocate_pages(&self, num_pages: u32, backed: bool) -> Result<PageIdRange, PagingError> {
        let reservation = self.page_table.reserve(num_pages, backed)?;
        self.record(TraceRecord::Resource {
            first_page: reservation.range.start,
            num_pages,
            backed,
            callback: false,
            evictable: false,
        });
        Ok(reservation.range)
    }

    /// Install an entry for a page the client manages itself.
    ///
    /// Storage behind an entry this replaces is released like an evicted
    /// page's.
    pub fn set_page_table_entry(
        &self,
        page_id: PageId,
        evictable: bool,
        entry: PageTableEntry,
    ) -> Result<(), PagingError> {
        self.check_page(page_id)?;
        let replaced = self.shared.paging.set_page_table_entry(page_id, evictable, entry);
        self.shared.release(replaced.into_iter().collect());
        Ok(())
    }

    /// Check out a device context for one launch.
    ///
    /// # Errors
    ///
    /// [`PagingError::ContextPoolExhausted`] when every context is in use.
    pub fn acquire_context(&self) -> Result<ContextHandle, PagingError> {
        self.contexts.allocate().map_err(|err| match err {
            MemoryError::ContextPoolExhausted { capacity } => {
                PagingError::ContextPoolExhausted { capacity }
            }
            other => PagingError::Memory(other),
        })
    }

    /// Return a context to the pool. No launch may use it afterwards.
    pub fn release_context(&self, context: &ContextHandle) {
        if self.contexts.free(context) {
            let ready = self.shared.retired.lock().release_slot(context.slot());
            self.shared.unmap(ready);
        }
    }

    /// Prepare `context` for a launch on `stream`.
    ///
    /// Applies queued invalidations, executes pending evictions, and then
    /// enqueues the installation of every resident entry on `stream`.
    /// Storage of evicted pages is released once every context that may
    /// still map it has been pushed again or released.
    pub fn push_mappings(&self, stream: &Stream, context: &ContextHandle) -> Result<(), PagingError> {
        self.check_usable()?;

        let released = {
            let mut ranges = self.invalidations.lock();
            if ranges.is_empty() {
                Vec::new()
            } else {
                self.shared.paging.apply_invalidations(&mut ranges)
            }
        };
        self.shared.release(released);
        self.shared.release(self.shared.paging.evict_all_unpinned());

        let slot = context.slot();
        let through = self.shared.retired.lock().begin_push(slot);
        self.shared
            .paging
            .push_mappings(stream, context)
            .map_err(|err| self.device_failure(err))?;
        let shared = self.shared.clone();
        stream
            .enqueue(move || shared.installed(slot, through))
            .map_err(|err| self.device_failure(err))
    }

    /// Collect the requests `context` recorded during the last launch on
    /// `stream` and dispatch fills for them.
    ///
    /// Blocks only until the request list has been copied back. The
    /// returned ticket is signaled once every dispatched fill finished.
    pub fn pull_requests(
        &self,
        stream: &Arc<Stream>,
        context: &ContextHandle,
        ticket_id: u32,
    ) -> Result<Ticket, PagingError> {
        self.check_usable()?;

        let device_context = context.clone();
        let snapshot = stream
            .enqueue_with_result(move || device_context.lock().take_requests())
            .and_then(|event| event.wait())
            .map_err(|err| self.device_failure(err))?;
        if snapshot.overflowed {
            tracing::warn!(
                device = self.device(),
                context = context.slot(),
                capacity = self.options.max_requested_pages,
                "request list overflowed; remaining pages will be requested again"
            );
        }

        self.record(TraceRecord::Requests {
            device: self.device(),
            stream: stream.id(),
            page_ids: snapshot.requested.clone(),
        });
        Ok(self.dispatch(stream, ticket_id, &snapshot.requested, &snapshot.referenced))
    }

    /// Dispatch fills for a recorded list of page ids, as if a launch on
    /// `stream` had requested them.
    pub fn replay_requests(
        &self,
        stream: &Arc<Stream>,
        ticket_id: u32,
        page_ids: &[PageId],
    ) -> Result<Ticket, PagingError> {
        self.check_usable()?;
        self.record(TraceRecord::Requests {
            device: self.device(),
            stream: stream.id(),
            page_ids: page_ids.to_vec(),
        });
        Ok(self.dispatch(stream, ticket_id, page_ids, &[]))
    }

    /// Queue invalidation of pages `[start, end)` whose entries match
    /// `predicate`. Applied at the next [`DemandPageLoader::push_mappings`].
    pub fn invalidate_page_range(
        &self,
        start: PageId,
        end: PageId,
        predicate: Arc<dyn PageInvalidator>,
    ) -> Result<(), PagingError> {
        if start > end || end > self.options.num_pages {
            return Err(PagingError::InvalidArgument(format!(
                "invalid page range [{start}, {end})"
            )));
        }
        if start < end {
            self.invalidations
                .lock()
                .push(InvalidationRange::new(start, end, predicate));
        }
        Ok(())
    }

    pub fn enable_eviction(&self, active: bool) {
        self.shared.paging.enable_eviction(active);
    }

    /// Change the resident byte budget and evict down to it right away.
    pub fn set_max_texture_memory(&self, bytes: usize) {
        self.shared.paging.set_max_texture_memory(bytes);
        self.shared.release(self.shared.paging.evict_all_unpinned());
    }

    pub fn page_state(&self, page_id: PageId) -> PageState {
        self.shared.paging.page_state(page_id)
    }

    /// Entry of a resident page
    pub fn entry(&self, page_id: PageId) -> Option<PageTableEntry> {
        self.shared.paging.entry(page_id)
    }

    pub fn paging_stats(&self) -> PagingStats {
        self.shared.paging.stats()
    }

    pub fn stats(&self) -> LoaderStats {
        let paging = self.shared.paging.stats();
        let tiles: PoolStats = self.memory.tile_stats();
        let staging: PoolStats = self.memory.staging_stats();
        LoaderStats {
            device: self.device(),
            requests_seen: paging.requests_seen,
            coalesced: paging.coalesced,
            fills_dispatched: paging.fills_dispatched,
            fills_succeeded: paging.fills_succeeded,
            fills_failed: paging.fills_failed,
            evictions: paging.evictions,
            invalidations: paging.invalidations,
            resident_pages: paging.resident_pages,
            resident_bytes: paging.resident_bytes,
            device_bytes_in_use: tiles.bytes_in_use(),
            device_utilization: tiles.utilization(),
            staging_bytes_in_use: staging.bytes_in_use(),
            retired_pages: self.shared.retired.lock().pending(),
            contexts_available: self.contexts.available(),
            pending_fills: self.queue.len(),
        }
    }

    /// The device failure that disabled this loader, if any
    pub fn device_error(&self) -> Option<String> {
        self.shared.failure()
    }

    /// Finish queued fills and stop the workers. Later pushes and pulls
    /// fail with [`PagingError::ShutDown`].
    pub fn shutdown(&self) {
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            workers.shutdown();
            tracing::info!(device = self.device(), "demand page loader shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.workers.lock().is_none()
    }

    fn dispatch(
        &self,
        stream: &Arc<Stream>,
        ticket_id: u32,
        requested: &[PageId],
        referenced: &[PageId],
    ) -> Ticket {
        let pages = self.shared.paging.process_requests(requested, referenced);
        let ticket = Ticket::new(ticket_id);
        ticket.add_tasks(pages.len());

        for page_id in pages {
            match self.shared.handler_for(page_id) {
                Some(handler) => {
                    let priority = handler.priority(page_id);
                    let shared = self.shared.clone();
                    let stream = stream.clone();
                    let ticket = ticket.clone();
                    self.queue.push(priority, move || {
                        shared.fill(&stream, handler.as_ref(), page_id, &ticket);
                    });
                }
                None => {
                    let err = FillError::UnknownPage(page_id);
                    tracing::warn!(device = self.device(), page_id, "request for a page without a handler");
                    let released = self.shared.paging.complete_fill(page_id, Err(&err));
                    self.shared.release(released);
                    ticket.task_done(page_id as u64, TaskStatus::Failed(err.to_string()));
                }
            }
        }

        ticket.seal();
        ticket
    }

    fn check_page(&self, page_id: PageId) -> Result<(), PagingError> {
        if page_id >= self.options.num_pages {
            return Err(PagingError::PageOutOfRange {
                page_id,
                num_pages: self.options.num_pages,
            });
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<(), PagingError> {
        if let Some(reason) = self.shared.failure() {
            return Err(PagingError::DeviceFailure(reason));
        }
        if self.is_shut_down() {
            return Err(PagingError::ShutDown(self.device()));
        }
        Ok(())
    }

    fn device_failure(&self, err: SchedulerError) -> PagingError {
        let reason = err.to_string();
        self.shared.poison(&reason);
        PagingError::DeviceFailure(reason)
    }

    fn record(&self, record: TraceRecord) {
        if let Some(trace) = &self.trace {
            if let Err(err) = trace.record(&record) {
                tracing::warn!(%err, path = %trace.path().display(), "failed to write trace record");
            }
        }
    }
}

impl Drop for DemandPageLoader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DemandPageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemandPageLoader")
            .field("device", &self.device())
            .field("handlers", &self.shared.handlers.read().len())
            .field("failed", &self.shared.failure().is_some())
            .finish_non_exhaustive()
    }
}
