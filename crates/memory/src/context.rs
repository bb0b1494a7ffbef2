//! Device contexts and the fixed-size pool they are checked out from
//!
//! A [`DeviceContext`] is the device-resident page table state one launch
//! reads and writes: the page table itself, residence and reference bitmaps,
//! and the list of pages the launch found missing. Contexts are recycled
//! through a [`DeviceContextPool`]; a slot keeps its identity (and its base
//! device address) across allocate/free cycles.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{DeviceAddress, MemoryError, PageId};

const BITS_PER_WORD: usize = 64;

fn word_and_mask(page_id: PageId) -> (usize, u64) {
    let index = page_id as usize;
    (index / BITS_PER_WORD, 1u64 << (index % BITS_PER_WORD))
}

/// Requests and usage copied back from a context after a launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSnapshot {
    /// Pages the launch touched but found non-resident, in request order.
    /// May contain duplicates.
    pub requested: Vec<PageId>,

    /// Resident pages the launch referenced
    pub referenced: Vec<PageId>,

    /// True if the launch wanted to record more requests than fit
    pub overflowed: bool,
}

/// Device-resident page table state for one launch.
#[derive(Debug)]
pub struct DeviceContext {
    slot: usize,
    base_address: DeviceAddress,
    page_table: Vec<u64>,
    residence: Vec<u64>,
    references: Vec<u64>,
    installed: Vec<PageId>,
    requested: Vec<PageId>,
    max_requested_pages: usize,
    overflowed: bool,
}

impl DeviceContext {
    fn new(slot: usize, base_address: DeviceAddress, num_pages: u32, max_requested_pages: usize) -> Self {
        let words = (num_pages as usize).div_ceil(BITS_PER_WORD);
        Self {
            slot,
            base_address,
            page_table: vec![0; num_pages as usize],
            residence: vec![0; words],
            references: vec![0; words],
            installed: Vec::new(),
            requested: Vec::with_capacity(max_requested_pages),
            max_requested_pages,
            overflowed: false,
        }
    }

    /// Index of this context in its pool
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Device address of the context's buffers; stable across reuse
    pub fn base_address(&self) -> DeviceAddress {
        self.base_address
    }

    pub fn num_pages(&self) -> u32 {
        self.page_table.len() as u32
    }

    pub fn is_resident(&self, page_id: PageId) -> bool {
        if page_id >= self.num_pages() {
            return false;
        }
        let (word, mask) = word_and_mask(page_id);
        self.residence[word] & mask != 0
    }

    /// Page table entry for a resident page, without marking it referenced
    pub fn entry(&self, page_id: PageId) -> Option<u64> {
        self.is_resident(page_id).then(|| self.page_table[page_id as usize])
    }

    /// Device-side lookup performed by a launch.
    ///
    /// Returns the entry of a resident page and marks it referenced. A
    /// non-resident page is appended to the request list instead; requests
    /// beyond `max_requested_pages` set the overflow flag and are dropped, the
    /// launch will ask again next time.
    pub fn map_or_request(&mut self, page_id: PageId) -> Option<u64> {
        if page_id >= self.num_pages() {
            return None;
        }
        let (word, mask) = word_and_mask(page_id);
        if self.residence[word] & mask != 0 {
            self.references[word] |= mask;
            return Some(self.page_table[page_id as usize]);
        }
        if self.requested.len() < self.max_requested_pages {
            self.requested.push(page_id);
        } else {
            self.overflowed = true;
        }
        None
    }

    /// Pages requested since the last mapping push
    pub fn requested_pages(&self) -> &[PageId] {
        &self.requested
    }

    /// Pages currently installed in this context
    pub fn installed_pages(&self) -> &[PageId] {
        &self.installed
    }

    /// Replace the installed mappings and reset per-launch state.
    ///
    /// Only the previously installed pages are cleared, so the cost is
    /// proportional to the resident set rather than the page space.
    pub fn install_mappings(&mut self, mappings: &[(PageId, u64)]) {
        for page_id in std::mem::take(&mut self.installed) {
            let (word, mask) = word_and_mask(page_id);
            self.residence[word] &= !mask;
            self.references[word] &= !mask;
            self.page_table[page_id as usize] = 0;
        }

        for &(page_id, entry) in mappings {
            if page_id >= self.num_pages() {
                continue;
            }
            let (word, mask) = word_and_mask(page_id);
            self.residence[word] |= mask;
            self.page_table[page_id as usize] = entry;
            self.installed.push(page_id);
        }

        self.requested.clear();
        self.overflowed = false;
    }

    /// Copy back requests and reference bits, clearing both.
    pub fn take_requests(&mut self) -> RequestSnapshot {
        let mut referenced = Vec::new();
        for &page_id in &self.installed {
            let (word, mask) = word_and_mask(page_id);
            if self.references[word] & mask != 0 {
                self.references[word] &= !mask;
                referenced.push(page_id);
            }
        }

        RequestSnapshot {
            requested: std::mem::take(&mut self.requested),
            referenced,
            overflowed: std::mem::replace(&mut self.overflowed, false),
        }
    }
}

/// A checked-out device context.
///
/// Cloning the handle does not check out a second context; both clones
/// refer to the same pool slot.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    slot: usize,
    context: Arc<Mutex<DeviceContext>>,
}

impl ContextHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Lock the context for host or device-side access
    pub fn lock(&self) -> MutexGuard<'_, DeviceContext> {
        self.context.lock()
    }

    /// Check whether two handles refer to the same context object
    pub fn same_context(&self, other: &ContextHandle) -> bool {
        Arc::ptr_eq(&self.context, &other.context)
    }

    pub fn base_address(&self) -> DeviceAddress {
        self.context.lock().base_address()
    }
}

struct PoolState {
    free_slots: Vec<usize>,
    checked_out: Vec<bool>,
}

/// Fixed-size pool of device contexts.
///
/// # Example
///
/// ```
/// use demand_loading_memory::DeviceContextPool;
///
/// let pool = DeviceContextPool::new(2, 1024, 64, 0x4000_0000);
/// let a = pool.allocate().unwrap();
/// let b = pool.allocate().unwrap();
/// assert!(!a.same_context(&b));
/// assert!(pool.allocate().is_err());
///
/// pool.free(&a);
/// let again = pool.allocate().unwrap();
/// assert!(again.same_context(&a));
/// ```
pub struct DeviceContextPool {
    contexts: Vec<Arc<Mutex<DeviceContext>>>,
    state: Mutex<PoolState>,
}

impl DeviceContextPool {
    /// Create `capacity` contexts covering `num_pages` pages each.
    ///
    /// Context buffers are laid out from `base_address`, one context after the
    /// other, so every slot owns a distinct and stable address range.
    pub fn new(
        capacity: usize,
        num_pages: u32,
        max_requested_pages: usize,
        base_address: DeviceAddress,
    ) -> Self {
        let stride = context_footprint(num_pages, max_requested_pages);
        let contexts = (0..capacity)
            .map(|slot| {
                let address = base_address + (slot as DeviceAddress) * stride;
                Arc::new(Mutex::new(DeviceContext::new(slot, address, num_pages, max_requested_pages)))
            })
            .collect();

        Self {
            contexts,
            state: Mutex::new(PoolState {
                // Popped from the back, so slot 0 goes out first
                free_slots: (0..capacity).rev().collect(),
                checked_out: vec![false; capacity],
            }),
        }
    }

    /// Check out a free context.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ContextPoolExhausted`] when every context is in
    /// use; the pool never grows.
    pub fn allocate(&self) -> Result<ContextHandle, MemoryError> {
        let mut state = self.state.lock();
        let Some(slot) = state.free_slots.pop() else {
            tracing::warn!(capacity = self.contexts.len(), "device context pool exhausted");
            return Err(MemoryError::ContextPoolExhausted { capacity: self.contexts.len() });
        };
        state.checked_out[slot] = true;
        Ok(ContextHandle {
            slot,
            context: self.contexts[slot].clone(),
        })
    }

    /// Return a context to the pool. Freeing a slot that is not checked out
    /// is ignored and returns false.
    pub fn free(&self, handle: &ContextHandle) -> bool {
        let mut state = self.state.lock();
        let owned = self
            .contexts
            .get(handle.slot)
            .is_some_and(|context| Arc::ptr_eq(context, &handle.context));
        if !owned || !state.checked_out[handle.slot] {
            tracing::warn!(slot = handle.slot, "ignoring free of a context that is not checked out");
            return false;
        }
        state.checked_out[handle.slot] = false;
        state.free_slots.push(handle.slot);
        true
    }

    pub fn capacity(&self) -> usize {
        self.contexts.len()
    }

    /// Number of contexts that can still be allocated
    pub fn available(&self) -> usize {
        self.state.lock().free_slots.len()
    }
}

/// Bytes of device memory one context occupies: page table, two bitmaps and
/// the request list, rounded up to 256 bytes.
fn context_footprint(num_pages: u32, max_requested_pages: usize) -> DeviceAddress {
    let pages = num_pages as usize;
    let bitmap_bytes = pages.div_ceil(BITS_PER_WORD) * 8;
    let bytes = pages * 8 + 2 * bitmap_bytes + max_requested_pages * 4;
    bytes.div_ceil(256) as DeviceAddress * 256
}
