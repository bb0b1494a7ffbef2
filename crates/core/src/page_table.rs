//! Page id allocation.
//!
//! The page id space `[0, num_pages)` is shared by every device of a session.
//! Backed ranges (pages filled by a request handler) are handed out upward
//! from 0, unbacked ranges (pages whose entries the client installs itself)
//! downward from `num_pages`. Ranges are never reused.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use demand_loading_memory::PageId;

use crate::PagingError;

/// Identifier of the resource that owns a page range
pub type ResourceId = u32;

/// Opaque value a device looks up for a resident page.
///
/// For backed pages it is the device address of the page's data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for PageTableEntry {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Half-open range of page ids `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageIdRange {
    pub start: PageId,
    pub end: PageId,
}

impl PageIdRange {
    pub fn new(start: PageId, end: PageId) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        page_id >= self.start && page_id < self.end
    }

    pub fn iter(&self) -> std::ops::Range<PageId> {
        self.start..self.end
    }
}

/// A range handed to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub resource: ResourceId,
    pub range: PageIdRange,
    pub backed: bool,
}

#[derive(Debug)]
struct PageTableState {
    /// First free page of the backed region
    next_backed: PageId,
    /// One past the last free page of the unbacked region
    next_unbacked: PageId,
    next_resource: ResourceId,
    /// Sorted by range start
    reservations: Vec<Reservation>,
}

/// Hands out disjoint page id ranges.
///
/// # Example
///
/// ```
/// use demand_loading_core::PageTableManager;
///
/// let manager = PageTableManager::new(1024);
/// let texture = manager.reserve(16, true).unwrap();
/// let scratch = manager.reserve(8, false).unwrap();
///
/// assert_eq!(texture.range.start, 0);
/// assert_eq!(scratch.range.end, 1024);
/// assert_eq!(manager.resource_for(3), Some(texture));
/// ```
#[derive(Debug)]
pub struct PageTableManager {
    num_pages: u32,
    state: Mutex<PageTableState>,
}

impl PageTableManager {
    pub fn new(num_pages: u32) -> Self {
        Self {
            num_pages,
            state: Mutex::new(PageTableState {
                next_backed: 0,
                next_unbacked: num_pages,
                next_resource: 0,
                reservations: Vec::new(),
            }),
        }
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Pages not yet reserved by either region
    pub fn available(&self) -> u32 {
        let state = self.state.lock();
        state.next_unbacked - state.next_backed
    }

    /// Reserve `count` contiguous pages.
    ///
    /// # Errors
    ///
    /// [`PagingError::InvalidArgument`] for an empty request and
    /// [`PagingError::PageSpaceExhausted`] when the backed and unbacked
    /// regions would overlap.
    pub fn reserve(&self, count: u32, backed: bool) -> Result<Reservation, PagingError> {
        if count == 0 {
            return Err(PagingError::InvalidArgument(
                "cannot reserve an empty page range".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let available = state.next_unbacked - state.next_backed;
        if count > available {
            tracing::warn!(count, available, "page id space exhausted");
            return Err(PagingError::PageSpaceExhausted {
                requested: count,
                available,
            });
        }

        let range = if backed {
            let start = state.next_backed;
            state.next_backed += count;
            PageIdRange::new(start, start + count)
        } else {
            let end = state.next_unbacked;
            state.next_unbacked -= count;
            PageIdRange::new(end - count, end)
        };

        let reservation = Reservation {
            resource: state.next_resource,
            range,
            backed,
        };
        state.next_resource += 1;

        let index = state
            .reservations
            .partition_point(|r| r.range.start < range.start);
        state.reservations.insert(index, reservation);

        tracing::debug!(
            resource = reservation.resource,
            start = range.start,
            end = range.end,
            backed,
            "reserved page range"
        );
        Ok(reservation)
    }

    /// Find the reservation containing `page_id`.
    pub fn resource_for(&self, page_id: PageId) -> Option<Reservation> {
        let state = self.state.lock();
        let index = state
            .reservations
            .partition_point(|r| r.range.end <= page_id);
        state
            .reservations
            .get(index)
            .filter(|r| r.range.contains(page_id))
            .copied()
    }

    /// Every reservation, ordered by first page
    pub fn reservations(&self) -> Vec<Reservation> {
        self.state.lock().reservations.clone()
    }
}
