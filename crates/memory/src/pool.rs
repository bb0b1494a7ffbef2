//! Block arena for device tile storage and pinned staging buffers
//!
//! Memory is handed out in spans of fixed-size blocks. Backing storage grows
//! lazily up to a hard capacity, so a pool sized for gigabytes costs nothing
//! until pages are actually filled.

use parking_lot::Mutex;

use crate::{DeviceAddress, MemoryError};

/// A span of contiguous blocks allocated from a [`MemoryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryBlock {
    address: DeviceAddress,
    first_block: usize,
    block_count: usize,
    len: usize,
}

impl MemoryBlock {
    /// Device address of the first byte of the span
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Number of bytes requested at allocation time
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pool blocks covered by this span
    pub fn block_count(&self) -> usize {
        self.block_count
    }
}

/// Statistics about memory pool usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Size of one block in bytes
    pub block_size: usize,

    /// Maximum number of blocks the pool may hand out
    pub capacity_blocks: usize,

    /// Blocks currently allocated
    pub blocks_in_use: usize,

    /// High-water mark of `blocks_in_use`
    pub peak_blocks_in_use: usize,

    /// Successful allocations
    pub allocations: u64,

    /// Blocks spans returned to the pool
    pub frees: u64,

    /// Allocations rejected because no span was available
    pub failed_allocations: u64,
}

impl PoolStats {
    /// Calculate block utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity_blocks == 0 {
            0.0
        } else {
            self.blocks_in_use as f64 / self.capacity_blocks as f64
        }
    }

    /// Bytes currently allocated, rounded up to whole blocks
    pub fn bytes_in_use(&self) -> usize {
        self.blocks_in_use * self.block_size
    }
}

struct PoolState {
    /// Backing bytes for every block up to `used.len()`
    storage: Vec<u8>,

    /// Allocation flag per block that has ever been touched
    used: Vec<bool>,

    stats: PoolStats,
}

impl PoolState {
    /// First-fit search for `count` free blocks, growing the block table
    /// when the tail of the table plus fresh blocks can satisfy the request.
    fn find_span(&mut self, count: usize, capacity: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for (index, used) in self.used.iter().enumerate() {
            if *used {
                run_len = 0;
                run_start = index + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }

        // `run_len` is now the length of the free tail of the table.
        let missing = count - run_len;
        if self.used.len() + missing > capacity {
            return None;
        }
        self.used.resize(self.used.len() + missing, false);
        Some(run_start)
    }

    fn free_blocks(&self) -> usize {
        self.stats.capacity_blocks - self.stats.blocks_in_use
    }
}

/// Fixed-block memory pool.
///
/// Thread-safe; all bookkeeping sits behind a single mutex. Addresses handed
/// out are `base_address + block_index * block_size` and are never zero, so a
/// zero page-table entry can always mean "not resident".
///
/// # Example
///
/// ```
/// use demand_loading_memory::MemoryPool;
///
/// let pool = MemoryPool::new("tiles", 0x1000_0000, 256, 16);
/// let block = pool.allocate(300).unwrap(); // spans two blocks
/// pool.write(&block, 0, &[7u8; 300]).unwrap();
/// assert_eq!(pool.read(&block).unwrap()[299], 7);
/// pool.free(&block).unwrap();
/// ```
pub struct MemoryPool {
    name: &'static str,
    base_address: DeviceAddress,
    block_size: usize,
    capacity_blocks: usize,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    /// Create a pool of `capacity_blocks` blocks of `block_size` bytes each.
    ///
    /// `base_address` must be non-zero; it lets several pools share one
    /// device address space without overlapping.
    pub fn new(
        name: &'static str,
        base_address: DeviceAddress,
        block_size: usize,
        capacity_blocks: usize,
    ) -> Self {
        debug_assert!(base_address != 0, "device address 0 is reserved");
        debug_assert!(block_size > 0);
        Self {
            name,
            base_address,
            block_size,
            capacity_blocks,
            state: Mutex::new(PoolState {
                storage: Vec::new(),
                used: Vec::new(),
                stats: PoolStats {
                    block_size,
                    capacity_blocks,
                    ..Default::default()
                },
            }),
        }
    }

    /// Create a pool sized to hold at least `capacity_bytes`.
    pub fn with_capacity_bytes(
        name: &'static str,
        base_address: DeviceAddress,
        block_size: usize,
        capacity_bytes: usize,
    ) -> Self {
        Self::new(name, base_address, block_size, capacity_bytes.div_ceil(block_size))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn base_address(&self) -> DeviceAddress {
        self.base_address
    }

    /// One past the highest address this pool can ever hand out.
    pub fn end_address(&self) -> DeviceAddress {
        self.base_address + (self.capacity_blocks * self.block_size) as DeviceAddress
    }

    /// Check whether an address falls inside this pool's address range
    pub fn contains_address(&self, address: DeviceAddress) -> bool {
        address >= self.base_address && address < self.end_address()
    }

    /// Allocate a span large enough for `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfBlocks`] when no contiguous span of the
    /// required size is free. The pool never grows beyond its capacity.
    pub fn allocate(&self, len: usize) -> Result<MemoryBlock, MemoryError> {
        if len == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let count = len.div_ceil(self.block_size);

        let mut state = self.state.lock();
        let Some(first_block) = state.find_span(count, self.capacity_blocks) else {
            state.stats.failed_allocations += 1;
            let available = state.free_blocks();
            tracing::debug!(pool = self.name, requested = count, available, "memory pool exhausted");
            return Err(MemoryError::OutOfBlocks {
                pool: self.name,
                requested: count,
                available,
            });
        };

        for used in &mut state.used[first_block..first_block + count] {
            *used = true;
        }
        let required_bytes = state.used.len() * self.block_size;
        if state.storage.len() < required_bytes {
            state.storage.resize(required_bytes, 0);
        }

        state.stats.allocations += 1;
        state.stats.blocks_in_use += count;
        state.stats.peak_blocks_in_use = state.stats.peak_blocks_in_use.max(state.stats.blocks_in_use);

        Ok(MemoryBlock {
            address: self.base_address + (first_block * self.block_size) as DeviceAddress,
            first_block,
            block_count: count,
            len,
        })
    }

    /// Return a span to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidBlock`] if the span was not allocated
    /// from this pool or has already been freed.
    pub fn free(&self, block: &MemoryBlock) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        let range = block.first_block..block.first_block + block.block_count;
        let owned = self.contains_address(block.address)
            && range.end <= state.used.len()
            && state.used[range.clone()].iter().all(|used| *used);
        if !owned {
            return Err(MemoryError::InvalidBlock {
                pool: self.name,
                address: block.address,
            });
        }

        for used in &mut state.used[range] {
            *used = false;
        }
        state.stats.blocks_in_use -= block.block_count;
        state.stats.frees += 1;
        Ok(())
    }

    /// Copy `data` into a block at `offset`.
    pub fn write(&self, block: &MemoryBlock, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if !self.contains_address(block.address) {
            return Err(MemoryError::InvalidBlock { pool: self.name, address: block.address });
        }
        check_bounds(offset, data.len(), block.len)?;
        let start = self.byte_offset(block) + offset;
        let mut state = self.state.lock();
        let capacity = state.storage.len();
        let target = state
            .storage
            .get_mut(start..start + data.len())
            .ok_or(MemoryError::OutOfBounds { offset: start, len: data.len(), capacity })?;
        target.copy_from_slice(data);
        Ok(())
    }

    /// Read the full contents of a block.
    pub fn read(&self, block: &MemoryBlock) -> Result<Vec<u8>, MemoryError> {
        self.read_at(block.address, block.len)
    }

    /// Read `len` bytes starting at a device address.
    ///
    /// This is the device-side view used when dereferencing a page table
    /// entry; it only checks that the bytes lie inside storage the pool has
    /// handed out at some point.
    pub fn read_at(&self, address: DeviceAddress, len: usize) -> Result<Vec<u8>, MemoryError> {
        if !self.contains_address(address) {
            return Err(MemoryError::InvalidBlock { pool: self.name, address });
        }
        let start = (address - self.base_address) as usize;
        let state = self.state.lock();
        check_bounds(start, len, state.storage.len())?;
        Ok(state.storage[start..start + len].to_vec())
    }

    /// Copy the contents of `src` (owned by `src_pool`) into `dst`.
    ///
    /// The two pool locks are never held at the same time.
    pub fn copy_from(
        &self,
        dst: &MemoryBlock,
        src_pool: &MemoryPool,
        src: &MemoryBlock,
    ) -> Result<(), MemoryError> {
        let bytes = src_pool.read(src)?;
        self.write(dst, 0, &bytes)
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    fn byte_offset(&self, block: &MemoryBlock) -> usize {
        block.first_block * self.block_size
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .field("block_size", &self.block_size)
            .field("capacity_blocks", &self.capacity_blocks)
            .field("stats", &self.stats())
            .finish()
    }
}

fn check_bounds(offset: usize, len: usize, capacity: usize) -> Result<(), MemoryError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(MemoryError::OutOfBounds { offset, len, capacity }),
    }
}
