//! Request handlers: the code that produces a page's data.
//!
//! Each registered resource gets one handler per device. Fill workers call
//! [`RequestHandler::fill_request`] concurrently for different pages of the
//! same handler, never twice at once for the same page.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use demand_loading_memory::{DeviceAddress, MemoryBlock, MemoryError, MemoryPool, PageId, PoolStats};
use demand_loading_scheduler::{JobPriority, Stream};

use crate::page_table::{PageIdRange, PageTableEntry};
use crate::texture::{DemandTexture, TexturePage};
use crate::FillError;

/// Outcome of a successful fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilledPage {
    pub entry: PageTableEntry,
    pub evictable: bool,
    /// Device bytes held by the page, counted against the texture budget
    pub bytes: usize,
}

/// Produces the data for pages of one resource.
pub trait RequestHandler: Send + Sync {
    /// Load `page_id` and return its entry. Device work goes on `stream`.
    fn fill_request(&self, stream: &Stream, page_id: PageId) -> Result<FilledPage, FillError>;

    /// Release whatever backs an evicted page.
    fn unmap(&self, _page_id: PageId, _entry: PageTableEntry) {}

    /// Order of the page's fill relative to others
    fn priority(&self, _page_id: PageId) -> JobPriority {
        JobPriority::Normal
    }
}

/// Device memory of one loader: tile storage and the staging area uploads
/// pass through.
#[derive(Debug)]
pub struct DeviceMemory {
    pub tiles: MemoryPool,
    pub staging: MemoryPool,
}

impl DeviceMemory {
    pub fn new(tiles: MemoryPool, staging: MemoryPool) -> Self {
        Self { tiles, staging }
    }

    /// Copy `data` into freshly allocated device memory.
    ///
    /// The bytes are written to a staging block, the staging-to-device copy
    /// is enqueued on `stream`, and the call returns once that copy has
    /// executed. Both blocks are released again on failure.
    pub fn upload(self: &Arc<Self>, stream: &Stream, data: &[u8]) -> Result<MemoryBlock, FillError> {
        let staging = self.staging.allocate(data.len())?;
        let device = match self.tiles.allocate(data.len()) {
            Ok(block) => block,
            Err(err) => {
                self.release_staging(&staging);
                return Err(err.into());
            }
        };

        let copied = self
            .staging
            .write(&staging, 0, data)
            .map_err(FillError::from)
            .and_then(|()| {
                let memory = self.clone();
                let (dst, src) = (device, staging);
                let event = stream.enqueue_with_result(move || {
                    memory.tiles.copy_from(&dst, &memory.staging, &src)
                })?;
                event.wait()?.map_err(|err: MemoryError| FillError::Device(err.to_string()))
            });

        self.release_staging(&staging);
        match copied {
            Ok(()) => Ok(device),
            Err(err) => {
                self.release(&device);
                Err(err)
            }
        }
    }

    /// Return a device block to the tile pool.
    pub fn release(&self, block: &MemoryBlock) {
        if let Err(err) = self.tiles.free(block) {
            tracing::warn!(%err, "failed to release device block");
        }
    }

    fn release_staging(&self, block: &MemoryBlock) {
        if let Err(err) = self.staging.free(block) {
            tracing::warn!(%err, "failed to release staging block");
        }
    }

    /// Read back `len` bytes at a device address.
    pub fn read(&self, address: DeviceAddress, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.tiles.read_at(address, len)
    }

    pub fn tile_stats(&self) -> PoolStats {
        self.tiles.stats()
    }

    pub fn staging_stats(&self) -> PoolStats {
        self.staging.stats()
    }
}

/// Device blocks owned by a handler, by the address their entry points at.
///
/// A page can be filled again while the block of its evicted entry still
/// waits for release, so blocks are not keyed by page id.
#[derive(Debug, Default)]
struct BlockTable {
    blocks: Mutex<HashMap<DeviceAddress, MemoryBlock>>,
}

impl BlockTable {
    /// Record `block` and return the bytes it holds.
    fn insert(&self, memory: &DeviceMemory, block: MemoryBlock) -> usize {
        if let Some(stale) = self.blocks.lock().insert(block.address(), block) {
            tracing::warn!(address = stale.address(), "device block handed out twice");
        }
        block.block_count() * memory.tiles.block_size()
    }

    fn release(&self, memory: &DeviceMemory, page_id: PageId, entry: PageTableEntry) {
        match self.blocks.lock().remove(&entry.value()) {
            Some(block) => memory.release(&block),
            None => tracing::warn!(page_id, entry = entry.value(), "unmap of a page without device storage"),
        }
    }

    fn len(&self) -> usize {
        self.blocks.lock().len()
    }
}

/// Fills the first page of a texture with its [`crate::TextureSampler`].
pub struct SamplerRequestHandler {
    texture: Arc<DemandTexture>,
    memory: Arc<DeviceMemory>,
    blocks: BlockTable,
}

impl SamplerRequestHandler {
    pub fn new(texture: Arc<DemandTexture>, memory: Arc<DeviceMemory>) -> Self {
        Self {
            texture,
            memory,
            blocks: BlockTable::default(),
        }
    }
}

impl RequestHandler for SamplerRequestHandler {
    fn fill_request(&self, stream: &Stream, page_id: PageId) -> Result<FilledPage, FillError> {
        if page_id != self.texture.sampler_page() {
            return Err(FillError::UnknownPage(page_id));
        }

        let block = self.memory.upload(stream, &self.texture.sampler().to_bytes())?;
        let filled = FilledPage {
            entry: PageTableEntry(block.address()),
            evictable: false,
            bytes: self.blocks.insert(&self.memory, block),
        };
        tracing::trace!(texture = self.texture.id(), page_id, "sampler filled");
        Ok(filled)
    }

    fn unmap(&self, page_id: PageId, entry: PageTableEntry) {
        self.blocks.release(&self.memory, page_id, entry);
    }

    fn priority(&self, _page_id: PageId) -> JobPriority {
        JobPriority::High
    }
}

/// Fills the mip tail and tile pages of a texture from its image source.
pub struct TextureRequestHandler {
    texture: Arc<DemandTexture>,
    memory: Arc<DeviceMemory>,
    blocks: BlockTable,
}

impl TextureRequestHandler {
    pub fn new(texture: Arc<DemandTexture>, memory: Arc<DeviceMemory>) -> Self {
        Self {
            texture,
            memory,
            blocks: BlockTable::default(),
        }
    }

    fn read_page(&self, page_id: PageId, kind: TexturePage) -> Result<(Vec<u8>, bool), FillError> {
        let layout = self.texture.layout();
        let descriptor = layout.descriptor();
        let source = self.texture.source();
        match kind {
            TexturePage::MipTail => {
                let data = source.read_mip_tail(
                    layout.mip_tail_first_level(),
                    descriptor.tile_width,
                    descriptor.tile_height,
                )?;
                Ok((data, false))
            }
            TexturePage::Tile { level, x, y } => {
                let data = source.read_tile(level, x, y, descriptor.tile_width, descriptor.tile_height)?;
                Ok((data, descriptor.evictable_tiles))
            }
            TexturePage::Sampler => Err(FillError::UnknownPage(page_id)),
        }
    }
}

impl RequestHandler for TextureRequestHandler {
    fn fill_request(&self, stream: &Stream, page_id: PageId) -> Result<FilledPage, FillError> {
        let kind = self
            .texture
            .page_kind(page_id)
            .ok_or(FillError::UnknownPage(page_id))?;

        let (data, evictable) = self.read_page(page_id, kind)?;
        let block = self.memory.upload(stream, &data)?;
        let filled = FilledPage {
            entry: PageTableEntry(block.address()),
            evictable,
            bytes: self.blocks.insert(&self.memory, block),
        };
        tracing::trace!(texture = self.texture.id(), page_id, ?kind, "texture page filled");
        Ok(filled)
    }

    fn unmap(&self, page_id: PageId, entry: PageTableEntry) {
        self.blocks.release(&self.memory, page_id, entry);
    }

    fn priority(&self, page_id: PageId) -> JobPriority {
        match self.texture.page_kind(page_id) {
            Some(TexturePage::Tile { .. }) => JobPriority::Low,
            _ => JobPriority::High,
        }
    }
}

/// Callback filling one page of a generic resource.
///
/// Receives the stream and the page's index within the resource and
/// returns the entry to install.
pub type ResourceCallback =
    Arc<dyn Fn(&Stream, u32) -> Result<PageTableEntry, FillError> + Send + Sync>;

/// Fills pages of a generic resource through a user callback.
pub struct ResourceRequestHandler {
    range: PageIdRange,
    callback: ResourceCallback,
    evictable: bool,
}

impl ResourceRequestHandler {
    pub fn new(range: PageIdRange, callback: ResourceCallback, evictable: bool) -> Self {
        Self {
            range,
            callback,
            evictable,
        }
    }
}

impl RequestHandler for ResourceRequestHandler {
    fn fill_request(&self, stream: &Stream, page_id: PageId) -> Result<FilledPage, FillError> {
        if !self.range.contains(page_id) {
            return Err(FillError::UnknownPage(page_id));
        }
        let entry = (self.callback)(stream, page_id - self.range.start)?;
        Ok(FilledPage {
            entry,
            evictable: self.evictable,
            bytes: 0,
        })
    }
}
