//! Demand-loaded textures and their page layout.
//!
//! A texture occupies one contiguous page range laid out as
//! `[sampler][mip tail][level 0 tiles][level 1 tiles]...`. Tiled levels stop
//! at the first level that fits in a single tile; that level and every
//! smaller one are packed into the mip tail page.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use demand_loading_memory::PageId;

use crate::page_table::{PageIdRange, ResourceId};
use crate::source::{ImageSource, TextureInfo};
use crate::PagingError;

/// Offset of the sampler page within a texture's range
const SAMPLER_PAGE: u32 = 0;
/// Offset of the mip tail page within a texture's range
const MIP_TAIL_PAGE: u32 = 1;
/// Offset of the first tile page
const FIRST_TILE_PAGE: u32 = 2;

/// How a texture is split into pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDescriptor {
    pub tile_width: u32,
    pub tile_height: u32,
    /// Whether tile pages may be evicted. Samplers and mip tails never are.
    pub evictable_tiles: bool,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            tile_width: 64,
            tile_height: 64,
            evictable_tiles: true,
        }
    }
}

impl TextureDescriptor {
    pub fn with_tile_size(mut self, width: u32, height: u32) -> Self {
        self.tile_width = width;
        self.tile_height = height;
        self
    }

    pub fn with_evictable_tiles(mut self, evictable: bool) -> Self {
        self.evictable_tiles = evictable;
        self
    }
}

/// What a page of a texture holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexturePage {
    Sampler,
    MipTail,
    Tile { level: u32, x: u32, y: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelTiles {
    /// Page offset of the level's first tile
    first_page: u32,
    tiles_x: u32,
    tiles_y: u32,
}

/// Page layout of a texture, independent of where its range starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureLayout {
    info: TextureInfo,
    descriptor: TextureDescriptor,
    mip_tail_first_level: u32,
    levels: Vec<LevelTiles>,
    num_pages: u32,
}

impl TextureLayout {
    /// Compute the layout of a texture.
    ///
    /// # Errors
    ///
    /// [`PagingError::InvalidArgument`] for empty images, images without
    /// levels, or zero-sized tiles.
    pub fn new(info: TextureInfo, descriptor: TextureDescriptor) -> Result<Self, PagingError> {
        if info.width == 0 || info.height == 0 || info.num_mip_levels == 0 {
            return Err(PagingError::InvalidArgument(format!(
                "texture of {}x{} with {} levels has no texels",
                info.width, info.height, info.num_mip_levels
            )));
        }
        if descriptor.tile_width == 0 || descriptor.tile_height == 0 {
            return Err(PagingError::InvalidArgument(
                "tile dimensions must be positive".to_string(),
            ));
        }

        let mip_tail_first_level = if info.is_tiled {
            (0..info.num_mip_levels)
                .find(|&level| {
                    info.level_width(level) <= descriptor.tile_width
                        && info.level_height(level) <= descriptor.tile_height
                })
                .unwrap_or(info.num_mip_levels - 1)
        } else {
            0
        };

        let mut levels = Vec::with_capacity(mip_tail_first_level as usize);
        let mut next_page = FIRST_TILE_PAGE;
        for level in 0..mip_tail_first_level {
            let tiles_x = info.level_width(level).div_ceil(descriptor.tile_width);
            let tiles_y = info.level_height(level).div_ceil(descriptor.tile_height);
            levels.push(LevelTiles {
                first_page: next_page,
                tiles_x,
                tiles_y,
            });
            next_page = next_page
                .checked_add(tiles_x * tiles_y)
                .ok_or_else(|| PagingError::InvalidArgument("texture has too many tiles".to_string()))?;
        }

        Ok(Self {
            info,
            descriptor,
            mip_tail_first_level,
            levels,
            num_pages: next_page,
        })
    }

    pub fn info(&self) -> &TextureInfo {
        &self.info
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    /// Pages the texture needs, sampler and mip tail included
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// First level stored in the mip tail
    pub fn mip_tail_first_level(&self) -> u32 {
        self.mip_tail_first_level
    }

    /// Number of levels split into tiles
    pub fn num_tiled_levels(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Tiles across and down a tiled level
    pub fn tile_grid(&self, level: u32) -> Option<(u32, u32)> {
        self.levels
            .get(level as usize)
            .map(|tiles| (tiles.tiles_x, tiles.tiles_y))
    }

    /// Bytes of one tile page
    pub fn tile_bytes(&self) -> usize {
        self.descriptor.tile_width as usize
            * self.descriptor.tile_height as usize
            * self.info.format.bytes_per_pixel()
    }

    /// Bytes of the mip tail page
    pub fn mip_tail_bytes(&self) -> usize {
        (self.mip_tail_first_level..self.info.num_mip_levels)
            .map(|level| self.info.level_bytes(level))
            .sum()
    }

    /// Page offset of a tile within the texture's range
    pub fn tile_page_offset(&self, level: u32, x: u32, y: u32) -> Option<u32> {
        let tiles = self.levels.get(level as usize)?;
        if x >= tiles.tiles_x || y >= tiles.tiles_y {
            return None;
        }
        Some(tiles.first_page + y * tiles.tiles_x + x)
    }

    /// What the page at `offset` within the texture's range holds
    pub fn page_kind(&self, offset: u32) -> Option<TexturePage> {
        match offset {
            SAMPLER_PAGE => Some(TexturePage::Sampler),
            MIP_TAIL_PAGE => Some(TexturePage::MipTail),
            _ if offset >= self.num_pages => None,
            _ => {
                let level = self
                    .levels
                    .partition_point(|tiles| tiles.first_page <= offset)
                    .checked_sub(1)?;
                let tiles = &self.levels[level];
                let index = offset - tiles.first_page;
                Some(TexturePage::Tile {
                    level: level as u32,
                    x: index % tiles.tiles_x,
                    y: index / tiles.tiles_x,
                })
            }
        }
    }
}

/// Device-side description of a texture, written to its sampler page.
///
/// Serialized as ten little-endian `u32`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureSampler {
    pub texture_id: ResourceId,
    pub width: u32,
    pub height: u32,
    pub num_mip_levels: u32,
    pub mip_tail_first_level: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub bytes_per_pixel: u32,
    pub first_page: PageId,
    pub num_pages: u32,
}

impl TextureSampler {
    pub const SIZE: usize = 40;

    pub fn to_bytes(&self) -> Vec<u8> {
        [
            self.texture_id,
            self.width,
            self.height,
            self.num_mip_levels,
            self.mip_tail_first_level,
            self.tile_width,
            self.tile_height,
            self.bytes_per_pixel,
            self.first_page,
            self.num_pages,
        ]
        .iter()
        .flat_map(|field| field.to_le_bytes())
        .collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut fields = bytes[..Self::SIZE]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        let mut next = || fields.next().unwrap_or_default();
        Some(Self {
            texture_id: next(),
            width: next(),
            height: next(),
            num_mip_levels: next(),
            mip_tail_first_level: next(),
            tile_width: next(),
            tile_height: next(),
            bytes_per_pixel: next(),
            first_page: next(),
            num_pages: next(),
        })
    }
}

/// A texture registered for demand loading.
pub struct DemandTexture {
    id: ResourceId,
    range: PageIdRange,
    layout: TextureLayout,
    source: Arc<dyn ImageSource>,
}

impl DemandTexture {
    pub(crate) fn new(
        id: ResourceId,
        range: PageIdRange,
        layout: TextureLayout,
        source: Arc<dyn ImageSource>,
    ) -> Self {
        debug_assert_eq!(range.len(), layout.num_pages());
        Self {
            id,
            range,
            layout,
            source,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn page_range(&self) -> PageIdRange {
        self.range
    }

    pub fn layout(&self) -> &TextureLayout {
        &self.layout
    }

    pub fn info(&self) -> &TextureInfo {
        self.layout.info()
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        self.layout.descriptor()
    }

    pub(crate) fn source(&self) -> &Arc<dyn ImageSource> {
        &self.source
    }

    pub fn sampler_page(&self) -> PageId {
        self.range.start + SAMPLER_PAGE
    }

    pub fn mip_tail_page(&self) -> PageId {
        self.range.start + MIP_TAIL_PAGE
    }

    /// Page id of tile `(x, y)` of `level`, if that level is tiled
    pub fn tile_page_id(&self, level: u32, x: u32, y: u32) -> Option<PageId> {
        self.layout
            .tile_page_offset(level, x, y)
            .map(|offset| self.range.start + offset)
    }

    /// What `page_id` holds, if it belongs to this texture
    pub fn page_kind(&self, page_id: PageId) -> Option<TexturePage> {
        if !self.range.contains(page_id) {
            return None;
        }
        self.layout.page_kind(page_id - self.range.start)
    }

    /// The record the sampler page is filled with
    pub fn sampler(&self) -> TextureSampler {
        let info = self.layout.info();
        let descriptor = self.layout.descriptor();
        TextureSampler {
            texture_id: self.id,
            width: info.width,
            height: info.height,
            num_mip_levels: info.num_mip_levels,
            mip_tail_first_level: self.layout.mip_tail_first_level(),
            tile_width: descriptor.tile_width,
            tile_height: descriptor.tile_height,
            bytes_per_pixel: info.format.bytes_per_pixel() as u32,
            first_page: self.range.start,
            num_pages: self.range.len(),
        }
    }
}

impl std::fmt::Debug for DemandTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemandTexture")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}
