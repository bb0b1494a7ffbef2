//! Backing image sources.
//!
//! An [`ImageSource`] supplies the texel data of one texture: its
//! dimensions, individual tiles of the tiled levels, and the packed mip
//! tail. Sources are read concurrently by fill workers.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Texel formats a source can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    R8,
    Rg8,
    Rgba8,
    Rgba16F,
    Rgba32F,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::R8 => 1,
            PixelFormat::Rg8 => 2,
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgba16F => 8,
            PixelFormat::Rgba32F => 16,
        }
    }
}

/// Shape of a texture as reported by its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub num_mip_levels: u32,
    /// Whether the source can read individual tiles. Untiled sources
    /// deliver every level through the mip tail.
    pub is_tiled: bool,
}

impl TextureInfo {
    /// Tiled info with a full mip chain down to 1x1.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            num_mip_levels: Self::full_mip_levels(width, height),
            is_tiled: true,
        }
    }

    /// Number of levels in a full chain for the given base size.
    pub fn full_mip_levels(width: u32, height: u32) -> u32 {
        let largest = width.max(height).max(1);
        u32::BITS - largest.leading_zeros()
    }

    pub fn level_width(&self, level: u32) -> u32 {
        (self.width >> level.min(31)).max(1)
    }

    pub fn level_height(&self, level: u32) -> u32 {
        (self.height >> level.min(31)).max(1)
    }

    /// Bytes of one full level
    pub fn level_bytes(&self, level: u32) -> usize {
        self.level_width(level) as usize
            * self.level_height(level) as usize
            * self.format.bytes_per_pixel()
    }
}

/// Errors raised while reading a source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("tile ({x}, {y}) of level {level} is outside the image")]
    TileOutOfRange { level: u32, x: u32, y: u32 },

    #[error("level {0} does not exist")]
    LevelOutOfRange(u32),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Supplier of texel data for one texture.
pub trait ImageSource: Send + Sync {
    /// Report the texture's shape. Called once, when the texture is created.
    fn open(&self) -> Result<TextureInfo, SourceError>;

    /// Read tile `(tile_x, tile_y)` of `level` as a full
    /// `tile_width * tile_height` block; texels past the image edge are zero.
    fn read_tile(
        &self,
        level: u32,
        tile_x: u32,
        tile_y: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> Result<Vec<u8>, SourceError>;

    /// Read levels `first_level..num_mip_levels` packed back to back.
    fn read_mip_tail(
        &self,
        first_level: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> Result<Vec<u8>, SourceError>;
}

/// Procedural source used by replay and tests.
///
/// Every byte of texel `(x, y)` on `level` is [`SyntheticImageSource::texel`],
/// so a consumer can verify what it was handed.
#[derive(Debug)]
pub struct SyntheticImageSource {
    info: TextureInfo,
    tile_reads: AtomicUsize,
    mip_tail_reads: AtomicUsize,
}

impl SyntheticImageSource {
    pub fn new(info: TextureInfo) -> Self {
        Self {
            info,
            tile_reads: AtomicUsize::new(0),
            mip_tail_reads: AtomicUsize::new(0),
        }
    }

    /// Value of every byte of texel `(x, y)` on `level`
    pub fn texel(level: u32, x: u32, y: u32) -> u8 {
        ((x ^ y) as u8).wrapping_add((level as u8).wrapping_mul(37))
    }

    pub fn tile_reads(&self) -> usize {
        self.tile_reads.load(Ordering::Relaxed)
    }

    pub fn mip_tail_reads(&self) -> usize {
        self.mip_tail_reads.load(Ordering::Relaxed)
    }

    fn check_level(&self, level: u32) -> Result<(), SourceError> {
        if level >= self.info.num_mip_levels {
            return Err(SourceError::LevelOutOfRange(level));
        }
        Ok(())
    }
}

impl ImageSource for SyntheticImageSource {
    fn open(&self) -> Result<TextureInfo, SourceError> {
        Ok(self.info)
    }

    fn read_tile(
        &self,
        level: u32,
        tile_x: u32,
        tile_y: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> Result<Vec<u8>, SourceError> {
        self.check_level(level)?;
        let width = self.info.level_width(level);
        let height = self.info.level_height(level);
        let x0 = tile_x * tile_width;
        let y0 = tile_y * tile_height;
        if x0 >= width || y0 >= height {
            return Err(SourceError::TileOutOfRange {
                level,
                x: tile_x,
                y: tile_y,
            });
        }

        let bpp = self.info.format.bytes_per_pixel();
        let mut data = vec![0u8; tile_width as usize * tile_height as usize * bpp];
        for ty in 0..tile_height.min(height - y0) {
            for tx in 0..tile_width.min(width - x0) {
                let offset = (ty as usize * tile_width as usize + tx as usize) * bpp;
                data[offset..offset + bpp].fill(Self::texel(level, x0 + tx, y0 + ty));
            }
        }

        self.tile_reads.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    fn read_mip_tail(
        &self,
        first_level: u32,
        _tile_width: u32,
        _tile_height: u32,
    ) -> Result<Vec<u8>, SourceError> {
        self.check_level(first_level)?;
        let bpp = self.info.format.bytes_per_pixel();
        let mut data = Vec::new();
        for level in first_level..self.info.num_mip_levels {
            for y in 0..self.info.level_height(level) {
                for x in 0..self.info.level_width(level) {
                    data.extend(std::iter::repeat(Self::texel(level, x, y)).take(bpp));
                }
            }
        }

        self.mip_tail_reads.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }
}
