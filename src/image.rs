//! The [DecodedImage] type every tier of the cache stores and returns.
//!
//! Pixels are always 4 bytes each, 8 bits per channel, premultiplied alpha first (ARGB), device RGB.  Nothing in this
//! crate negotiates another layout.
use std::convert::TryFrom;
use std::fmt;

use memmap2::Mmap;

use crate::codec::{CodecError, HEADER_LEN};

/// Bytes per pixel of the one pixel format this crate understands.
pub const BYTES_PER_PIXEL: u64 = 4;

/// Compute `width * height * 4`, or `None` if that doesn't fit in a `usize`.
pub(crate) fn pixel_len(width: u32, height: u32) -> Option<usize> {
    let len = (width as u64)
        .checked_mul(height as u64)?
        .checked_mul(BYTES_PER_PIXEL)?;
    usize::try_from(len).ok()
}

/// Backing storage for the pixels of a [DecodedImage].
///
/// Images fresh from an [ImageSource](crate::ImageSource) own a `Vec`.  Images read back from disk own the file
/// mapping itself, so the mapping stays valid for exactly as long as the image does.
pub enum PixelBuffer {
    Owned(Vec<u8>),
    /// A mapped cache file.  The pixels are `map[HEADER_LEN..HEADER_LEN + len]`.
    ///
    /// The file must not be truncated in place while this is alive, or reading the pixels raises `SIGBUS`.  This crate
    /// never does that, but a process editing the cache directory by hand can.
    Mapped { map: Mmap, len: usize },
}

impl PixelBuffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            PixelBuffer::Owned(v) => &v[..],
            PixelBuffer::Mapped { map, len } => &map[HEADER_LEN..HEADER_LEN + *len],
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, PixelBuffer::Mapped { .. })
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_mapped() { "Mapped" } else { "Owned" };
        f.debug_struct("PixelBuffer")
            .field("kind", &kind)
            .field("len", &self.as_slice().len())
            .finish()
    }
}

/// A decoded raster image: dimensions plus exactly `width * height * 4` bytes of pixels.
#[derive(Debug)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    pixels: PixelBuffer,
}

impl DecodedImage {
    /// Build an image over an owned pixel buffer, validating the length against the dimensions.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<DecodedImage, CodecError> {
        let expected = pixel_len(width, height).ok_or(CodecError::TooLarge { width, height })?;
        if expected == 0 {
            return Err(CodecError::EmptyImage);
        }
        if pixels.len() != expected {
            return Err(CodecError::BufferMismatch {
                expected,
                actual: pixels.len(),
            });
        }

        Ok(DecodedImage {
            width,
            height,
            pixels: PixelBuffer::Owned(pixels),
        })
    }

    /// Wrap a validated mapping.  The codec is the only caller, and has already checked the length.
    pub(crate) fn from_mapping(width: u32, height: u32, map: Mmap, len: usize) -> DecodedImage {
        debug_assert!(map.len() >= HEADER_LEN + len);
        DecodedImage {
            width,
            height,
            pixels: PixelBuffer::Mapped { map, len },
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.pixels
    }

    /// Copy the pixels out into a buffer the caller owns, independent of any file mapping.
    pub fn to_owned_pixels(&self) -> Vec<u8> {
        self.pixels().to_vec()
    }

    /// The cost of this image in the memory tier, in bytes.
    pub fn cost(&self) -> u64 {
        self.width as u64 * self.height as u64 * BYTES_PER_PIXEL
    }
}

impl PartialEq for DecodedImage {
    fn eq(&self, other: &DecodedImage) -> bool {
        self.width == other.width && self.height == other.height && self.pixels() == other.pixels()
    }
}

impl Eq for DecodedImage {}
