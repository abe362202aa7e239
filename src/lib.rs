//! A two-tier cache for decoded raster images.
//!
//! Decoding a PNG or JPEG every time an image is shown is slow, and keeping every decoded image around forever uses
//! far too much memory.  This crate sits in front of whatever decodes your original assets (an [ImageSource]) and
//! answers lookups from the cheapest place that has the image:
//!
//! - A [MemoryStore] holding recently used images, bounded by the total size of their pixels and evicting least
//!   recently used images first.
//! - A [DiskStore] holding one pre-decoded raw pixel file per image.  Reading one back is a memory map plus an 8 byte
//!   header check, with no decoding and no copy.
//! - The [ImageSource] itself, as a last resort.  Whatever it produces is kept in memory straight away and written to
//!   disk on a background thread.
//!
//! Every image uses the same pixel format: 4 bytes per pixel, 8 bits per channel, premultiplied alpha first, device
//! RGB.  See [codec] for the file layout.
//!
//! To use this crate, implement [ImageSource], build a [LoaderConfig] with [LoaderConfigBuilder], and construct a
//! [Loader].  Nothing here is a global: an application that wants one shared cache creates one `Loader` and passes it
//! around.
pub mod codec;
mod cost_lru;
mod disk_store;
mod image;
mod loader;
mod memory_store;
mod traits;
mod write_back;

pub use codec::{CodecError, HEADER_LEN};
pub use cost_lru::*;
pub use disk_store::*;
pub use image::*;
pub use loader::*;
pub use memory_store::*;
pub use traits::*;
pub use write_back::*;
