//! The on-disk raw pixel format.
//!
//! A cache file is an 8-byte header followed by the pixels, with no compression and no checksum:
//!
//! ```text
//! offset 0..4   width  (u32, little-endian)
//! offset 4..8   height (u32, little-endian)
//! offset 8..    width * height * 4 pixel bytes
//! ```
//!
//! Reading maps the file rather than copying it, and the resulting [DecodedImage] owns the mapping.  Files with more
//! bytes than the header asks for are accepted; files with fewer are rejected, since that is what a write cut short
//! by a crash looks like.
use std::convert::TryInto;
use std::fs::File;
use std::io::{Error as IoError, Write};

use memmap2::Mmap;

use crate::image::{pixel_len, DecodedImage};

/// Length of the `(width, height)` header.
pub const HEADER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("cache file is {len} bytes, too short for the 8-byte header")]
    MissingHeader { len: u64 },
    #[error("cache file declares {expected} pixel bytes but only {actual} are present")]
    Truncated { expected: usize, actual: usize },
    #[error("pixel buffer is {actual} bytes but the dimensions require {expected}")]
    BufferMismatch { expected: usize, actual: usize },
    #[error("a {width}x{height} image does not fit in memory")]
    TooLarge { width: u32, height: u32 },
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Parse a header, returning `(width, height, pixel_len)`.
///
/// `bytes` must be at least [HEADER_LEN] long; anything after the header is ignored.
fn parse_header(bytes: &[u8]) -> Result<(u32, u32, usize), CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::MissingHeader {
            len: bytes.len() as u64,
        });
    }

    // Infallible: both slices are exactly 4 bytes.
    let width = u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice"));
    let height = u32::from_le_bytes(bytes[4..8].try_into().expect("4-byte slice"));
    let expected = pixel_len(width, height).ok_or(CodecError::TooLarge { width, height })?;
    if expected == 0 {
        return Err(CodecError::EmptyImage);
    }
    Ok((width, height, expected))
}

/// Write `image` in the cache file format.
///
/// Fails without writing anything if the pixel buffer doesn't match the dimensions.
pub fn encode<W: Write>(image: &DecodedImage, mut writer: W) -> Result<(), CodecError> {
    let expected = pixel_len(image.width(), image.height()).ok_or(CodecError::TooLarge {
        width: image.width(),
        height: image.height(),
    })?;
    let pixels = image.pixels();
    if pixels.len() != expected {
        return Err(CodecError::BufferMismatch {
            expected,
            actual: pixels.len(),
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&image.width().to_le_bytes());
    header[4..8].copy_from_slice(&image.height().to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(pixels)?;
    writer.flush()?;
    Ok(())
}

pub fn encode_to_vec(image: &DecodedImage) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(HEADER_LEN + image.pixels().len());
    encode(image, &mut out)?;
    Ok(out)
}

/// Map `file` and interpret it as a cache file.
///
/// The returned image borrows nothing: it owns the mapping, which is released when the image is dropped.  The file
/// must not be modified in place while the image is alive.  [DiskStore](crate::DiskStore) only ever replaces files by
/// rename and removes them by unlinking, neither of which touches an existing mapping.
///
/// Nothing stops another process from doing so, though.  If something truncates a cache file in place while an image
/// mapped from it is still alive (in the memory tier, say), touching its pixels raises `SIGBUS`.  Don't edit the cache
/// directory by hand while a [Loader](crate::Loader) is using it; delete files or call
/// [Loader::purge_cache](crate::Loader::purge_cache) instead.
pub fn decode(file: &File) -> Result<DecodedImage, CodecError> {
    // Mapping an empty file fails on some platforms, and the header check has to happen anyway.
    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN as u64 {
        return Err(CodecError::MissingHeader { len: file_len });
    }

    // SAFETY: this crate never modifies cache files in place, see above.  Outside truncation is not guarded against.
    let map = unsafe { Mmap::map(file)? };
    let (width, height, expected) = parse_header(&map)?;
    let actual = map.len() - HEADER_LEN;
    if actual < expected {
        return Err(CodecError::Truncated { expected, actual });
    }

    Ok(DecodedImage::from_mapping(width, height, map, expected))
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom};

    use proptest::prelude::*;

    use super::*;

    fn file_with(bytes: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(bytes).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn test_encode_layout() {
        let img = DecodedImage::new(2, 2, (0..16).collect()).unwrap();
        let bytes = encode_to_vec(&img).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..8], &[2, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&bytes[8..], &(0..16).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn test_decode_round_trip() {
        let img = DecodedImage::new(3, 1, (100..112).collect()).unwrap();
        let file = file_with(&encode_to_vec(&img).unwrap());
        let back = decode(&file).unwrap();
        assert!(back.buffer().is_mapped());
        assert_eq!(back, img);
    }

    fn image_strategy() -> BoxedStrategy<(u32, u32, Vec<u8>)> {
        (1..40u32, 1..40u32)
            .prop_flat_map(|(w, h)| {
                let len = (w * h * 4) as usize;
                (Just(w), Just(h), prop::collection::vec(any::<u8>(), len..=len))
            })
            .boxed()
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 200,
            ..Default::default()
        })]

        #[test]
        fn test_round_trip_any_image((w, h, pixels) in image_strategy()) {
            let img = DecodedImage::new(w, h, pixels).unwrap();
            let mut file = tempfile::tempfile().unwrap();
            encode(&img, &mut file).unwrap();
            file.seek(SeekFrom::Start(0)).unwrap();

            let back = decode(&file).unwrap();
            prop_assert_eq!(back.width(), w);
            prop_assert_eq!(back.height(), h);
            prop_assert_eq!(back.pixels(), img.pixels());
            prop_assert_eq!(file.metadata().unwrap().len(), (HEADER_LEN + img.pixels().len()) as u64);
        }
    }

    #[test]
    fn test_mapping_outlives_file_handle() {
        let img = DecodedImage::new(1, 2, vec![9; 8]).unwrap();
        let back = {
            let file = file_with(&encode_to_vec(&img).unwrap());
            decode(&file).unwrap()
        };
        assert_eq!(back.pixels(), &[9; 8][..]);
    }

    #[test]
    fn test_decode_truncated() {
        let img = DecodedImage::new(2, 2, vec![7; 16]).unwrap();
        let bytes = encode_to_vec(&img).unwrap();
        let file = file_with(&bytes[..20]);
        match decode(&file) {
            Err(CodecError::Truncated {
                expected: 16,
                actual: 12,
            }) => {}
            x => panic!("Expected truncation, got {:?}", x),
        }
    }

    #[test]
    fn test_decode_trailing_bytes_ignored() {
        let img = DecodedImage::new(1, 1, vec![1, 2, 3, 4]).unwrap();
        let mut bytes = encode_to_vec(&img).unwrap();
        bytes.extend_from_slice(&[0xff; 5]);
        let back = decode(&file_with(&bytes)).unwrap();
        assert_eq!(back, img);
    }

    #[test]
    fn test_decode_empty_and_short() {
        assert!(matches!(
            decode(&file_with(&[])),
            Err(CodecError::MissingHeader { len: 0 })
        ));
        assert!(matches!(
            decode(&file_with(&[1, 0, 0])),
            Err(CodecError::MissingHeader { len: 3 })
        ));
        assert!(matches!(
            decode(&file_with(&[0, 0, 0, 0, 4, 0, 0, 0])),
            Err(CodecError::EmptyImage)
        ));
    }

    #[test]
    fn test_decode_absurd_dimensions() {
        let mut bytes = vec![0xff; HEADER_LEN];
        bytes.extend_from_slice(&[0; 16]);
        match decode(&file_with(&bytes)) {
            Err(CodecError::TooLarge { .. }) | Err(CodecError::Truncated { .. }) => {}
            x => panic!("Expected a rejection, got {:?}", x),
        }
    }
}
