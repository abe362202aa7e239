//! The [ImageSource] trait is the slow path behind both cache tiers: it turns a name into pixels from wherever the
//! application's original assets live.
use crate::DecodedImage;

/// Decodes original images by name.
///
/// Returning `Ok(None)` means there is no such image.  Errors are logged by the [Loader](crate::Loader) and otherwise
/// treated the same way.
pub trait ImageSource: Send + Sync + 'static {
    type Error: std::error::Error;

    fn decode(&self, name: &str) -> Result<Option<DecodedImage>, Self::Error>;
}
