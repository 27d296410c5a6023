//! Port definition for progressive (partial data) decoding.

use std::sync::Arc;

/// Decoder that can render an image from a growing byte prefix.
pub trait ProgressiveDecoderPort: Send + Sync {
    /// Returns true if this decoder can work on `data` received so far.
    fn can_incrementally_decode(&self, data: &[u8]) -> bool;

    /// Produces a best-effort image from the bytes received so far.
    /// `finished` is set for the call made with the complete body.
    fn incrementally_decoded_image(
        &self,
        data: &[u8],
        finished: bool,
    ) -> Option<Arc<image::DynamicImage>>;

    /// Returns a fresh instance with no per-download state.
    fn fresh(&self) -> Arc<dyn ProgressiveDecoderPort>;
}
