//! Best-effort progressive decoding of still images.

use std::sync::Arc;

use image::ImageFormat;
use tracing::trace;

use crate::domain::ports::ProgressiveDecoderPort;

/// Formats whose partial data is worth attempting.
const PROGRESSIVE_FORMATS: [ImageFormat; 3] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP];

/// Progressive decoder backed by the `image` crate.
///
/// The codecs cannot render a prefix of a stream, so every attempt decodes
/// the bytes received so far and yields an image only once they form a
/// complete file. Callers still see progress without a picture until then.
#[derive(Debug, Clone, Copy, Default)]
pub struct StillImageProgressiveDecoder;

impl ProgressiveDecoderPort for StillImageProgressiveDecoder {
    fn can_incrementally_decode(&self, data: &[u8]) -> bool {
        image::guess_format(data).is_ok_and(|format| PROGRESSIVE_FORMATS.contains(&format))
    }

    fn incrementally_decoded_image(
        &self,
        data: &[u8],
        finished: bool,
    ) -> Option<Arc<image::DynamicImage>> {
        match image::load_from_memory(data) {
            Ok(img) => Some(Arc::new(img)),
            Err(e) => {
                if finished {
                    trace!(error = %e, len = data.len(), "Final progressive decode failed");
                }
                None
            }
        }
    }

    fn fresh(&self) -> Arc<dyn ProgressiveDecoderPort> {
        Arc::new(Self)
    }
}
