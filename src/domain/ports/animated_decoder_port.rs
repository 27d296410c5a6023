//! Port definitions for animated image decoding.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::domain::entities::FrameSize;
use crate::domain::errors::ImageResult;

/// A format-specific coder that recognizes and opens animated data.
///
/// Coders are registered once and probed in registration order.
pub trait AnimatedCoderPort: Send + Sync {
    /// Short format name used in logs.
    fn name(&self) -> &'static str;

    /// Returns true if this coder can decode `data`.
    fn can_decode(&self, data: &[u8]) -> bool;

    /// Loads `data` and returns a decoder bound to it.
    ///
    /// # Errors
    /// Returns error if the data is malformed.
    fn open(&self, data: Bytes) -> ImageResult<Box<dyn AnimatedDecoderPort>>;
}

/// A decoder bound to one loaded animated image.
///
/// All methods are queries against the already-loaded bytes and may be
/// called concurrently from any thread.
pub trait AnimatedDecoderPort: Send + Sync {
    /// Number of frames.
    fn frame_count(&self) -> usize;

    /// Loop count, 0 meaning infinite.
    fn loop_count(&self) -> u32;

    /// Decodes the frame at `index`.
    fn decode_frame(&self, index: usize) -> Option<Arc<image::DynamicImage>>;

    /// Pixel dimensions of the frame at `index`, if known without decoding.
    fn frame_size(&self, index: usize) -> Option<FrameSize>;

    /// Display duration of the frame at `index` as stored in the source.
    fn duration(&self, index: usize) -> Option<Duration>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::domain::errors::ImageError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Magic prefix the mock coder recognizes.
    pub const MOCK_MAGIC: &[u8] = b"MOCKANIM";

    /// Mock animated coder producing solid frames of fixed sizes.
    #[derive(Clone)]
    pub struct MockAnimatedCoder {
        sizes: Vec<FrameSize>,
        durations: Vec<Option<Duration>>,
        loop_count: u32,
        decode_delay: Duration,
        failing: Option<usize>,
        decodes: Arc<AtomicUsize>,
    }

    impl MockAnimatedCoder {
        /// Creates a coder with `count` frames of `width` x `height`.
        pub fn uniform(count: usize, width: u32, height: u32) -> Self {
            Self {
                sizes: vec![FrameSize::new(width, height); count],
                durations: vec![Some(Duration::from_millis(50)); count],
                loop_count: 0,
                decode_delay: Duration::ZERO,
                failing: None,
                decodes: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Overrides every frame duration.
        pub fn with_durations(mut self, durations: Vec<Option<Duration>>) -> Self {
            self.durations = durations;
            self
        }

        /// Sets the loop count.
        pub fn with_loop_count(mut self, loop_count: u32) -> Self {
            self.loop_count = loop_count;
            self
        }

        /// Makes every decode sleep first.
        pub fn with_decode_delay(mut self, delay: Duration) -> Self {
            self.decode_delay = delay;
            self
        }

        /// Makes decoding of `index` fail.
        pub fn failing_at(mut self, index: usize) -> Self {
            self.failing = Some(index);
            self
        }

        /// Number of decode calls made so far.
        pub fn decodes(&self) -> usize {
            self.decodes.load(Ordering::SeqCst)
        }

        /// Data the coder accepts.
        pub fn data() -> Bytes {
            Bytes::from_static(MOCK_MAGIC)
        }
    }

    impl AnimatedCoderPort for MockAnimatedCoder {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn can_decode(&self, data: &[u8]) -> bool {
            data.starts_with(MOCK_MAGIC)
        }

        fn open(&self, _data: Bytes) -> ImageResult<Box<dyn AnimatedDecoderPort>> {
            if self.sizes.is_empty() {
                return Err(ImageError::NoFrames);
            }
            Ok(Box::new(self.clone()))
        }
    }

    impl AnimatedDecoderPort for MockAnimatedCoder {
        fn frame_count(&self) -> usize {
            self.sizes.len()
        }

        fn loop_count(&self) -> u32 {
            self.loop_count
        }

        fn decode_frame(&self, index: usize) -> Option<Arc<image::DynamicImage>> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            if !self.decode_delay.is_zero() {
                std::thread::sleep(self.decode_delay);
            }
            if self.failing == Some(index) {
                return None;
            }
            let size = self.sizes.get(index)?;
            Some(Arc::new(image::DynamicImage::new_rgba8(
                size.width,
                size.height,
            )))
        }

        fn frame_size(&self, index: usize) -> Option<FrameSize> {
            self.sizes.get(index).copied()
        }

        fn duration(&self, index: usize) -> Option<Duration> {
            self.durations.get(index).copied().flatten()
        }
    }
}
