//! Animated image with a lazily populated, byte-budgeted frame cache.
//!
//! Frame 0 is decoded up front and stays resident. Other frames are filled
//! by background preload sweeps running on a [`QueuePool`] and evicted again
//! when the cache grows past its budget. Sweeps are cancelled cooperatively:
//! dropping the image bumps a generation counter that every sweep compares
//! before touching shared state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheBudget, FrameSize};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::{AnimatedCoderPort, AnimatedDecoderPort};
use crate::infrastructure::queue_pool::QueuePool;

use super::coder_registry::CoderRegistry;
use super::memory_budget::MemorySnapshot;

/// Durations below this are treated as broken metadata.
pub const MIN_FRAME_DURATION: Duration = Duration::from_millis(10);

/// Duration used in place of a too-short one.
pub const CLAMPED_FRAME_DURATION: Duration = Duration::from_millis(100);

/// Applies the minimum frame duration rule.
#[must_use]
pub fn clamp_frame_duration(duration: Duration) -> Duration {
    if duration < MIN_FRAME_DURATION {
        CLAMPED_FRAME_DURATION
    } else {
        duration
    }
}

struct Frame {
    image: Option<Arc<image::DynamicImage>>,
    size: Option<FrameSize>,
    duration: Duration,
}

impl Frame {
    fn byte_cost(&self) -> u64 {
        self.size
            .or_else(|| self.image.as_deref().map(FrameSize::of))
            .map_or(0, FrameSize::byte_cost)
    }

    fn store(&mut self, image: Arc<image::DynamicImage>) {
        self.size = Some(FrameSize::of(&image));
        self.image = Some(image);
    }
}

struct FrameState {
    frames: Vec<Frame>,
    max_cache_size: u64,
    current_cache_size: u64,
    auto_cache_budget: bool,
    preload_pending: bool,
}

struct FrameStore {
    frame_count: usize,
    loop_count: u32,
    decoder: Box<dyn AnimatedDecoderPort>,
    state: Mutex<FrameState>,
    generation: AtomicU64,
    pool: Arc<QueuePool>,
}

/// A multi-frame image whose decoded frames are cached within a byte budget.
pub struct AnimatedImage {
    store: Arc<FrameStore>,
}

impl AnimatedImage {
    /// Opens `data` with `coder`.
    ///
    /// # Errors
    /// Returns error if the coder rejects the data, the image has no frames,
    /// frame 0 cannot be decoded or a frame has no duration.
    pub fn new(
        data: Bytes,
        coder: &dyn AnimatedCoderPort,
        pool: Arc<QueuePool>,
    ) -> ImageResult<Self> {
        if !coder.can_decode(&data) {
            return Err(ImageError::UnsupportedFormat);
        }
        let decoder = coder.open(data)?;

        let frame_count = decoder.frame_count();
        if frame_count == 0 {
            return Err(ImageError::NoFrames);
        }
        let first = decoder
            .decode_frame(0)
            .ok_or(ImageError::FrameDecode { index: 0 })?;

        let mut frames = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            let duration = decoder
                .duration(index)
                .ok_or(ImageError::MissingDuration { index })?;
            frames.push(Frame {
                image: None,
                size: decoder.frame_size(index),
                duration: clamp_frame_duration(duration),
            });
        }
        frames[0].store(first);
        let current_cache_size = frames[0].byte_cost();
        let loop_count = decoder.loop_count();

        debug!(
            coder = coder.name(),
            frames = frame_count,
            loop_count,
            "Opened animated image"
        );

        Ok(Self {
            store: Arc::new(FrameStore {
                frame_count,
                loop_count,
                decoder,
                state: Mutex::new(FrameState {
                    frames,
                    max_cache_size: u64::MAX,
                    current_cache_size,
                    auto_cache_budget: true,
                    preload_pending: false,
                }),
                generation: AtomicU64::new(0),
                pool,
            }),
        })
    }

    /// Opens `data` with the first registered coder that accepts it.
    ///
    /// # Errors
    /// Returns error if no coder accepts the data or opening fails.
    pub fn from_registry(
        data: Bytes,
        registry: &CoderRegistry,
        pool: Arc<QueuePool>,
    ) -> ImageResult<Self> {
        let coder = registry
            .animated_coder_for(&data)
            .ok_or(ImageError::UnsupportedFormat)?;
        Self::new(data, coder.as_ref(), pool)
    }

    /// Number of frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.store.frame_count
    }

    /// Loop count, 0 meaning infinite.
    #[must_use]
    pub fn loop_count(&self) -> u32 {
        self.store.loop_count
    }

    /// Returns the frame at `index`.
    ///
    /// Cached frames are returned directly; a missing frame is decoded on the
    /// calling thread without being cached.
    #[must_use]
    pub fn frame(&self, index: usize) -> Option<Arc<image::DynamicImage>> {
        if index >= self.store.frame_count {
            return None;
        }
        let cached = self.store.state.lock().frames[index].image.clone();
        if cached.is_some() {
            return cached;
        }
        trace!(index, "Frame cache miss, decoding uncached");
        self.store.decoder.decode_frame(index)
    }

    /// Display duration of the frame at `index`.
    #[must_use]
    pub fn duration(&self, index: usize) -> Option<Duration> {
        if index >= self.store.frame_count {
            return None;
        }
        Some(self.store.state.lock().frames[index].duration)
    }

    /// Current budget in bytes.
    #[must_use]
    pub fn cache_budget(&self) -> u64 {
        self.store.state.lock().max_cache_size
    }

    /// Returns true if the budget follows system memory.
    #[must_use]
    pub fn is_automatic_budget(&self) -> bool {
        self.store.state.lock().auto_cache_budget
    }

    /// Bytes currently held by decoded frames.
    #[must_use]
    pub fn cached_bytes(&self) -> u64 {
        self.store.state.lock().current_cache_size
    }

    /// Returns true if the frame at `index` is decoded and resident.
    #[must_use]
    pub fn is_frame_cached(&self, index: usize) -> bool {
        self.store
            .state
            .lock()
            .frames
            .get(index)
            .is_some_and(|frame| frame.image.is_some())
    }

    /// Returns true while a preload sweep is pending.
    #[must_use]
    pub fn is_preloading(&self) -> bool {
        self.store.state.lock().preload_pending
    }

    /// Sets a fixed budget, or switches to the automatic one.
    pub fn set_cache_budget(&self, budget: CacheBudget) {
        match budget {
            CacheBudget::Fixed(bytes) => {
                let mut state = self.store.state.lock();
                state.max_cache_size = bytes;
                state.auto_cache_budget = false;
            }
            CacheBudget::Automatic => {
                self.store.state.lock().auto_cache_budget = true;
                self.update_cache_budget_if_needed();
            }
        }
    }

    /// Recomputes the budget from system memory when in automatic mode.
    pub fn update_cache_budget_if_needed(&self) {
        if !self.store.state.lock().auto_cache_budget {
            return;
        }
        let budget = MemorySnapshot::current().frame_cache_budget();
        let mut state = self.store.state.lock();
        if state.auto_cache_budget {
            state.max_cache_size = budget;
            trace!(budget, "Updated automatic frame cache budget");
        }
    }

    /// Schedules a background sweep around `start`.
    ///
    /// Over budget, the sweep evicts frames least soon needed after `start`;
    /// otherwise it decodes missing frames from `start` onwards until the
    /// budget is reached. Does nothing while another sweep is pending.
    pub fn preload(&self, start: usize) {
        let store = &self.store;
        if start >= store.frame_count {
            return;
        }
        let generation = {
            let mut state = store.state.lock();
            if state.preload_pending {
                trace!(start, "Preload already pending");
                return;
            }
            state.preload_pending = true;
            store.generation.load(Ordering::Acquire)
        };

        let weak: Weak<FrameStore> = Arc::downgrade(store);
        store.pool.submit(move || {
            if let Some(store) = weak.upgrade() {
                store.sweep(start, generation);
            }
        });
    }

    /// Invalidates any pending or running sweep.
    pub fn cancel_preload(&self) {
        self.store.cancel_preload();
    }
}

impl Drop for AnimatedImage {
    fn drop(&mut self) {
        self.store.cancel_preload();
    }
}

impl std::fmt::Debug for AnimatedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimatedImage")
            .field("frame_count", &self.store.frame_count)
            .field("loop_count", &self.store.loop_count)
            .finish_non_exhaustive()
    }
}

impl FrameStore {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn cancel_preload(&self) {
        let mut state = self.state.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        state.preload_pending = false;
    }

    fn sweep(&self, start: usize, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        let over_budget = {
            let state = self.state.lock();
            state.current_cache_size > state.max_cache_size
        };

        let completed = if over_budget {
            self.evict_from(start, generation)
        } else {
            self.fill_from(start, generation)
        };
        if !completed {
            trace!(start, "Preload sweep aborted");
            return;
        }

        let mut state = self.state.lock();
        if self.is_current(generation) {
            state.preload_pending = false;
        }
    }

    /// Drops frames, starting with the one two places before `start`.
    fn evict_from(&self, start: usize, generation: u64) -> bool {
        let count = self.frame_count;
        let mut evicted = 0usize;
        for i in 0..count {
            let index = (start + count * 2 - i - 2) % count;
            if index == 0 {
                continue;
            }
            let mut state = self.state.lock();
            if !self.is_current(generation) {
                return false;
            }
            let frame = &mut state.frames[index];
            if frame.image.take().is_none() {
                continue;
            }
            let cost = frame.byte_cost();
            state.current_cache_size = state.current_cache_size.saturating_sub(cost);
            evicted += 1;
            if state.current_cache_size <= state.max_cache_size {
                break;
            }
        }
        debug!(start, evicted, "Evicted animation frames");
        true
    }

    /// Decodes missing frames from `start` on while they fit the budget.
    fn fill_from(&self, start: usize, generation: u64) -> bool {
        let count = self.frame_count;
        let mut decoded = 0usize;
        for i in 0..count {
            let index = (start + i) % count;
            if self.state.lock().frames[index].image.is_some() {
                continue;
            }

            let Some(image) = self.decoder.decode_frame(index) else {
                debug!(index, "Frame decode failed, stopping preload");
                break;
            };
            if !self.is_current(generation) {
                return false;
            }

            let mut state = self.state.lock();
            if !self.is_current(generation) {
                return false;
            }
            if state.frames[index].image.is_some() {
                continue;
            }
            let cost = FrameSize::of(&image).byte_cost();
            if state.current_cache_size.saturating_add(cost) > state.max_cache_size {
                trace!(index, "Frame cache budget reached");
                break;
            }
            let frame = &mut state.frames[index];
            frame.store(image);
            let stored = frame.byte_cost();
            state.current_cache_size += stored;
            decoded += 1;
        }
        trace!(start, decoded, "Preloaded animation frames");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::MockAnimatedCoder;
    use std::time::Instant;

    fn pool() -> Arc<QueuePool> {
        Arc::new(QueuePool::new("test.frames", 2).expect("spawn pool"))
    }

    fn open(coder: &MockAnimatedCoder) -> AnimatedImage {
        AnimatedImage::new(MockAnimatedCoder::data(), coder, pool()).expect("open image")
    }

    fn wait_for_sweep(image: &AnimatedImage) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while image.is_preloading() {
            assert!(Instant::now() < deadline, "preload sweep did not finish");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn cached(image: &AnimatedImage) -> Vec<bool> {
        (0..image.frame_count())
            .map(|i| image.is_frame_cached(i))
            .collect()
    }

    #[test]
    fn test_short_durations_are_clamped() {
        let coder = MockAnimatedCoder::uniform(4, 2, 2).with_durations(vec![
            Some(Duration::from_millis(5)),
            Some(Duration::ZERO),
            Some(Duration::from_millis(10)),
            Some(Duration::from_millis(200)),
        ]);
        let image = open(&coder);

        assert_eq!(image.duration(0), Some(Duration::from_millis(100)));
        assert_eq!(image.duration(1), Some(Duration::from_millis(100)));
        assert_eq!(image.duration(2), Some(Duration::from_millis(10)));
        assert_eq!(image.duration(3), Some(Duration::from_millis(200)));
        assert_eq!(image.duration(4), None);
    }

    #[test]
    fn test_construction_failures() {
        let coder = MockAnimatedCoder::uniform(3, 2, 2);
        let err = AnimatedImage::new(Bytes::from_static(b"GIF89a"), &coder, pool()).unwrap_err();
        assert_eq!(err, ImageError::UnsupportedFormat);

        let empty = MockAnimatedCoder::uniform(0, 2, 2);
        let err = AnimatedImage::new(MockAnimatedCoder::data(), &empty, pool()).unwrap_err();
        assert_eq!(err, ImageError::NoFrames);

        let broken = MockAnimatedCoder::uniform(3, 2, 2).failing_at(0);
        let err = AnimatedImage::new(MockAnimatedCoder::data(), &broken, pool()).unwrap_err();
        assert_eq!(err, ImageError::FrameDecode { index: 0 });

        let no_duration = MockAnimatedCoder::uniform(3, 2, 2).with_durations(vec![
            Some(Duration::from_millis(50)),
            None,
            Some(Duration::from_millis(50)),
        ]);
        let err = AnimatedImage::new(MockAnimatedCoder::data(), &no_duration, pool()).unwrap_err();
        assert_eq!(err, ImageError::MissingDuration { index: 1 });
    }

    #[test]
    fn test_first_frame_resident_after_open() {
        let coder = MockAnimatedCoder::uniform(3, 10, 10).with_loop_count(4);
        let image = open(&coder);

        assert_eq!(image.frame_count(), 3);
        assert_eq!(image.loop_count(), 4);
        assert_eq!(cached(&image), vec![true, false, false]);
        assert_eq!(image.cached_bytes(), 100);
        assert_eq!(coder.decodes(), 1);
    }

    #[test]
    fn test_frame_miss_decodes_without_caching() {
        let coder = MockAnimatedCoder::uniform(3, 10, 10);
        let image = open(&coder);

        let frame = image.frame(2).expect("decoded frame");
        assert_eq!(frame.width(), 10);
        assert!(!image.is_frame_cached(2));
        assert_eq!(image.cached_bytes(), 100);
        assert!(image.frame(3).is_none());
    }

    #[test]
    fn test_frame_decode_failure_returns_none() {
        let coder = MockAnimatedCoder::uniform(3, 10, 10).failing_at(1);
        let image = open(&coder);

        assert!(image.frame(1).is_none());
        assert!(image.frame(2).is_some());
    }

    #[test]
    fn test_preload_fills_all_frames_within_budget() {
        let coder = MockAnimatedCoder::uniform(3, 10, 10);
        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(1000));

        image.preload(0);
        wait_for_sweep(&image);

        assert_eq!(cached(&image), vec![true, true, true]);
        assert_eq!(image.cached_bytes(), 300);
    }

    #[test]
    fn test_preload_evicts_when_budget_shrinks() {
        let coder = MockAnimatedCoder::uniform(3, 10, 10);
        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(1000));
        image.preload(0);
        wait_for_sweep(&image);

        image.set_cache_budget(CacheBudget::Fixed(50));
        image.preload(0);
        wait_for_sweep(&image);

        assert_eq!(cached(&image), vec![true, false, false]);
        assert_eq!(image.cached_bytes(), 100);
    }

    #[test]
    fn test_eviction_starts_two_before_start() {
        let coder = MockAnimatedCoder::uniform(3, 10, 10);

        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(1000));
        image.preload(0);
        wait_for_sweep(&image);
        image.set_cache_budget(CacheBudget::Fixed(250));
        image.preload(0);
        wait_for_sweep(&image);
        // (0 + 6 - 0 - 2) % 3 == 1
        assert_eq!(cached(&image), vec![true, false, true]);

        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(1000));
        image.preload(0);
        wait_for_sweep(&image);
        image.set_cache_budget(CacheBudget::Fixed(250));
        image.preload(1);
        wait_for_sweep(&image);
        // (1 + 6 - 0 - 2) % 3 == 2
        assert_eq!(cached(&image), vec![true, true, false]);
    }

    #[test]
    fn test_fill_stops_at_first_frame_over_budget() {
        let coder = MockAnimatedCoder::uniform(4, 10, 10);
        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(250));

        image.preload(2);
        wait_for_sweep(&image);

        assert_eq!(cached(&image), vec![true, false, true, false]);
        assert_eq!(image.cached_bytes(), 200);
    }

    #[test]
    fn test_decode_failure_stops_fill() {
        let coder = MockAnimatedCoder::uniform(4, 10, 10).failing_at(1);
        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(1000));

        image.preload(0);
        wait_for_sweep(&image);

        assert_eq!(cached(&image), vec![true, false, false, false]);
        assert!(!image.is_preloading());
    }

    #[test]
    fn test_first_frame_never_evicted() {
        let coder = MockAnimatedCoder::uniform(5, 10, 10);
        for budget in [100, 150, 250, 499] {
            for start in 0..5 {
                let image = open(&coder);
                image.set_cache_budget(CacheBudget::Fixed(10_000));
                image.preload(start);
                wait_for_sweep(&image);

                image.set_cache_budget(CacheBudget::Fixed(budget));
                image.preload(start);
                wait_for_sweep(&image);

                assert!(image.is_frame_cached(0), "budget {budget} start {start}");
                assert!(image.cached_bytes() <= budget);
            }
        }
    }

    #[test]
    fn test_preload_is_noop_while_pending() {
        let coder = MockAnimatedCoder::uniform(3, 10, 10).with_decode_delay(Duration::from_millis(30));
        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(1000));

        image.preload(0);
        assert!(image.is_preloading());
        image.preload(0);
        image.preload(1);
        wait_for_sweep(&image);

        // one decode at open plus frames 1 and 2 once each
        assert_eq!(coder.decodes(), 3);
        assert_eq!(cached(&image), vec![true, true, true]);
    }

    #[test]
    fn test_preload_out_of_range_is_ignored() {
        let coder = MockAnimatedCoder::uniform(3, 10, 10);
        let image = open(&coder);

        image.preload(3);
        assert!(!image.is_preloading());
    }

    #[test]
    fn test_drop_aborts_running_sweep() {
        let coder =
            MockAnimatedCoder::uniform(10, 10, 10).with_decode_delay(Duration::from_millis(20));
        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(u64::MAX));

        image.preload(0);
        std::thread::sleep(Duration::from_millis(30));
        drop(image);

        std::thread::sleep(Duration::from_millis(100));
        let settled = coder.decodes();
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(coder.decodes(), settled);
        assert!(settled < 10);
    }

    #[test]
    fn test_cancel_preload_clears_pending() {
        let coder = MockAnimatedCoder::uniform(5, 10, 10).with_decode_delay(Duration::from_millis(20));
        let image = open(&coder);
        image.set_cache_budget(CacheBudget::Fixed(u64::MAX));

        image.preload(0);
        image.cancel_preload();
        assert!(!image.is_preloading());

        std::thread::sleep(Duration::from_millis(60));
        image.preload(0);
        wait_for_sweep(&image);
        assert!(cached(&image).iter().all(|c| *c));
    }

    #[test]
    fn test_budget_modes() {
        let coder = MockAnimatedCoder::uniform(2, 10, 10);
        let image = open(&coder);
        assert!(image.is_automatic_budget());

        image.set_cache_budget(CacheBudget::Fixed(1234));
        image.update_cache_budget_if_needed();
        assert!(!image.is_automatic_budget());
        assert_eq!(image.cache_budget(), 1234);

        image.set_cache_budget(CacheBudget::Automatic);
        assert!(image.is_automatic_budget());
        let snapshot = MemorySnapshot::current();
        assert!(image.cache_budget() <= snapshot.total);
    }
}
