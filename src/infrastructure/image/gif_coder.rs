//! GIF support for animated images.
//!
//! Frame timing and loop count are read by walking the GIF block structure,
//! which is cheap and touches no pixel data. Pixels come from a playhead that
//! decodes and composites frames in order onto the logical screen; it only
//! rewinds when asked for a frame before its position.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use gif::{ColorOutput, DecodeOptions, DecodingError, DisposalMethod};
use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::FrameSize;
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::{AnimatedCoderPort, AnimatedDecoderPort};

const EXTENSION_INTRODUCER: u8 = 0x21;
const IMAGE_SEPARATOR: u8 = 0x2C;
const TRAILER: u8 = 0x3B;
const GRAPHIC_CONTROL_LABEL: u8 = 0xF9;
const APPLICATION_LABEL: u8 = 0xFF;

/// Loop count reported when a GIF carries no looping extension: 0, loop
/// forever.
pub const DEFAULT_LOOP_COUNT: u32 = 0;

/// Animated coder for GIF data.
#[derive(Debug, Clone, Copy, Default)]
pub struct GifCoder;

impl AnimatedCoderPort for GifCoder {
    fn name(&self) -> &'static str {
        "gif"
    }

    fn can_decode(&self, data: &[u8]) -> bool {
        matches!(image::guess_format(data), Ok(ImageFormat::Gif))
    }

    fn open(&self, data: Bytes) -> ImageResult<Box<dyn AnimatedDecoderPort>> {
        Ok(Box::new(GifAnimation::load(data)?))
    }
}

/// A loaded GIF.
pub struct GifAnimation {
    data: Bytes,
    canvas: FrameSize,
    delays: Vec<Duration>,
    loop_count: u32,
    playhead: Mutex<Option<Playhead>>,
    rewinds: AtomicUsize,
}

impl GifAnimation {
    /// Parses the block structure of `data`.
    ///
    /// # Errors
    /// Returns error if the data is not a readable GIF.
    pub fn load(data: Bytes) -> ImageResult<Self> {
        let metadata = GifMetadata::scan(&data)
            .ok_or_else(|| ImageError::Decode("malformed GIF block structure".to_string()))?;
        let playhead = Playhead::open(&data, metadata.canvas)
            .map_err(|e| ImageError::Decode(e.to_string()))?;
        debug!(
            frames = metadata.delays.len(),
            canvas = %metadata.canvas,
            loop_count = metadata.loop_count,
            "Loaded GIF"
        );

        Ok(Self {
            data,
            canvas: metadata.canvas,
            delays: metadata.delays,
            loop_count: metadata.loop_count,
            playhead: Mutex::new(Some(playhead)),
            rewinds: AtomicUsize::new(0),
        })
    }

    /// Number of times the playhead restarted from the first frame.
    #[must_use]
    pub fn rewinds(&self) -> usize {
        self.rewinds.load(Ordering::Relaxed)
    }
}

impl AnimatedDecoderPort for GifAnimation {
    fn frame_count(&self) -> usize {
        self.delays.len()
    }

    fn loop_count(&self) -> u32 {
        self.loop_count
    }

    fn decode_frame(&self, index: usize) -> Option<Arc<image::DynamicImage>> {
        if index >= self.delays.len() {
            return None;
        }
        let mut playhead = self.playhead.lock();
        if playhead.as_ref().is_none_or(|head| head.next > index + 1) {
            trace!(index, "Rewinding GIF playhead");
            self.rewinds.fetch_add(1, Ordering::Relaxed);
            *playhead = Playhead::open(&self.data, self.canvas).ok();
        }

        let reached = playhead.as_mut()?.seek(index);
        match reached {
            Ok(true) => playhead
                .as_ref()
                .map(|head| Arc::new(image::DynamicImage::ImageRgba8(head.canvas.clone()))),
            Ok(false) => {
                trace!(index, "GIF ended before frame");
                *playhead = None;
                None
            }
            Err(e) => {
                trace!(index, error = %e, "GIF frame decode failed");
                *playhead = None;
                None
            }
        }
    }

    fn frame_size(&self, index: usize) -> Option<FrameSize> {
        (index < self.delays.len()).then_some(self.canvas)
    }

    fn duration(&self, index: usize) -> Option<Duration> {
        self.delays.get(index).copied()
    }
}

/// Frame rectangle on the logical screen.
#[derive(Debug, Clone, Copy)]
struct Rect {
    left: u32,
    top: u32,
    width: u32,
    height: u32,
}

/// Disposal still owed by the last composited frame.
enum Disposal {
    None,
    Clear(Rect),
    Restore(RgbaImage),
}

/// Sequential decoder holding the composited canvas of the last frame.
struct Playhead {
    decoder: gif::Decoder<Cursor<Bytes>>,
    /// Index of the next frame the decoder yields.
    next: usize,
    canvas: RgbaImage,
    pending: Disposal,
}

impl Playhead {
    fn open(data: &Bytes, canvas: FrameSize) -> Result<Self, DecodingError> {
        let mut options = DecodeOptions::new();
        options.set_color_output(ColorOutput::RGBA);
        let decoder = options.read_info(Cursor::new(data.clone()))?;
        Ok(Self {
            decoder,
            next: 0,
            canvas: RgbaImage::new(canvas.width, canvas.height),
            pending: Disposal::None,
        })
    }

    /// Advances until the canvas shows frame `index`. Returns false if the
    /// stream ends first.
    fn seek(&mut self, index: usize) -> Result<bool, DecodingError> {
        while self.next <= index {
            if !self.advance()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn advance(&mut self) -> Result<bool, DecodingError> {
        match std::mem::replace(&mut self.pending, Disposal::None) {
            Disposal::None => {}
            Disposal::Clear(rect) => fill(&mut self.canvas, rect, Rgba([0, 0, 0, 0])),
            Disposal::Restore(previous) => self.canvas = previous,
        }

        let Some(frame) = self.decoder.read_next_frame()? else {
            return Ok(false);
        };
        let rect = Rect {
            left: u32::from(frame.left),
            top: u32::from(frame.top),
            width: u32::from(frame.width),
            height: u32::from(frame.height),
        };
        self.pending = match frame.dispose {
            DisposalMethod::Background => Disposal::Clear(rect),
            DisposalMethod::Previous => Disposal::Restore(self.canvas.clone()),
            DisposalMethod::Any | DisposalMethod::Keep => Disposal::None,
        };
        blend(&mut self.canvas, rect, &frame.buffer);
        self.next += 1;
        Ok(true)
    }
}

/// Draws the opaque pixels of an RGBA frame buffer onto the canvas.
fn blend(canvas: &mut RgbaImage, rect: Rect, buffer: &[u8]) {
    if rect.width == 0 {
        return;
    }
    for (i, px) in (0u32..).zip(buffer.chunks_exact(4)) {
        if px[3] == 0 {
            continue;
        }
        let x = rect.left + i % rect.width;
        let y = rect.top + i / rect.width;
        if x < canvas.width() && y < canvas.height() {
            canvas.put_pixel(x, y, Rgba([px[0], px[1], px[2], px[3]]));
        }
    }
}

fn fill(canvas: &mut RgbaImage, rect: Rect, color: Rgba<u8>) {
    let right = rect.left.saturating_add(rect.width).min(canvas.width());
    let bottom = rect.top.saturating_add(rect.height).min(canvas.height());
    for y in rect.top..bottom {
        for x in rect.left..right {
            canvas.put_pixel(x, y, color);
        }
    }
}

/// Timing data gathered from the block structure.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GifMetadata {
    canvas: FrameSize,
    delays: Vec<Duration>,
    loop_count: u32,
}

impl GifMetadata {
    /// Walks the blocks of `data`. A truncated stream yields the frames that
    /// were complete.
    fn scan(data: &[u8]) -> Option<Self> {
        let mut reader = BlockReader { data, pos: 0 };
        reader.take(6)?;
        let screen = reader.take(7)?;
        let canvas = FrameSize::new(
            u32::from(u16::from_le_bytes([screen[0], screen[1]])),
            u32::from(u16::from_le_bytes([screen[2], screen[3]])),
        );
        if screen[4] & 0x80 != 0 {
            reader.take(color_table_len(screen[4]))?;
        }

        let mut delays = Vec::new();
        let mut pending_delay = Duration::ZERO;
        let mut loop_count = DEFAULT_LOOP_COUNT;

        while let Some(introducer) = reader.byte() {
            match introducer {
                EXTENSION_INTRODUCER => {
                    let Some(label) = reader.byte() else { break };
                    let Some(blocks) = reader.sub_blocks() else {
                        break;
                    };
                    match label {
                        GRAPHIC_CONTROL_LABEL => {
                            if let Some(block) = blocks.first().filter(|b| b.len() >= 3) {
                                let centis = u16::from_le_bytes([block[1], block[2]]);
                                pending_delay = Duration::from_millis(u64::from(centis) * 10);
                            }
                        }
                        APPLICATION_LABEL => {
                            if let [id, payload, ..] = blocks.as_slice()
                                && (*id == b"NETSCAPE2.0" || *id == b"ANIMEXTS1.0")
                                && payload.len() >= 3
                                && payload[0] == 1
                            {
                                loop_count = u32::from(u16::from_le_bytes([payload[1], payload[2]]));
                            }
                        }
                        _ => {}
                    }
                }
                IMAGE_SEPARATOR => {
                    let Some(descriptor) = reader.take(9) else {
                        break;
                    };
                    if descriptor[8] & 0x80 != 0 && reader.take(color_table_len(descriptor[8])).is_none() {
                        break;
                    }
                    // LZW minimum code size, then the image data.
                    if reader.byte().is_none() || reader.sub_blocks().is_none() {
                        break;
                    }
                    delays.push(pending_delay);
                    pending_delay = Duration::ZERO;
                }
                TRAILER => break,
                other => {
                    trace!(byte = other, pos = reader.pos, "Unexpected GIF block");
                    break;
                }
            }
        }

        Some(Self {
            canvas,
            delays,
            loop_count,
        })
    }
}

fn color_table_len(packed: u8) -> usize {
    3 * (1 << ((packed & 0x07) + 1))
}

struct BlockReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    fn byte(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    /// Reads data sub-blocks up to and including the zero terminator.
    fn sub_blocks(&mut self) -> Option<Vec<&'a [u8]>> {
        let mut blocks = Vec::new();
        loop {
            let len = usize::from(self.byte()?);
            if len == 0 {
                return Some(blocks);
            }
            blocks.push(self.take(len)?);
        }
    }
}
