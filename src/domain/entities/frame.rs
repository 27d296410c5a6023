//! Frame geometry and cache budget types.

use serde::{Deserialize, Serialize};

/// Pixel dimensions of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl FrameSize {
    /// Creates a new frame size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns the dimensions of a decoded image.
    #[must_use]
    pub fn of(image: &image::DynamicImage) -> Self {
        Self::new(image.width(), image.height())
    }

    /// Estimated byte cost of holding this frame decoded.
    ///
    /// This is a pixel count, not an exact buffer size: stride and color
    /// depth are not modeled.
    #[must_use]
    pub const fn byte_cost(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for FrameSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How much decoded frame data an animated image may keep resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBudget {
    /// Derived from system memory and refreshed on demand.
    #[default]
    Automatic,
    /// A fixed number of bytes.
    Fixed(u64),
}

impl CacheBudget {
    /// Returns true if the budget follows system memory.
    #[must_use]
    pub const fn is_automatic(self) -> bool {
        matches!(self, Self::Automatic)
    }
}

impl std::fmt::Display for CacheBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "automatic"),
            Self::Fixed(bytes) => write!(f, "{bytes} bytes"),
        }
    }
}
