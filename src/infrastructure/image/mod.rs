//! Animated image decoding and frame caching.
//!
//! This module provides:
//! - A byte-budgeted frame cache for animated images
//! - GIF decoding
//! - Best-effort progressive decoding of still images
//! - An ordered coder registry

pub mod animated_image;
pub mod coder_registry;
pub mod gif_coder;
pub mod memory_budget;
pub mod progressive_coder;

pub use animated_image::{AnimatedImage, clamp_frame_duration};
pub use coder_registry::CoderRegistry;
pub use gif_coder::{GifAnimation, GifCoder};
pub use memory_budget::MemorySnapshot;
pub use progressive_coder::StillImageProgressiveDecoder;
