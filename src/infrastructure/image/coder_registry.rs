//! Ordered registry of coders.
//!
//! Selection is a linear scan in registration order; the first coder that
//! accepts the data wins.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::domain::ports::{AnimatedCoderPort, ProgressiveDecoderPort};

use super::gif_coder::GifCoder;
use super::progressive_coder::StillImageProgressiveDecoder;

/// Registry of animated coders and progressive decoders.
#[derive(Default)]
pub struct CoderRegistry {
    animated: RwLock<Vec<Arc<dyn AnimatedCoderPort>>>,
    progressive: RwLock<Vec<Arc<dyn ProgressiveDecoderPort>>>,
}

impl CoderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in coders.
    #[must_use]
    pub fn with_default_coders() -> Self {
        let registry = Self::new();
        registry.register_animated(Arc::new(GifCoder));
        registry.register_progressive(Arc::new(StillImageProgressiveDecoder));
        registry
    }

    /// Appends an animated coder. Earlier registrations take precedence.
    pub fn register_animated(&self, coder: Arc<dyn AnimatedCoderPort>) {
        trace!(coder = coder.name(), "Registered animated coder");
        self.animated.write().push(coder);
    }

    /// Appends a progressive decoder. Earlier registrations take precedence.
    pub fn register_progressive(&self, decoder: Arc<dyn ProgressiveDecoderPort>) {
        self.progressive.write().push(decoder);
    }

    /// Returns the first animated coder that accepts `data`.
    #[must_use]
    pub fn animated_coder_for(&self, data: &[u8]) -> Option<Arc<dyn AnimatedCoderPort>> {
        let coders = self.animated.read().clone();
        coders.into_iter().find(|coder| coder.can_decode(data))
    }

    /// Returns a fresh instance of the first progressive decoder that
    /// accepts `data`.
    #[must_use]
    pub fn progressive_decoder_for(&self, data: &[u8]) -> Option<Arc<dyn ProgressiveDecoderPort>> {
        let decoders = self.progressive.read().clone();
        decoders
            .into_iter()
            .find(|decoder| decoder.can_incrementally_decode(data))
            .map(|decoder| decoder.fresh())
    }

    /// Number of registered animated coders.
    #[must_use]
    pub fn animated_len(&self) -> usize {
        self.animated.read().len()
    }
}

impl std::fmt::Debug for CoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.animated.read().iter().map(|c| c.name()).collect();
        f.debug_struct("CoderRegistry")
            .field("animated", &names)
            .field("progressive", &self.progressive.read().len())
            .finish()
    }
}
