//! Pluggable construction of the fixed layer pool.
//!
//! `Mixer::new` needs `2^LBITS` [`Layer`](crate::layer::Layer)s up front,
//! all `Free`, with no allocation afterward on the audio thread. The
//! default allocator just does that with a `Vec`; this trait exists so an
//! embedder with stricter startup requirements (a pre-reserved arena, a
//! pool shared across multiple mixers) can swap in their own strategy
//! without touching the mixer itself.

use crate::layer::Layer;

/// Builds the backing storage for a mixer's layer pool.
pub trait LayerAllocator {
    /// Produce `count` freshly constructed, `Free` layers.
    fn allocate(&self, count: usize) -> Box<[Layer]>;
}

/// Allocates the pool with a plain heap `Vec`. Used unless the caller
/// picks a different [`LayerAllocator`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl LayerAllocator for DefaultAllocator {
    fn allocate(&self, count: usize) -> Box<[Layer]> {
        let mut layers = Vec::with_capacity(count);
        layers.resize_with(count, Layer::new);
        layers.into_boxed_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::Ordering;

    #[test]
    fn default_allocator_produces_free_layers() {
        let layers = DefaultAllocator.allocate(4);
        assert_eq!(layers.len(), 4);
        for layer in layers.iter() {
            assert_eq!(layer.flag.load(Ordering::Acquire), crate::layer::Flag::Free as u8);
        }
    }
}
