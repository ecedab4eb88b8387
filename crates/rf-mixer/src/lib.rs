//! Wait-free, real-time layer mixing engine.
//!
//! A [`Mixer`] owns a fixed pool of layers, each playing at most one PCM
//! [`rf_core::Sample`]. One control thread claims layers and pokes their
//! gain/cursor/state; one audio thread calls [`Mixer::mix`] once per
//! callback to pull the next block of interleaved stereo audio. The two
//! sides never share a lock — every cross-thread field is an atomic, and
//! the one non-atomic payload per layer (the sample handle, its
//! start/end/fade window) is published with a release-store of that
//! layer's state flag and picked up with an acquire-load, the same
//! triple-buffer-style publish pattern used elsewhere for single-writer
//! real-time state.
//!
//! `mix` never allocates: the accumulator and leftover-frame carry are
//! pre-sized scratch space owned by the mixer, grown (if at all) only the
//! first time a given frame count is requested.
//!
//! # Cargo features
//! - `simd` (default): mix in strides of 4 frames with the `wide` crate
//!   instead of 1 frame at a time.
//! - `clip` (default): saturate the mix accumulator to `[-1, 1]` before
//!   it's copied into the caller's output buffer.

mod accumulator;
mod alloc;
mod gain;
mod kernel;
mod layer;
mod mixer;

pub use alloc::{DefaultAllocator, LayerAllocator};
pub use gain::gain_law;
pub use layer::{Flag, Layer, LayerHandle};
pub use mixer::{DEFAULT_LBITS, Mixer};

pub use rf_core::{Sample, SampleError, SampleResult};
