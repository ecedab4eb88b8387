//! A single slot in the mixer's fixed layer pool.
//!
//! A layer is published from the control thread to the audio thread by a
//! release-store of `flag`; the audio thread observes it with an
//! acquire-load at the top of the mixing kernel (§4.5/§5 of the design).
//! Everything written before that release store — `sample`, `start`,
//! `end`, `fmax`, the initial `fade`, `gain`, `cursor` and `id` — becomes
//! visible to the audio thread at that point. This is the same
//! publish/acquire pattern as a triple buffer, just without the extra
//! index bookkeeping because only one side ever writes a given field.

use std::cell::UnsafeCell;
use std::num::NonZeroU32;
use std::sync::Arc;

use portable_atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};

use rf_core::Sample;

/// Playback state of a layer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Slot is unused; only the control thread may touch it.
    Free = 0,
    /// Fading out, reclaimed once the fade (and sample) finish.
    Stop = 1,
    /// Fading out, but recoverable — resuming re-initiates a fade-in.
    Halt = 2,
    /// Playing once through `[start, end)`.
    Play = 3,
    /// Playing and wrapping back to `start` at `end`.
    Loop = 4,
}

impl Flag {
    #[inline]
    pub(crate) fn from_u8(v: u8) -> Option<Flag> {
        match v {
            0 => Some(Flag::Free),
            1 => Some(Flag::Stop),
            2 => Some(Flag::Halt),
            3 => Some(Flag::Play),
            4 => Some(Flag::Loop),
            _ => None,
        }
    }
}

/// Handle to a claimed layer, returned by `Mixer::play`/`play_advanced`.
///
/// The low bits address the slot; the remaining bits are a generation tag
/// that makes a handle to a since-reclaimed (and possibly reused) slot
/// reject instead of silently addressing the wrong sound. `0` never
/// denotes a live handle, so `Option<LayerHandle>` is the same size as a
/// raw `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerHandle(NonZeroU32);

impl LayerHandle {
    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// The raw 32-bit id this handle was issued with.
    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Fields owned by whichever thread currently holds the layer:
/// the control thread while `flag == Free`, the audio thread for the
/// duration of one publish. `sample`/`start`/`end`/`fmax` are written
/// once at claim time and read-only afterward; `fade` is mutated only by
/// the audio thread.
pub(crate) struct LayerData {
    pub(crate) sample: Option<Arc<Sample>>,
    pub(crate) start: i32,
    pub(crate) end: i32,
    pub(crate) fade: i32,
    pub(crate) fmax: i32,
}

impl LayerData {
    const fn empty() -> Self {
        Self {
            sample: None,
            start: 0,
            end: 0,
            fade: 0,
            fmax: 0,
        }
    }
}

/// A packed pair of per-channel linear gains, read and written as a
/// single atomic unit so the audio thread never observes a torn
/// left/right pair. A portable 64-bit atomic is used rather than two
/// independent `AtomicF32`s, per the design note on packed gain pairs.
pub(crate) struct AtomicGainPair(AtomicU64);

impl AtomicGainPair {
    fn new(left: f32, right: f32) -> Self {
        Self(AtomicU64::new(pack(left, right)))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> (f32, f32) {
        unpack(self.0.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, left: f32, right: f32, order: Ordering) {
        self.0.store(pack(left, right), order);
    }
}

#[inline]
fn pack(left: f32, right: f32) -> u64 {
    ((left.to_bits() as u64) << 32) | right.to_bits() as u64
}

#[inline]
fn unpack(bits: u64) -> (f32, f32) {
    (
        f32::from_bits((bits >> 32) as u32),
        f32::from_bits(bits as u32),
    )
}

/// One slot in the mixer's fixed layer table.
///
/// Public only so a custom [`crate::LayerAllocator`] can name the type it
/// builds; every field and method stays crate-private.
pub struct Layer {
    pub(crate) id: AtomicU32,
    pub(crate) flag: AtomicU8,
    pub(crate) cursor: AtomicI32,
    pub(crate) gain: AtomicGainPair,
    data: UnsafeCell<LayerData>,
}

impl Layer {
    /// A fresh, `Free` layer. The only public constructor — a
    /// [`crate::LayerAllocator`] builds the pool out of these, it never
    /// has to (or gets to) touch a layer's internals directly.
    pub fn new() -> Self {
        Self {
            id: AtomicU32::new(0),
            flag: AtomicU8::new(Flag::Free as u8),
            cursor: AtomicI32::new(0),
            gain: AtomicGainPair::new(0.0, 0.0),
            data: UnsafeCell::new(LayerData::empty()),
        }
    }

    /// # Safety
    /// The caller must hold the side of the publish protocol that owns
    /// `LayerData` right now: the control thread while `flag == Free`
    /// (checked with at least an acquire load), or the audio thread after
    /// observing a non-`Free` `flag` with acquire ordering.
    #[inline]
    pub(crate) unsafe fn data(&self) -> &LayerData {
        unsafe { &*self.data.get() }
    }

    /// # Safety
    /// Same contract as [`Layer::data`].
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut LayerData {
        unsafe { &mut *self.data.get() }
    }
}

// Synchronization is established entirely through `flag`'s release/acquire
// pair (see the module docs); the `UnsafeCell` inside never aliases across
// threads while it is being mutated.
unsafe impl Sync for Layer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_pair_round_trips_through_the_packed_atomic() {
        let pair = AtomicGainPair::new(0.25, -0.75);
        assert_eq!(pair.load(Ordering::Acquire), (0.25, -0.75));
        pair.store(1.0, 0.0, Ordering::Release);
        assert_eq!(pair.load(Ordering::Acquire), (1.0, 0.0));
    }

    #[test]
    fn flag_round_trips_through_u8() {
        for f in [Flag::Free, Flag::Stop, Flag::Halt, Flag::Play, Flag::Loop] {
            assert_eq!(Flag::from_u8(f as u8), Some(f));
        }
        assert_eq!(Flag::from_u8(5), None);
    }

    #[test]
    fn zero_is_never_a_live_handle() {
        assert!(LayerHandle::from_raw(0).is_none());
        assert!(LayerHandle::from_raw(1).is_some());
    }
}
