//! The mixer itself: a fixed pool of layers, shared between one control
//! thread (which claims layers and pokes their atomics) and one audio
//! thread (which calls [`Mixer::mix`] once per audio callback).

use std::sync::Arc;

use portable_atomic::{AtomicF32, AtomicI32, AtomicU32, Ordering};
use rf_core::Sample;

use crate::accumulator::Accumulator;
#[cfg(feature = "simd")]
use crate::accumulator::{self, Carry};
use crate::alloc::{DefaultAllocator, LayerAllocator};
use crate::gain::gain_law;
use crate::kernel;
use crate::layer::{Flag, Layer, LayerHandle};

/// Number of bits of a [`LayerHandle`] that address a pool slot. The pool
/// holds `2^LBITS` layers; the remaining high bits of the handle are a
/// generation tag. 8 bits (256 layers) matches what a single audio
/// callback can realistically mix without falling behind real time.
pub const DEFAULT_LBITS: usize = 8;

/// Truncate toward negative infinity to a multiple of 4 frames — every
/// cursor/start/end/fade quantity in the engine is required to land on a
/// SIMD stride boundary.
#[inline]
fn truncate4(n: i32) -> i32 {
    n & !3
}

/// A fixed pool of `2^LBITS` layers mixed down to interleaved stereo.
///
/// Control-surface methods (`play`, `set_gain`, `set_state`, ...) take
/// `&self` and are safe to call from one control thread while
/// [`Mixer::mix`] runs concurrently on one audio thread — see the crate
/// docs for the concurrency model this relies on. Calling any
/// control-surface method from more than one thread at a time, or calling
/// `mix` from more than one thread (even sequentially-but-unsynchronized),
/// is undefined behavior by construction even though the type itself is
/// `Sync`.
pub struct Mixer<const LBITS: usize = DEFAULT_LBITS, A: LayerAllocator = DefaultAllocator> {
    layers: Box<[Layer]>,
    volume: AtomicF32,
    default_fade: AtomicI32,
    next_id: AtomicU32,
    acc: std::cell::UnsafeCell<Accumulator>,
    #[cfg(feature = "simd")]
    carry: std::cell::UnsafeCell<Carry>,
    _allocator: std::marker::PhantomData<A>,
}

// `layers`/`volume`/`default_fade`/`next_id` are all plain atomics or Sync
// types. `acc`/`carry` are UnsafeCells with no atomic protection at all,
// but `mix` is documented as single-audio-thread-only and every other
// method that could run concurrently with it never touches them.
unsafe impl<const LBITS: usize, A: LayerAllocator> Sync for Mixer<LBITS, A> {}

impl<const LBITS: usize, A: LayerAllocator + Default> Mixer<LBITS, A> {
    /// Build a mixer with the default allocator for `A`, initial
    /// `volume`, and default fade length `fade` (frames, truncated to a
    /// multiple of 4).
    pub fn new(volume: f32, fade: i32) -> Self {
        Self::with_allocator(A::default(), volume, fade)
    }
}

impl<const LBITS: usize, A: LayerAllocator + Default> Default for Mixer<LBITS, A> {
    fn default() -> Self {
        Self::new(1.0, 0)
    }
}

impl<const LBITS: usize, A: LayerAllocator> Mixer<LBITS, A> {
    /// Build a mixer whose layer pool is constructed by `allocator`.
    pub fn with_allocator(allocator: A, volume: f32, fade: i32) -> Self {
        let count = 1usize << LBITS;
        log::debug!("Mixer::with_allocator: {count} layers (LBITS={LBITS})");
        Self {
            layers: allocator.allocate(count),
            volume: AtomicF32::new(volume),
            default_fade: AtomicI32::new(truncate4(fade.max(0))),
            next_id: AtomicU32::new(1),
            acc: std::cell::UnsafeCell::new(Accumulator::new(0)),
            #[cfg(feature = "simd")]
            carry: std::cell::UnsafeCell::new(Carry::new()),
            _allocator: std::marker::PhantomData,
        }
    }

    /// Number of layers in the pool.
    pub fn capacity(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    fn mask(&self) -> u32 {
        (self.layers.len() - 1) as u32
    }

    /// Start `sample` playing in `flag` (one of `Stop`/`Halt`/`Play`/
    /// `Loop`) at `gain`/`pan`, over the sample's full length, using the
    /// mixer's current default fade length.
    ///
    /// Returns `None` if `flag` isn't one of the four live states or
    /// every layer in the pool is in use.
    pub fn play(&self, sample: Arc<Sample>, flag: Flag, gain: f32, pan: f32) -> Option<LayerHandle> {
        let end = sample.length() as i32;
        let fade = self.default_fade.load(Ordering::Acquire);
        self.play_advanced(sample, flag, gain, pan, 0, end, fade)
    }

    /// Start `sample` playing in `flag` over an explicit `[start, end)`
    /// window with its own fade length, in frames. A negative `start`
    /// pre-delays the layer: it produces silence until its cursor, which
    /// begins at `start`, counts up to 0.
    ///
    /// Rejects (returning `None`) a `flag` other than `Stop`/`Halt`/
    /// `Play`/`Loop`, a window shorter than 4 frames, or an `end` under 4
    /// frames. Otherwise scans forward from the mixer's internal id
    /// counter for the first free slot, claims it, and returns its
    /// handle — or `None` if every layer is in use.
    pub fn play_advanced(
        &self,
        sample: Arc<Sample>,
        flag: Flag,
        gain: f32,
        pan: f32,
        start: i32,
        end: i32,
        fade: i32,
    ) -> Option<LayerHandle> {
        if !matches!(flag, Flag::Stop | Flag::Halt | Flag::Play | Flag::Loop) {
            return None;
        }
        if end - start < 4 || end < 4 {
            return None;
        }

        let start = truncate4(start);
        let end = truncate4(end);
        let fmax = truncate4(fade.max(0));
        let (slot, id) = self.claim_slot()?;
        let layer = &self.layers[slot];

        let (gl, gr) = gain_law(gain, pan);
        // STOP/HALT start fully faded out; PLAY/LOOP start fully faded in.
        let fade0 = if matches!(flag, Flag::Stop | Flag::Halt) { 0 } else { fmax };

        layer.gain.store(gl, gr, Ordering::Relaxed);
        layer.cursor.store(start, Ordering::Relaxed);
        layer.id.store(id, Ordering::Relaxed);

        // SAFETY: this slot was just observed FREE by claim_slot, and no
        // other thread writes to a FREE layer's data, so the control
        // thread exclusively owns it until the flag publish below.
        let data = unsafe { layer.data_mut() };
        data.sample = Some(sample);
        data.start = start;
        data.end = end;
        data.fmax = fmax;
        data.fade = fade0;

        layer.flag.store(flag as u8, Ordering::Release);

        log::trace!("play_advanced: slot={slot} id={id} flag={flag:?}");
        LayerHandle::from_raw(id)
    }

    /// Update a live layer's gain/pan. Returns `false` if `handle` no
    /// longer addresses the layer it was issued for, or the layer is
    /// `Stop`ping (a layer already on its way out ignores further
    /// adjustments).
    pub fn set_gain(&self, handle: LayerHandle, gain: f32, pan: f32) -> bool {
        let Some(layer) = self.layer_for(handle) else {
            return false;
        };
        if layer.flag.load(Ordering::Acquire) <= Flag::Stop as u8 {
            return false;
        }
        let (gl, gr) = gain_law(gain, pan);
        layer.gain.store(gl, gr, Ordering::Release);
        true
    }

    /// Seek a live layer to `cursor`, clamped to `[start, end]` and
    /// truncated to a multiple of 4. Same validation and rejection rules
    /// as [`Mixer::set_gain`].
    pub fn set_cursor(&self, handle: LayerHandle, cursor: i32) -> bool {
        let Some(layer) = self.layer_for(handle) else {
            return false;
        };
        if layer.flag.load(Ordering::Acquire) <= Flag::Stop as u8 {
            return false;
        }
        // SAFETY: flag > Stop was just observed with Acquire, so start/end
        // (write-once at claim time) are stable and safe to read here.
        let (start, end) = {
            let data = unsafe { layer.data() };
            (data.start, data.end)
        };
        let clamped = truncate4(cursor.clamp(start, end));
        layer.cursor.store(clamped, Ordering::Release);
        true
    }

    /// Move a live layer to `new_state`. Idempotent: if the layer is
    /// already in `new_state`, returns `true` without touching the atomic.
    /// Returns `false` if `new_state` is `Free`, `handle` is stale, or the
    /// layer has already been reclaimed.
    pub fn set_state(&self, handle: LayerHandle, new_state: Flag) -> bool {
        if new_state == Flag::Free {
            return false;
        }
        let Some(layer) = self.layer_for(handle) else {
            return false;
        };
        let current = layer.flag.load(Ordering::Acquire);
        if current == Flag::Free as u8 {
            // Already reclaimed — there's nothing live left to move.
            return false;
        }
        if current == new_state as u8 {
            return true;
        }
        layer
            .flag
            .compare_exchange(current, new_state as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move every layer whose flag is above `Stop` (i.e. `Halt`/`Play`/
    /// `Loop`) to `Stop`; the audio thread fades it out and reclaims it.
    pub fn stop_all(&self) {
        for layer in self.layers.iter() {
            if layer.flag.load(Ordering::Acquire) > Flag::Stop as u8 {
                layer.flag.store(Flag::Stop as u8, Ordering::Release);
            }
        }
    }

    /// Move every `Play`/`Loop` layer to `Halt` — fading out like `Stop`,
    /// but recoverable with [`Mixer::resume_all`].
    pub fn halt_all(&self) {
        for layer in self.layers.iter() {
            let current = layer.flag.load(Ordering::Acquire);
            if current == Flag::Play as u8 || current == Flag::Loop as u8 {
                let _ =
                    layer
                        .flag
                        .compare_exchange(current, Flag::Halt as u8, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    /// Move every `Halt`ed layer to `Play`. Layers in `Loop` or `Stop` are
    /// unaffected. The fade counter is left untouched, so a layer
    /// interrupted mid-fade-out resumes its fade-in from the same
    /// loudness it had faded to.
    pub fn resume_all(&self) {
        for layer in self.layers.iter() {
            let _ =
                layer
                    .flag
                    .compare_exchange(Flag::Halt as u8, Flag::Play as u8, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Set the mixer-wide linear volume multiplier applied to every
    /// layer during `mix`.
    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume, Ordering::Release);
    }

    /// Set the fade-in/out length (in frames, truncated to a multiple of
    /// 4) used by `play` for layers that don't specify their own via
    /// `play_advanced`.
    pub fn set_default_fade(&self, frames: i32) {
        self.default_fade.store(truncate4(frames.max(0)), Ordering::Release);
    }

    fn layer_for(&self, handle: LayerHandle) -> Option<&Layer> {
        let slot = (handle.get() & self.mask()) as usize;
        let layer = &self.layers[slot];
        if layer.id.load(Ordering::Relaxed) != handle.get() {
            return None;
        }
        Some(layer)
    }

    /// Walk forward from the mixer's id counter, trying up to one full
    /// pool's worth of candidate ids; the first whose slot is `Free` is
    /// claimed. Handle `0` is never issued — if the winning candidate
    /// happens to be `0`, `2^LBITS` is substituted.
    fn claim_slot(&self) -> Option<(usize, u32)> {
        let count = self.layers.len();
        let mut id = self.next_id.load(Ordering::Relaxed);
        for _ in 0..count {
            let slot = (id & self.mask()) as usize;
            if self.layers[slot].flag.load(Ordering::Acquire) == Flag::Free as u8 {
                self.next_id.store(id.wrapping_add(1), Ordering::Relaxed);
                let published = if id == 0 { count as u32 } else { id };
                return Some((slot, published));
            }
            id = id.wrapping_add(1);
        }
        self.next_id.store(id, Ordering::Relaxed);
        None
    }

    /// Mix up to `n` stereo frames into `out` (interleaved `[L, R, ...]`,
    /// at least `2 * n` floats long) and return how many frames were
    /// written. Always audio-thread-only; never allocates.
    ///
    /// In the `simd` build the internal accumulator is padded up to a
    /// multiple of 4 frames and any overshoot is carried into the next call;
    /// the scalar kernel has no stride to pad for, so the non-`simd` build
    /// skips the carry path entirely and sizes the accumulator to exactly
    /// `n` frames.
    pub fn mix(&self, out: &mut [f32], n: usize) -> usize {
        debug_assert!(
            out.len() >= n * 2,
            "output buffer too short for {n} interleaved stereo frames"
        );

        // SAFETY: `mix` is documented as callable from exactly one
        // (audio) thread; nothing else ever touches `acc`/`carry`.
        let acc = unsafe { &mut *self.acc.get() };
        #[cfg(feature = "simd")]
        let carry = unsafe { &mut *self.carry.get() };

        #[cfg(feature = "simd")]
        let mut produced = carry.drain_into(out, n);
        #[cfg(not(feature = "simd"))]
        let mut produced = 0usize;

        if produced == n {
            return produced;
        }

        let remaining = n - produced;
        #[cfg(feature = "simd")]
        let capacity = accumulator::asize(remaining);
        #[cfg(not(feature = "simd"))]
        let capacity = remaining;

        acc.ensure_capacity(capacity);
        acc.clear(capacity);

        let volume = self.volume.load(Ordering::Acquire);
        for layer in self.layers.iter() {
            kernel::mix_layer(layer, volume, acc, capacity);
        }

        #[cfg(feature = "clip")]
        acc.clip(capacity);

        acc.interleave_into(&mut out[produced * 2..], remaining);
        produced += remaining;

        #[cfg(feature = "simd")]
        if capacity > remaining {
            carry.stash(acc, remaining, capacity);
        }

        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_sample(frames: usize) -> Arc<Sample> {
        Arc::new(Sample::new(1, &vec![0.0f32; frames], frames).unwrap())
    }

    fn tone(frames: usize) -> Arc<Sample> {
        let data: Vec<f32> = (0..frames).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        Arc::new(Sample::new(1, &data, frames).unwrap())
    }

    #[test]
    fn silence_in_silence_out() {
        let mixer: Mixer<4, DefaultAllocator> = Mixer::default();
        let handle = mixer.play(silent_sample(64), Flag::Loop, 1.0, 0.0);
        assert!(handle.is_some());
        let mut out = vec![1.0f32; 128];
        mixer.mix(&mut out, 64);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn steady_state_mono_loop_matches_expected_gain() {
        let mixer: Mixer<4, DefaultAllocator> = Mixer::default();
        let sample = Arc::new(Sample::new(1, &[0.5, 0.5, 0.5, 0.5], 4).unwrap());
        mixer.play(sample, Flag::Loop, 1.0, 0.0);
        let mut out = vec![0.0f32; 16];
        mixer.mix(&mut out, 8);
        for &s in &out {
            assert!((s - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        assert_eq!(mixer.capacity(), 4);
        let sample = tone(16);
        for _ in 0..4 {
            assert!(mixer.play(sample.clone(), Flag::Loop, 1.0, 0.0).is_some());
        }
        assert!(mixer.play(sample, Flag::Loop, 1.0, 0.0).is_none());
    }

    #[test]
    fn stale_handle_after_stop_and_reclaim_is_rejected() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        let sample = tone(16);
        let handle = mixer.play(sample.clone(), Flag::Play, 1.0, 0.0).unwrap();
        mixer.set_state(handle, Flag::Stop);

        // Drive the layer fully through its fade-out to free the slot.
        let mut out = vec![0.0f32; 64];
        for _ in 0..8 {
            mixer.mix(&mut out, 16);
        }

        // Claim every slot; one of them reuses the freed index with a
        // new id, so the old handle must no longer validate.
        let mut last = None;
        for _ in 0..4 {
            last = mixer.play(sample.clone(), Flag::Loop, 1.0, 0.0);
        }
        assert!(last.is_some());
        assert!(!mixer.set_gain(handle, 0.5, 0.0));
    }

    #[test]
    fn set_state_is_idempotent() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        let handle = mixer.play(tone(16), Flag::Loop, 1.0, 0.0).unwrap();
        assert!(mixer.set_state(handle, Flag::Loop));
        assert!(mixer.set_state(handle, Flag::Halt));
        assert!(mixer.set_state(handle, Flag::Halt));
    }

    #[test]
    fn set_state_rejects_free_as_a_target() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        let handle = mixer.play(tone(16), Flag::Play, 1.0, 0.0).unwrap();
        assert!(!mixer.set_state(handle, Flag::Free));
    }

    #[test]
    fn looping_layer_survives_many_window_wraps() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        let handle = mixer.play(tone(8), Flag::Loop, 1.0, 0.0);
        assert!(handle.is_some());
        let mut out = vec![0.0f32; 256];
        for _ in 0..20 {
            let produced = mixer.mix(&mut out, 128);
            assert_eq!(produced, 128);
        }
        assert!(out.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn halt_then_resume_lands_on_play() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        let handle = mixer.play(tone(8), Flag::Loop, 1.0, 0.0).unwrap();
        mixer.halt_all();
        let mut out = vec![0.0f32; 32];
        mixer.mix(&mut out, 16);
        mixer.resume_all();
        // A resumed layer must still answer to its original handle.
        assert!(mixer.set_gain(handle, 0.8, 0.0));
    }

    #[test]
    fn predelay_produces_silence_for_the_delayed_frames() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        let sample = Arc::new(Sample::new(1, &[1.0; 16], 16).unwrap());
        mixer
            .play_advanced(sample, Flag::Play, 1.0, 0.0, -64, 16, 0)
            .unwrap();
        let mut out = vec![9.0f32; 128];
        mixer.mix(&mut out, 64);
        assert!(out[..64].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn play_advanced_rejects_too_narrow_a_window() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        let sample = tone(16);
        assert!(mixer.play_advanced(sample, Flag::Play, 1.0, 0.0, 0, 2, 0).is_none());
    }

    #[test]
    fn play_rejects_a_free_initial_flag() {
        let mixer: Mixer<2, DefaultAllocator> = Mixer::default();
        assert!(mixer.play(tone(16), Flag::Free, 1.0, 0.0).is_none());
    }
}
