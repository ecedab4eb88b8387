//! Audio-thread inner loop: reads one layer's sample data through its
//! current cursor/fade state and accumulates it into the mix buffer.
//!
//! Two control-flow shapes cover all four kernels from the design
//! (play/fade-out crossed with mono/stereo): [`play`] and [`fade_out`]
//! handle the cursor/fade bookkeeping, each stepping forward in strides of
//! [`STRIDE`] frames; the mono/stereo difference is confined to
//! [`contribute`], which is the only place a `#[cfg(feature = "simd")]`
//! split is needed.

use portable_atomic::Ordering;
use rf_core::Sample;

use crate::accumulator::Accumulator;
use crate::layer::{Flag, Layer};

#[cfg(feature = "simd")]
pub(crate) const STRIDE: i32 = 4;
#[cfg(not(feature = "simd"))]
pub(crate) const STRIDE: i32 = 1;

/// Advance a playing (or looping) layer by up to `capacity` frames.
/// Returns the new `(cursor, fade)`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn play(
    sample: &Sample,
    mut cursor: i32,
    mut fade: i32,
    fmax: i32,
    start: i32,
    end: i32,
    looping: bool,
    gl: f32,
    gr: f32,
    acc: &mut Accumulator,
    capacity: usize,
) -> (i32, i32) {
    let len = sample.length() as i32;
    let mut i = 0usize;
    while i + STRIDE as usize <= capacity {
        if cursor == end {
            if looping {
                cursor = start;
            } else {
                break;
            }
        }
        if cursor >= 0 {
            let idx = (cursor as usize) % len as usize;
            let ratio = if fade < fmax {
                fade as f32 / fmax as f32
            } else {
                1.0
            };
            contribute(sample, idx, gl, gr, ratio, acc, i);
            if fade < fmax {
                fade = (fade + STRIDE).min(fmax);
            }
        }
        cursor += STRIDE;
        i += STRIDE as usize;
    }
    (cursor, fade)
}

/// Advance a stopping/halting layer's fade-out by up to `capacity` frames.
/// Returns the new `(cursor, fade)`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fade_out(
    sample: &Sample,
    mut cursor: i32,
    mut fade: i32,
    fmax: i32,
    end: i32,
    gl: f32,
    gr: f32,
    acc: &mut Accumulator,
    capacity: usize,
) -> (i32, i32) {
    let len = sample.length() as i32;
    // Decided once at entry: if there isn't enough sample left to run the
    // fade to completion, play the tail at full gain and stop dead at
    // `end` instead of clipping the envelope.
    let full_gain_tail = fade >= (end - cursor);
    let mut i = 0usize;
    while i + STRIDE as usize <= capacity {
        if full_gain_tail {
            if cursor == end {
                break;
            }
        } else if fade == 0 {
            break;
        }
        if cursor >= 0 {
            let idx = (cursor as usize) % len as usize;
            let ratio = if full_gain_tail {
                1.0
            } else {
                fade as f32 / fmax as f32
            };
            contribute(sample, idx, gl, gr, ratio, acc, i);
            if !full_gain_tail {
                fade -= STRIDE;
            }
        }
        cursor += STRIDE;
        i += STRIDE as usize;
    }
    (cursor, fade)
}

#[inline]
fn contribute(sample: &Sample, idx: usize, gl: f32, gr: f32, ratio: f32, acc: &mut Accumulator, i: usize) {
    #[cfg(feature = "simd")]
    contribute_simd(sample, idx, gl, gr, ratio, acc, i);
    #[cfg(not(feature = "simd"))]
    contribute_scalar(sample, idx, gl, gr, ratio, acc, i);
}

#[cfg(not(feature = "simd"))]
fn contribute_scalar(sample: &Sample, idx: usize, gl: f32, gr: f32, ratio: f32, acc: &mut Accumulator, i: usize) {
    let (l_in, r_in) = if sample.channels() == 1 {
        let v = sample.channel_sample(idx, 0);
        (v, v)
    } else {
        (sample.channel_sample(idx, 0), sample.channel_sample(idx, 1))
    };
    acc.left[i] += l_in * gl * ratio;
    acc.right[i] += r_in * gr * ratio;
}

#[cfg(feature = "simd")]
fn contribute_simd(sample: &Sample, idx: usize, gl: f32, gr: f32, ratio: f32, acc: &mut Accumulator, i: usize) {
    use wide::f32x4;

    let data = sample.data();
    let (l_in, r_in) = if sample.channels() == 1 {
        let v = f32x4::from([data[idx], data[idx + 1], data[idx + 2], data[idx + 3]]);
        (v, v)
    } else {
        let l = f32x4::from([
            data[idx * 2],
            data[idx * 2 + 2],
            data[idx * 2 + 4],
            data[idx * 2 + 6],
        ]);
        let r = f32x4::from([
            data[idx * 2 + 1],
            data[idx * 2 + 3],
            data[idx * 2 + 5],
            data[idx * 2 + 7],
        ]);
        (l, r)
    };

    let acc_l = f32x4::from(<[f32; 4]>::try_from(&acc.left[i..i + 4]).unwrap());
    let acc_r = f32x4::from(<[f32; 4]>::try_from(&acc.right[i..i + 4]).unwrap());
    let out_l = acc_l + l_in * f32x4::splat(gl * ratio);
    let out_r = acc_r + r_in * f32x4::splat(gr * ratio);
    acc.left[i..i + 4].copy_from_slice(&out_l.to_array());
    acc.right[i..i + 4].copy_from_slice(&out_r.to_array());
}

/// Mix one layer's contribution for this call, dispatching on its current
/// state. Runs entirely on the audio thread: the only cross-thread writes
/// are the cursor publish-back (a CAS that a concurrent control-thread
/// seek can win) and the terminal `flag` store when a layer finishes.
pub(crate) fn mix_layer(layer: &Layer, global_volume: f32, acc: &mut Accumulator, capacity: usize) {
    let flag_raw = layer.flag.load(Ordering::Acquire);
    let Some(flag) = Flag::from_u8(flag_raw) else {
        return;
    };
    if flag == Flag::Free {
        return;
    }

    let cursor0 = layer.cursor.load(Ordering::Acquire);
    let (gl, gr) = layer.gain.load(Ordering::Acquire);
    let gl = gl * global_volume;
    let gr = gr * global_volume;

    // SAFETY: flag != Free was just observed with Acquire, so this layer
    // was published by play_advanced and its data is stable for the
    // duration of this call (fade is the only field we mutate further).
    let data = unsafe { layer.data() };
    let Some(sample) = data.sample.as_ref() else {
        return;
    };
    let (start, end, fmax) = (data.start, data.end, data.fmax);

    match flag {
        Flag::Free => unreachable!(),
        Flag::Stop | Flag::Halt => {
            let fade0 = data.fade;
            if fade0 > 0 || cursor0 < end {
                let (new_cursor, new_fade) =
                    fade_out(sample, cursor0, fade0, fmax, end, gl, gr, acc, capacity);
                unsafe { layer.data_mut() }.fade = new_fade;
                let settled_cursor = publish_cursor(layer, cursor0, new_cursor);
                if flag == Flag::Stop && (new_fade == 0 || settled_cursor == end) {
                    layer.flag.store(Flag::Free as u8, Ordering::Release);
                }
            } else if flag == Flag::Stop {
                layer.flag.store(Flag::Free as u8, Ordering::Release);
            }
        }
        Flag::Play | Flag::Loop => {
            let fade0 = data.fade;
            let looping = flag == Flag::Loop;
            let (new_cursor, new_fade) =
                play(sample, cursor0, fade0, fmax, start, end, looping, gl, gr, acc, capacity);
            unsafe { layer.data_mut() }.fade = new_fade;
            let settled_cursor = publish_cursor(layer, cursor0, new_cursor);
            if flag == Flag::Play && settled_cursor == end {
                let _ = layer.flag.compare_exchange(
                    Flag::Play as u8,
                    Flag::Free as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }
}

/// Publish the kernel's new cursor with a CAS against the value it was
/// read with. A concurrent `set_cursor`/seek from the control thread wins
/// the race and its value is kept instead of being clobbered.
fn publish_cursor(layer: &Layer, old: i32, new: i32) -> i32 {
    match layer
        .cursor
        .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => new,
        Err(actual) => actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_core::Sample;

    fn mono_ramp() -> Sample {
        // 8 frames so a single SIMD or scalar pass has room to loop at least once.
        Sample::new(1, &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8], 8).unwrap()
    }

    #[test]
    fn play_once_through_stops_at_end_without_looping() {
        let sample = mono_ramp();
        let mut acc = Accumulator::new(8);
        let (cursor, fade) = play(&sample, 0, 0, 0, 0, 8, false, 1.0, 1.0, &mut acc, 8);
        assert_eq!(cursor, 8);
        assert_eq!(fade, 0);
        assert!(acc.left[0] > 0.0);
    }

    #[test]
    fn loop_wraps_cursor_back_to_start() {
        let sample = mono_ramp();
        let mut acc = Accumulator::new(16);
        // 16 frames is exactly two trips through the 8-frame sample under
        // either stride, landing back on the wrap boundary both times.
        let (cursor, _) = play(&sample, 0, 0, 0, 0, 8, true, 1.0, 1.0, &mut acc, 16);
        assert_eq!(cursor, 8);
        assert!(acc.left.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn pre_delay_produces_silence_until_cursor_reaches_zero() {
        let sample = mono_ramp();
        let mut acc = Accumulator::new(8);
        let stride = STRIDE;
        let (cursor, _) = play(&sample, -(stride), 0, 0, 0, 8, false, 1.0, 1.0, &mut acc, 8);
        assert_eq!(acc.left[0], 0.0);
        assert_eq!(cursor, 8 - stride);
    }

    #[test]
    fn fade_out_reaches_zero_and_stops_contributing() {
        let sample = mono_ramp();
        let mut acc = Accumulator::new(8);
        // fmax=4 is comfortably less than end-cursor=8, so this always
        // takes the ramp branch and divides evenly under either stride.
        let (_, fade) = fade_out(&sample, 0, 4, 4, 8, 1.0, 1.0, &mut acc, 8);
        assert_eq!(fade, 0);
    }

    #[test]
    fn fade_out_too_close_to_end_plays_tail_at_full_gain() {
        let sample = mono_ramp();
        let mut acc = Accumulator::new(8);
        // end - cursor is smaller than fade: full-gain tail, no envelope.
        let (cursor, fade) = fade_out(&sample, 4, 100, 100, 8, 1.0, 1.0, &mut acc, 8);
        assert_eq!(cursor, 8);
        assert_eq!(fade, 100);
    }
}
