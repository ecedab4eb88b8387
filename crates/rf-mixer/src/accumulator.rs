//! Per-`mix()` scratch buffer: a planar stereo float accumulator plus the
//! leftover-frame carry that lets the SIMD kernels always work in whole
//! strides of 4 even when the caller asks for a frame count that isn't a
//! multiple of 4.

/// Round `n` up to the next multiple of 4.
#[inline]
pub(crate) fn asize(n: usize) -> usize {
    (n + 3) & !3
}

/// Planar (non-interleaved) stereo accumulator, sized to a multiple of 4
/// frames. Layers add into it; `mix()` clips and interleaves it into the
/// caller's output buffer at the end of the pipeline.
pub(crate) struct Accumulator {
    pub(crate) left: Vec<f32>,
    pub(crate) right: Vec<f32>,
}

impl Accumulator {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            left: vec![0.0; capacity],
            right: vec![0.0; capacity],
        }
    }

    pub(crate) fn ensure_capacity(&mut self, capacity: usize) {
        if self.left.len() < capacity {
            self.left.resize(capacity, 0.0);
            self.right.resize(capacity, 0.0);
        }
    }

    pub(crate) fn clear(&mut self, capacity: usize) {
        self.left[..capacity].fill(0.0);
        self.right[..capacity].fill(0.0);
    }

    #[cfg(feature = "clip")]
    pub(crate) fn clip(&mut self, capacity: usize) {
        for s in &mut self.left[..capacity] {
            *s = s.clamp(-1.0, 1.0);
        }
        for s in &mut self.right[..capacity] {
            *s = s.clamp(-1.0, 1.0);
        }
    }

    /// Interleave the first `n` frames into `out` as `[L, R, L, R, ...]`.
    pub(crate) fn interleave_into(&self, out: &mut [f32], n: usize) {
        for i in 0..n {
            out[i * 2] = self.left[i];
            out[i * 2 + 1] = self.right[i];
        }
    }
}

/// Carries frames produced past the caller's requested count (because the
/// SIMD stride rounded the mix up to a multiple of 4) over to the start
/// of the next `mix()` call, so no audio is ever dropped or reordered.
pub(crate) struct Carry {
    left: [f32; 3],
    right: [f32; 3],
    len: usize,
}

impl Carry {
    pub(crate) fn new() -> Self {
        Self {
            left: [0.0; 3],
            right: [0.0; 3],
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Copy up to `n` carried frames into `out`'s first `2*n` floats,
    /// interleaved. Returns how many frames were drained.
    pub(crate) fn drain_into(&mut self, out: &mut [f32], n: usize) -> usize {
        let take = self.len.min(n);
        for i in 0..take {
            out[i * 2] = self.left[i];
            out[i * 2 + 1] = self.right[i];
        }
        let remaining = self.len - take;
        self.left.copy_within(take..self.len, 0);
        self.right.copy_within(take..self.len, 0);
        self.len = remaining;
        take
    }

    /// Stash accumulator frames `[from, to)` for the next call.
    pub(crate) fn stash(&mut self, acc: &Accumulator, from: usize, to: usize) {
        let n = to - from;
        debug_assert!(n <= 3);
        self.left[..n].copy_from_slice(&acc.left[from..to]);
        self.right[..n].copy_from_slice(&acc.right[from..to]);
        self.len = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asize_rounds_up_to_multiple_of_four() {
        assert_eq!(asize(0), 0);
        assert_eq!(asize(1), 4);
        assert_eq!(asize(4), 4);
        assert_eq!(asize(5), 8);
        assert_eq!(asize(257), 260);
    }

    #[test]
    fn carry_drains_in_fifo_order() {
        let mut acc = Accumulator::new(4);
        acc.left[..4].copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        acc.right[..4].copy_from_slice(&[-0.1, -0.2, -0.3, -0.4]);
        let mut carry = Carry::new();
        carry.stash(&acc, 2, 4);
        assert_eq!(carry.len(), 2);

        let mut out = vec![0.0f32; 4];
        let drained = carry.drain_into(&mut out, 1);
        assert_eq!(drained, 1);
        assert_eq!(&out[..2], &[0.3, -0.3]);
        assert_eq!(carry.len(), 1);

        let drained = carry.drain_into(&mut out, 4);
        assert_eq!(drained, 1);
        assert_eq!(&out[..2], &[0.4, -0.4]);
        assert_eq!(carry.len(), 0);
    }
}
