//! Error types for sample construction.

use thiserror::Error;

/// Rejected [`Sample`](crate::Sample) construction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleError {
    #[error("channel count must be 1 (mono) or 2 (stereo), got {0}")]
    InvalidChannelCount(u8),

    #[error("frame count must be at least 1, got {0}")]
    InvalidFrameCount(usize),

    #[error("data buffer too short: expected at least {expected} floats, got {actual}")]
    DataTooShort { expected: usize, actual: usize },
}

/// Result type alias for sample construction.
pub type SampleResult<T> = Result<T, SampleError>;
