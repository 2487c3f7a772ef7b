use rubato::{FftFixedIn, Resampler};

use super::error::SessionError;

/// Mono sample-rate conversion for a continuous stream.
///
/// rubato wants fixed-size input chunks; input is queued until a full chunk
/// is available so nothing is zero-padded mid-stream.
pub struct RateConverter {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl RateConverter {
    /// `chunk_ms` sets the conversion granularity (and latency).
    pub fn new(from_rate: u32, to_rate: u32, chunk_ms: u32) -> Result<Self, SessionError> {
        if from_rate == to_rate {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
            });
        }
        let chunk_size = ((from_rate * chunk_ms) / 1000).max(1) as usize;
        let inner = FftFixedIn::new(
            from_rate as usize,
            to_rate as usize,
            chunk_size,
            1, // sub_chunks
            1, // mono
        )
        .map_err(|e| SessionError::Audio(format!("failed to create resampler: {}", e)))?;

        Ok(Self {
            inner: Some(inner),
            pending: Vec::with_capacity(chunk_size * 2),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Convert `input`, appending whatever output is ready to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(inner) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return;
        };

        self.pending.extend_from_slice(input);
        loop {
            let needed = inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match inner.process(&[chunk], None) {
                Ok(converted) => {
                    if let Some(channel) = converted.first() {
                        out.extend_from_slice(channel);
                    }
                }
                Err(e) => {
                    log::error!("Resample failed: {}", e);
                }
            }
        }
    }

    /// Drop queued input, e.g. when playback is cut off.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}
