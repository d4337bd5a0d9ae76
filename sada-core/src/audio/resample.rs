//! Capture-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Microphones usually run at 44.1 or 48 kHz while the live channel wants
//! 16 kHz mono. `RateConverter` runs on the capture framing thread, where
//! allocation is allowed. When the rates already match it is a passthrough
//! and no rubato state is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, SadaError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    pending: Vec<f32>,
    /// Input frames rubato consumes per call.
    chunk_size: usize,
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `SadaError::AudioStream` if rubato rejects the ratio or chunk size.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| SadaError::AudioStream(format!("resampler init: {e}")))?;

        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
        tracing::info!(from_rate, to_rate, chunk_size, "capture resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Feed samples; returns whatever full chunks produced (may be empty).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let input = &self.pending[..self.chunk_size];
            match resampler.process_into_buffer(&[input], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => out.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.chunk_size);
        }
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
