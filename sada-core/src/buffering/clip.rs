//! Decoded audio clip handed to the output context.

/// Normalised floating-point audio at a known sample rate.
///
/// Clips are immutable once decoded; loading new audio replaces the whole
/// clip (callers hold it behind an `Arc` and swap the `Arc`).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// One `Vec<f32>` per channel, each `frame_count` long, samples in [-1.0, 1.0].
    channels: Vec<Vec<f32>>,
    /// Sample rate in Hz (e.g. 16000, 24000).
    sample_rate: u32,
}

impl AudioClip {
    /// Build a clip from de-interleaved channel data.
    ///
    /// Channels shorter than the first are padded with silence so every
    /// channel has the same frame count.
    pub fn new(mut channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        if channels.is_empty() {
            channels.push(Vec::new());
        }
        let frames = channels.iter().map(Vec::len).max().unwrap_or(0);
        for ch in &mut channels {
            ch.resize(frames, 0.0);
        }
        Self {
            channels,
            sample_rate: sample_rate.max(1),
        }
    }

    /// Mono clip from a single sample slice.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels[0].len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Duration in seconds, always derived from the frame count.
    pub fn duration(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Returns true if the clip contains no frames.
    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Down-mixed mono value of frame `index`, or `0.0` past the end.
    #[inline]
    pub fn mono_sample(&self, index: usize) -> f32 {
        if index >= self.frame_count() {
            return 0.0;
        }
        if self.channels.len() == 1 {
            return self.channels[0][index];
        }
        let sum: f32 = self.channels.iter().map(|ch| ch[index]).sum();
        sum / self.channels.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_follows_frame_count() {
        let clip = AudioClip::mono(vec![0.0; 48_000], 24_000);
        assert!((clip.duration() - 2.0).abs() < 1e-9);
        assert_eq!(clip.frame_count(), 48_000);
    }

    #[test]
    fn ragged_channels_are_padded() {
        let clip = AudioClip::new(vec![vec![0.5; 4], vec![0.5; 2]], 16_000);
        assert_eq!(clip.frame_count(), 4);
        assert_eq!(clip.channel(1).map(<[f32]>::len), Some(4));
        assert!((clip.mono_sample(3) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn empty_clip_has_zero_duration() {
        let clip = AudioClip::new(Vec::new(), 24_000);
        assert!(clip.is_empty());
        assert_eq!(clip.channel_count(), 1);
        assert_eq!(clip.duration(), 0.0);
        assert_eq!(clip.mono_sample(0), 0.0);
    }
}
