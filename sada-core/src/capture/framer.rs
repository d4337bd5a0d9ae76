//! Fixed-size framing of resampled microphone audio.

use crate::codec;

/// One outbound capture frame, ready for the live channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureChunk {
    /// Monotonically increasing frame sequence number.
    pub seq: u64,
    /// Base64 of little-endian PCM16 mono samples.
    pub data: String,
    pub sample_rate: u32,
    /// Samples in the frame (always the configured frame size).
    pub samples: usize,
    /// Mean absolute amplitude of the frame.
    pub level: f32,
    /// `level` above the speaking threshold.
    pub is_speaking: bool,
}

impl CaptureChunk {
    /// `audio/pcm;rate=N` mime type for this chunk.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Accumulates samples and cuts them into equal frames.
///
/// Leftover samples are held for the next push; nothing is dropped or padded.
#[derive(Debug)]
pub struct Framer {
    frame_size: usize,
    threshold: f32,
    sample_rate: u32,
    pending: Vec<f32>,
    next_seq: u64,
}

impl Framer {
    pub fn new(frame_size: usize, threshold: f32, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            threshold,
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
            next_seq: 0,
        }
    }

    /// Append samples and return every complete frame, encoded.
    pub fn push(&mut self, samples: &[f32]) -> Vec<CaptureChunk> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::with_capacity(self.pending.len() / self.frame_size);
        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            out.push(self.encode(&frame));
        }
        out
    }

    /// Samples waiting for the next frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn encode(&mut self, frame: &[f32]) -> CaptureChunk {
        let level = codec::mean_abs_level(frame);
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        CaptureChunk {
            seq,
            data: codec::encode_frame(frame),
            sample_rate: self.sample_rate,
            samples: frame.len(),
            level,
            is_speaking: level > self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn cuts_exact_frames_and_keeps_remainder() {
        let mut framer = Framer::new(4, 0.05, 16_000);
        assert!(framer.push(&[0.0; 3]).is_empty());
        let chunks = framer.push(&[0.0; 6]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(framer.pending(), 1);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[1].seq, 1);
        assert_eq!(chunks[0].samples, 4);
    }

    #[test]
    fn speaking_follows_mean_level_but_every_frame_is_emitted() {
        let mut framer = Framer::new(4, 0.05, 16_000);
        let chunks = framer.push(&[0.01, -0.01, 0.02, -0.02, 0.2, -0.2, 0.1, -0.1]);
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_speaking);
        assert!(chunks[1].is_speaking);
        assert_abs_diff_eq!(chunks[1].level, 0.15, epsilon = 1e-6);
    }

    #[test]
    fn frame_payload_is_pcm16_base64() {
        let mut framer = Framer::new(2, 0.05, 16_000);
        let chunk = framer.push(&[1.0, -1.0]).remove(0);
        let bytes = codec::decode_base64(&chunk.data).unwrap();
        assert_eq!(bytes, [0xFF, 0x7F, 0x00, 0x80]);
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
    }
}
