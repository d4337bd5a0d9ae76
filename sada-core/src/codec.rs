//! PCM16 / base64 conversions.
//!
//! Everything here is a pure function: no state, safe to call from any thread.
//!
//! ```text
//! base64 text ──decode_base64──► bytes ──pcm16_to_float──► [-1, 1] f32 per channel
//! [-1, 1] f32 ──float_to_pcm16──► bytes ──encode_base64──► base64 text
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::{
    buffering::clip::AudioClip,
    error::{Result, SadaError},
};

/// Standard-alphabet base64 with padding and no line wrapping.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64. Non-alphabet characters (whitespace included) and
/// non-canonical padding are rejected; callers reading text files trim first.
pub fn decode_base64(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| SadaError::Decode(e.to_string()))
}

/// Decode interleaved little-endian PCM16 into one `Vec<f32>` per channel.
///
/// Each raw sample `s` maps to `s / 32768.0`.
///
/// # Errors
/// `SadaError::MalformedBuffer` if `bytes.len()` is not a multiple of
/// `2 * channels` (or `channels == 0`). Nothing is truncated.
pub fn pcm16_to_float(bytes: &[u8], channels: usize) -> Result<Vec<Vec<f32>>> {
    if channels == 0 || bytes.len() % (2 * channels) != 0 {
        return Err(SadaError::MalformedBuffer {
            len: bytes.len(),
            channels,
        });
    }

    let frames = bytes.len() / (2 * channels);
    let mut out = vec![Vec::with_capacity(frames); channels];
    for (idx, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        out[idx % channels].push(sample as f32 / 32768.0);
    }
    Ok(out)
}

/// Encode f32 samples as little-endian PCM16.
///
/// Samples are clamped to [-1, 1]; negatives scale by 32768 and positives by
/// 32767 so exactly `1.0` does not overflow.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
        let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.extend_from_slice(&(scaled.round() as i16).to_le_bytes());
    }
    out
}

/// Interleave per-channel samples (`[L..], [R..]` → `L R L R ..`).
pub fn interleave(channels: &[Vec<f32>]) -> Vec<f32> {
    let frames = channels.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * channels.len());
    for f in 0..frames {
        for ch in channels {
            out.push(ch.get(f).copied().unwrap_or(0.0));
        }
    }
    out
}

/// Mean absolute amplitude of a frame (`0.0` for an empty frame).
pub fn mean_abs_level(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().map(|s| s.abs()).sum::<f32>() / frame.len() as f32
}

/// Decode a base64 PCM16 payload straight into an [`AudioClip`].
pub fn decode_clip(base64_audio: &str, sample_rate: u32, channels: usize) -> Result<AudioClip> {
    let bytes = decode_base64(base64_audio)?;
    let data = pcm16_to_float(&bytes, channels)?;
    Ok(AudioClip::new(data, sample_rate))
}

/// Encode a mono f32 frame as base64 PCM16 (the capture wire format).
pub fn encode_frame(samples: &[f32]) -> String {
    encode_base64(&float_to_pcm16(samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn base64_is_standard_and_unwrapped() {
        let bytes: Vec<u8> = (0..=255).collect();
        let text = encode_base64(&bytes);
        assert!(!text.contains('\n'));
        assert!(text.ends_with('='));
        assert_eq!(decode_base64(&text).unwrap(), bytes);
    }

    #[test]
    fn rejects_non_alphabet_characters() {
        let err = decode_base64("AAA*").unwrap_err();
        assert!(matches!(err, SadaError::Decode(_)));
    }

    #[test]
    fn surrounding_whitespace_is_not_alphabet() {
        assert!(matches!(decode_base64(" AAAA"), Err(SadaError::Decode(_))));
        assert!(matches!(decode_base64("AAAA\n"), Err(SadaError::Decode(_))));
        assert_eq!(decode_base64("AAAA").unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn rejects_wrong_padding() {
        assert!(matches!(decode_base64("AAA"), Err(SadaError::Decode(_))));
        assert!(matches!(decode_base64("AA=="), Ok(_)));
        assert!(matches!(decode_base64("AA==="), Err(SadaError::Decode(_))));
    }

    #[test]
    fn odd_length_buffer_is_rejected_not_truncated() {
        let err = pcm16_to_float(&[0, 1, 2], 1).unwrap_err();
        assert!(matches!(
            err,
            SadaError::MalformedBuffer {
                len: 3,
                channels: 1
            }
        ));
    }

    #[test]
    fn stereo_alignment_requires_four_bytes() {
        assert!(pcm16_to_float(&[0; 6], 2).is_err());
        assert!(pcm16_to_float(&[0; 8], 2).is_ok());
        assert!(pcm16_to_float(&[0; 8], 0).is_err());
    }

    #[test]
    fn extreme_values_map_into_unit_range() {
        let bytes = [
            i16::MIN.to_le_bytes(),
            i16::MAX.to_le_bytes(),
            0i16.to_le_bytes(),
        ]
        .concat();
        let out = pcm16_to_float(&bytes, 1).unwrap();
        assert_eq!(out[0][0], -1.0);
        assert_abs_diff_eq!(out[0][1], 32767.0 / 32768.0);
        assert_eq!(out[0][2], 0.0);
    }

    #[test]
    fn deinterleaves_channels() {
        let bytes = [100i16, -100, 200, -200]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect::<Vec<u8>>();
        let out = pcm16_to_float(&bytes, 2).unwrap();
        assert_eq!(out.len(), 2);
        assert_abs_diff_eq!(out[0][1], 200.0 / 32768.0);
        assert_abs_diff_eq!(out[1][0], -100.0 / 32768.0);
        assert_eq!(interleave(&out).len(), 4);
    }

    #[test]
    fn encode_clamps_and_does_not_overflow() {
        let bytes = float_to_pcm16(&[1.0, -1.0, 2.5, -7.0, f32::NAN]);
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![32767, -32768, 32767, -32768, 0]);
    }

    #[test]
    fn every_int16_survives_decode_encode_within_one_lsb() {
        for v in i16::MIN..=i16::MAX {
            let decoded = pcm16_to_float(&v.to_le_bytes(), 1).unwrap();
            let bytes = float_to_pcm16(&decoded[0]);
            let back = i16::from_le_bytes([bytes[0], bytes[1]]);
            assert!(
                (back as i32 - v as i32).abs() <= 1,
                "v={v} came back as {back}"
            );
        }
    }

    #[test]
    fn multichannel_buffer_round_trips_within_one_lsb() {
        let original: Vec<i16> = vec![-32768, -1, 0, 1, 12345, 32767];
        let bytes: Vec<u8> = original.iter().flat_map(|s| s.to_le_bytes()).collect();
        let channels = pcm16_to_float(&bytes, 2).unwrap();
        let back = float_to_pcm16(&interleave(&channels));
        assert_eq!(back.len(), bytes.len());
        for (a, b) in back.chunks_exact(2).zip(original.iter()) {
            let a = i16::from_le_bytes([a[0], a[1]]);
            assert!((a as i32 - *b as i32).abs() <= 1);
        }
    }

    #[test]
    fn mean_abs_level_of_square_wave() {
        let frame: Vec<f32> = (0..64).map(|i| if i % 2 == 0 { 0.2 } else { -0.2 }).collect();
        assert_abs_diff_eq!(mean_abs_level(&frame), 0.2, epsilon = 1e-6);
        assert_eq!(mean_abs_level(&[]), 0.0);
    }

    #[test]
    fn decode_clip_reports_duration() {
        let bytes = vec![0u8; 24_000 * 2];
        let clip = decode_clip(&encode_base64(&bytes), 24_000, 1).unwrap();
        assert_abs_diff_eq!(clip.duration(), 1.0);
    }
}
