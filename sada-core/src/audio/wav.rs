//! WAV import/export for synthesized clips.

use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::info;

use crate::{
    buffering::clip::AudioClip,
    codec,
    error::{Result, SadaError},
};

fn wav_err(e: hound::Error) -> SadaError {
    match e {
        hound::Error::IoError(io) => SadaError::Io(io),
        other => SadaError::Wav(other.to_string()),
    }
}

/// Write a clip as 16-bit PCM WAV.
pub fn write_clip(path: &Path, clip: &AudioClip) -> Result<()> {
    let spec = WavSpec {
        channels: clip.channel_count() as u16,
        sample_rate: clip.sample_rate(),
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).map_err(wav_err)?;
    let channels: Vec<Vec<f32>> = (0..clip.channel_count())
        .filter_map(|c| clip.channel(c).map(<[f32]>::to_vec))
        .collect();
    let bytes = codec::float_to_pcm16(&codec::interleave(&channels));
    for pair in bytes.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
            .map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)?;
    info!(path = %path.display(), duration = clip.duration(), "clip written");
    Ok(())
}

/// PCM16 payload read from a WAV file, ready for base64 transport.
#[derive(Debug, Clone)]
pub struct Pcm16Audio {
    /// Interleaved little-endian samples.
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Read a 16-bit integer WAV into raw little-endian PCM bytes.
///
/// # Errors
/// `SadaError::Wav` for other bit depths or float WAVs.
pub fn read_pcm16(path: &Path) -> Result<Pcm16Audio> {
    let mut reader = WavReader::open(path).map_err(wav_err)?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(SadaError::Wav(format!(
            "expected 16-bit integer PCM, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    let mut bytes = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        bytes.extend_from_slice(&sample.map_err(wav_err)?.to_le_bytes());
    }
    Ok(Pcm16Audio {
        bytes,
        sample_rate: spec.sample_rate,
        channels: spec.channels as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_survives_wav_round_trip() {
        let path = std::env::temp_dir().join(format!("sada-wav-{}.wav", std::process::id()));
        let samples: Vec<f32> = (0..2400).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        let clip = AudioClip::mono(samples, 24_000);

        write_clip(&path, &clip).unwrap();
        let pcm = read_pcm16(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(pcm.sample_rate, 24_000);
        assert_eq!(pcm.channels, 1);
        let decoded = codec::pcm16_to_float(&pcm.bytes, 1).unwrap();
        assert_eq!(decoded[0].len(), 2400);
        let original = clip.channel(0).unwrap();
        for (a, b) in decoded[0].iter().zip(original) {
            assert!((a - b).abs() < 1e-3);
        }
    }
}
