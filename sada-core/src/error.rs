use thiserror::Error;

/// All errors produced by sada-core.
#[derive(Debug, Error)]
pub enum SadaError {
    #[error("invalid base64 payload: {0}")]
    Decode(String),

    #[error("malformed PCM16 buffer: {len} bytes is not aligned to {channels} channel(s) of 16-bit samples")]
    MalformedBuffer { len: usize, channels: usize },

    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("microphone is already in use by another capture")]
    DeviceBusy,

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("audio context is closed")]
    ContextClosed,

    #[error("capture is already running")]
    AlreadyRunning,

    #[error("live channel error: {0}")]
    RemoteChannel(String),

    #[error("remote service returned an empty response")]
    EmptyResponse,

    #[error("remote service returned an unexpected format: {0}")]
    InvalidFormat(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("WAV error: {0}")]
    Wav(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SadaError {
    /// Device-access failures that need a fresh user gesture to retry.
    pub fn is_device_access(&self) -> bool {
        matches!(
            self,
            SadaError::PermissionDenied(_) | SadaError::DeviceUnavailable(_) | SadaError::DeviceBusy
        )
    }
}

pub type Result<T> = std::result::Result<T, SadaError>;
