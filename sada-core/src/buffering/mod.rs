//! Sample buffers shared between realtime callbacks and control threads.
//!
//! Capture uses `ringbuf::HeapRb<f32>`, whose `push_slice` is wait-free and
//! safe to call from the realtime input callback.

pub mod clip;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the input callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the capture framing thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz.
/// Framing drains every few milliseconds, so this only absorbs scheduling hiccups.
pub const RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
