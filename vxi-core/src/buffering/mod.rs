//! Lock-free SPSC byte ring carrying inbound call audio to a recognizer.
//!
//! The channel's `write` path runs on the telephony leg's real-time context;
//! `push_slice` on the producer is wait-free and allocation-free, so that
//! context never blocks on the recognizer.

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, attached to the audio channel's inbound tap.
pub type FrameProducer = ringbuf::HeapProd<u8>;

/// Consumer half, owned by the open recognition session.
pub type FrameConsumer = ringbuf::HeapCons<u8>;

/// Default capacity: 2^18 bytes ≈ 16 s of 8 kHz linear16 audio.
pub const FRAME_RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_frame_ring(capacity: usize) -> (FrameProducer, FrameConsumer) {
    HeapRb::<u8>::new(capacity.max(1)).split()
}
