//! Sample channel between a core's APU and the host audio sink. The audio
//! side of the sync channel arbitrates when the producing end may refill it;
//! this module owns how that channel is sized from the configuration.

use ringbuf::RingBuffer;

pub use ringbuf::{Consumer, Producer};

use crate::context::Config;

pub type SampleProducer = Producer<i16>;
pub type SampleConsumer = Consumer<i16>;

/// Samples buffered when `Config.audio_buffers` is left at zero.
pub const DEFAULT_AUDIO_SAMPLES: usize = 2048;

/// Resolve a configured sample count, zero meaning the default. The worker
/// writes the resolved value back into the context so consumers and the core
/// agree on the buffer size.
pub fn resolve_samples(configured: usize) -> usize {
    if configured == 0 {
        DEFAULT_AUDIO_SAMPLES
    } else {
        configured
    }
}

/// Build the sample channel between the worker's core and the host sink.
/// Samples are interleaved stereo, so the ring holds two `i16` per buffered
/// sample.
pub fn create_channel(config: &Config) -> (SampleProducer, SampleConsumer) {
    RingBuffer::new(2 * resolve_samples(config.audio_buffers)).split()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_samples_zero_picks_default() {
        assert_eq!(resolve_samples(0), DEFAULT_AUDIO_SAMPLES);
        assert_eq!(resolve_samples(512), 512);
    }

    #[test]
    fn test_channel_sized_from_config() {
        let config = Config {
            audio_buffers: 4,
            ..Config::default()
        };
        let (mut producer, mut consumer) = create_channel(&config);
        for _ in 0..8 {
            producer.push(0).unwrap();
        }
        // Two interleaved i16 per sample; a ninth push finds no room.
        assert!(producer.push(0).is_err());
        let mut buf = [0i16; 16];
        assert_eq!(consumer.pop_slice(&mut buf), 8);
    }
}
