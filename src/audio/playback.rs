//! # Playback Decoder
//!
//! Client-edge interpretation of speech audio relayed from the backend.
//! The relay forwards backend bytes without conversion, so the receiving edge
//! must work out what it got:
//!
//! 1. **Structured decode first**: attempt a container probe/decode.
//! 2. **Raw-PCM fallback**: on failure, reinterpret the same bytes as raw
//!    little-endian 16-bit PCM at the backend's known fixed output format
//!    (24 kHz mono).
//!
//! This is an explicit two-branch policy, not error-handling sugar: the
//! backend emits raw PCM today but the probe keeps the edge compatible with
//! container-encoded payloads.
//!
//! Decoded chunks are scheduled for gapless sequential playback: each chunk
//! starts at the later of "now" and the previous chunk's scheduled end, so
//! chunks of one turn can never overlap. A chunk arriving while the output
//! device is suspended resumes the device first — awaited, not
//! fire-and-forget — before any scheduling happens.

use crate::audio::codec::{decode_container, parse_pcm16le, pcm_to_float};
use crate::error::RelayResult;
use tracing::debug;

/// Audio ready for playback: normalized samples plus the format they carry.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    /// Playback duration in seconds.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        (self.samples.len() / self.channels) as f64 / self.sample_rate as f64
    }
}

/// Decodes backend audio payloads of unknown encoding.
pub struct PlaybackDecoder {
    /// Sample rate of the backend's raw PCM output (the fallback format)
    output_sample_rate: u32,
    /// Channel count of the backend's raw PCM output
    output_channels: usize,
}

impl PlaybackDecoder {
    pub fn new(output_sample_rate: u32, output_channels: usize) -> Self {
        Self {
            output_sample_rate,
            output_channels,
        }
    }

    /// Decode one payload: structured decode first, raw-PCM reinterpretation
    /// of the same bytes on failure.
    pub fn decode(&self, data: Vec<u8>) -> RelayResult<DecodedAudio> {
        match decode_container(data.clone()) {
            Ok(decoded) => Ok(DecodedAudio {
                samples: decoded.samples,
                sample_rate: decoded.sample_rate,
                channels: decoded.channels,
            }),
            Err(probe_err) => {
                debug!(
                    "structured decode failed ({}), falling back to raw PCM at {} Hz",
                    probe_err, self.output_sample_rate
                );
                let samples = parse_pcm16le(&data)?;
                Ok(DecodedAudio {
                    samples: pcm_to_float(&samples),
                    sample_rate: self.output_sample_rate,
                    channels: self.output_channels,
                })
            }
        }
    }
}

/// Output device state. A real device starts suspended until user activation;
/// playback must not be scheduled against a suspended device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Suspended,
    Running,
}

/// The audio output device seen by the scheduler.
#[derive(Debug)]
pub struct OutputDevice {
    state: DeviceState,
}

impl OutputDevice {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Suspended,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Resume the device. Asynchronous because real device resumption is;
    /// callers await completion before scheduling.
    pub async fn resume(&mut self) {
        if self.state == DeviceState::Suspended {
            self.state = DeviceState::Running;
        }
    }
}

impl Default for OutputDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Playback slot assigned to one chunk, in seconds on the device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start_at: f64,
    pub end_at: f64,
}

/// Sequences chunk playback so back-to-back chunks play gaplessly and never
/// overlap.
///
/// Every chunk gets a fresh playback slot (no buffer reuse across chunks):
/// chunk N starts at `max(now, end_of_chunk_N-1)`. Overlapping playback of
/// two chunks from the same turn is impossible by construction.
pub struct PlaybackScheduler {
    device: OutputDevice,
    next_start: f64,
}

impl PlaybackScheduler {
    pub fn new(device: OutputDevice) -> Self {
        Self {
            device,
            next_start: 0.0,
        }
    }

    pub fn device_state(&self) -> DeviceState {
        self.device.state()
    }

    /// Schedule one decoded chunk at clock time `now` (seconds).
    ///
    /// Resumes a suspended device first and awaits the resumption. Returns
    /// the slot the chunk will occupy; the internal cursor advances to its
    /// end so the next chunk queues behind it.
    pub async fn schedule(&mut self, audio: &DecodedAudio, now: f64) -> ScheduledChunk {
        if self.device.state() == DeviceState::Suspended {
            self.device.resume().await;
        }

        let start_at = if now > self.next_start {
            now
        } else {
            self.next_start
        };
        let end_at = start_at + audio.duration_seconds();
        self.next_start = end_at;

        ScheduledChunk { start_at, end_at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::pack_pcm16le;

    fn raw_chunk(samples: &[i16]) -> Vec<u8> {
        pack_pcm16le(samples)
    }

    #[test]
    fn test_raw_pcm_fallback_is_lossless() {
        let decoder = PlaybackDecoder::new(24_000, 1);
        let samples = vec![0i16, 1000, -1000, 32767, -32768];
        let decoded = decoder.decode(raw_chunk(&samples)).unwrap();

        assert_eq!(decoded.sample_rate, 24_000);
        assert_eq!(decoded.channels, 1);
        for (orig, dec) in samples.iter().zip(decoded.samples.iter()) {
            assert!(
                (*orig as f32 / 32768.0 - dec).abs() < f32::EPSILON,
                "{} vs {}",
                orig,
                dec
            );
        }
    }

    #[test]
    fn test_structured_decode_takes_priority() {
        // A WAV container carries its own rate; the fallback rate must not
        // apply when the probe succeeds.
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..441i16 {
                writer.write_sample(i * 10).unwrap();
            }
            writer.finalize().unwrap();
        }

        let decoder = PlaybackDecoder::new(24_000, 1);
        let decoded = decoder.decode(cursor.into_inner()).unwrap();
        assert_eq!(decoded.sample_rate, 44_100);
        assert_eq!(decoded.samples.len(), 441);
    }

    #[test]
    fn test_decoded_duration() {
        let audio = DecodedAudio {
            samples: vec![0.0; 24_000],
            sample_rate: 24_000,
            channels: 1,
        };
        assert!((audio.duration_seconds() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_back_to_back_chunks_never_overlap() {
        let mut scheduler = PlaybackScheduler::new(OutputDevice::new());
        let chunk = DecodedAudio {
            samples: vec![0.0; 12_000], // 0.5 s at 24 kHz
            sample_rate: 24_000,
            channels: 1,
        };

        // Both chunks arrive "now" at t=0; the second must queue behind the
        // first, not play over it.
        let first = scheduler.schedule(&chunk, 0.0).await;
        let second = scheduler.schedule(&chunk, 0.1).await;

        assert!((first.end_at - 0.5).abs() < f64::EPSILON);
        assert!(second.start_at >= first.end_at);
        assert!((second.start_at - first.end_at).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_late_chunk_starts_immediately() {
        let mut scheduler = PlaybackScheduler::new(OutputDevice::new());
        let chunk = DecodedAudio {
            samples: vec![0.0; 2_400], // 0.1 s
            sample_rate: 24_000,
            channels: 1,
        };

        let first = scheduler.schedule(&chunk, 0.0).await;
        // The previous chunk finished long ago; play at once, no phantom gap.
        let second = scheduler.schedule(&chunk, 5.0).await;

        assert!((first.end_at - 0.1).abs() < f64::EPSILON);
        assert!((second.start_at - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_suspended_device_is_resumed_before_scheduling() {
        let mut scheduler = PlaybackScheduler::new(OutputDevice::new());
        assert_eq!(scheduler.device_state(), DeviceState::Suspended);

        let chunk = DecodedAudio {
            samples: vec![0.0; 240],
            sample_rate: 24_000,
            channels: 1,
        };
        scheduler.schedule(&chunk, 0.0).await;

        assert_eq!(scheduler.device_state(), DeviceState::Running);
    }
}
