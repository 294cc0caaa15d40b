//! # Audio Codec Bridge
//!
//! Converts between the wire audio encoding used by clients (compressed
//! container audio at whatever rate the recording device produced) and the
//! raw linear-PCM format the AI backend requires (16 kHz, mono, 16-bit
//! signed little-endian).
//!
//! ## Inbound direction (client → backend):
//! 1. **Container decode**: probe and decode with symphonia
//! 2. **Downmix**: average channels to mono
//! 3. **Resample**: linear interpolation to the target rate
//! 4. **Quantize**: 32-bit float back to 16-bit signed PCM
//!
//! A chunk that fails container decode is discarded with an
//! `AudioDecodeFailure` — intermittent malformed chunks must not kill the
//! session. A zero-length chunk produces a zero-length output.
//!
//! ## Outbound direction (backend → client):
//! No server-side conversion. The backend's fixed output format (24 kHz,
//! 16-bit, mono, raw PCM) is forwarded unchanged; interpretation happens in
//! the playback decoder at the client edge.
//!
//! ## Numeric contract:
//! PCM samples are signed 16-bit integers in [-32768, 32767]. Conversion to
//! normalized float divides by 32768.0 — not 32767 — to match the capture
//! device's convention. This asymmetry is intentional.

use crate::error::{RelayError, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// How the bytes of an [`AudioChunk`] are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// A compressed container (WAV, OGG/Vorbis, FLAC, ...) with embedded
    /// format metadata
    Container,
    /// Raw little-endian PCM with the format described by the chunk fields
    RawPcm,
}

/// One discrete unit of audio bytes plus the metadata needed to interpret it.
///
/// Chunks are immutable and consumed exactly once by the next pipeline stage;
/// nothing retains them after handoff.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub encoding: AudioEncoding,
}

impl AudioChunk {
    /// A chunk of container-encoded bytes; the real format is read from the
    /// container itself during decode, so the metadata fields are nominal.
    pub fn container(data: Vec<u8>) -> Self {
        Self {
            data,
            sample_rate: 0,
            channels: 0,
            bit_depth: 0,
            encoding: AudioEncoding::Container,
        }
    }

    /// A chunk of raw 16-bit little-endian PCM.
    pub fn raw_pcm(data: Vec<u8>, sample_rate: u32, channels: u8) -> Self {
        Self {
            data,
            sample_rate,
            channels,
            bit_depth: 16,
            encoding: AudioEncoding::RawPcm,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Duration in seconds, meaningful only for raw PCM chunks.
    pub fn duration_seconds(&self) -> f64 {
        if self.encoding != AudioEncoding::RawPcm || self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        let samples_per_channel = self.data.len() / 2 / self.channels as usize;
        samples_per_channel as f64 / self.sample_rate as f64
    }
}

/// The inbound conversion pipeline: container bytes in, backend-ready PCM out.
pub struct AudioCodecBridge {
    target_sample_rate: u32,
}

impl AudioCodecBridge {
    pub fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Convert one client chunk into the backend's raw PCM format.
    ///
    /// ## Errors:
    /// `AudioDecodeFailure` when the container cannot be probed or decoded.
    /// The caller drops the chunk and keeps the session alive.
    ///
    /// ## Edge case:
    /// A zero-length chunk is a no-op: zero-length output, no error.
    pub fn transcode_inbound(&self, chunk: AudioChunk) -> RelayResult<AudioChunk> {
        if chunk.is_empty() {
            return Ok(AudioChunk::raw_pcm(Vec::new(), self.target_sample_rate, 1));
        }

        let decoded = match chunk.encoding {
            AudioEncoding::Container => decode_container(chunk.data)?,
            // Raw chunks skip the probe but still pass through downmix and
            // resample so callers get a uniform output format.
            AudioEncoding::RawPcm => {
                let samples = parse_pcm16le(&chunk.data)?;
                DecodedPcm {
                    samples: pcm_to_float(&samples),
                    sample_rate: chunk.sample_rate,
                    channels: chunk.channels as usize,
                }
            }
        };

        let mono = downmix_to_mono(&decoded.samples, decoded.channels);
        let resampled = resample_linear(&mono, decoded.sample_rate, self.target_sample_rate);
        let quantized = float_to_pcm(&resampled);

        Ok(AudioChunk::raw_pcm(
            pack_pcm16le(&quantized),
            self.target_sample_rate,
            1,
        ))
    }
}

/// Interleaved float samples recovered from a container, with their source
/// format.
pub struct DecodedPcm {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Probe and fully decode a compressed audio container.
///
/// Decodes the first audio track to interleaved 32-bit float samples.
/// Per-packet decode errors are skipped (a single corrupt packet should not
/// discard the rest of the chunk); probe failure and hard stream errors are
/// `AudioDecodeFailure`.
pub fn decode_container(data: Vec<u8>) -> RelayResult<DecodedPcm> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| RelayError::AudioDecodeFailure(format!("container probe failed: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| {
            RelayError::AudioDecodeFailure("container has no decodable audio track".to_string())
        })?;

    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(1)
        .max(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| RelayError::AudioDecodeFailure(format!("unsupported codec: {}", e)))?;

    if sample_rate == 0 {
        return Err(RelayError::AudioDecodeFailure(
            "container does not declare a sample rate".to_string(),
        ));
    }

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                return Err(RelayError::AudioDecodeFailure(format!(
                    "container read failed: {}",
                    e
                )));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            // Skip corrupt packets, keep what decodes.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => {
                return Err(RelayError::AudioDecodeFailure(format!(
                    "packet decode failed: {}",
                    e
                )));
            }
        }
    }

    Ok(DecodedPcm {
        samples,
        sample_rate,
        channels,
    })
}

/// Collapse interleaved multi-channel samples to mono by averaging channels.
pub fn downmix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio with linear interpolation.
///
/// Deterministic and cheap; quality is sufficient for speech headed into a
/// recognition model. Identity when the rates already match.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let out_len =
        ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;

        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }

    out
}

/// Convert 16-bit PCM samples to normalized 32-bit floats.
///
/// Divides by 32768.0 (not 32767) to match the capture device's convention.
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert normalized floats back to 16-bit PCM, clamping out-of-range values.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Parse raw little-endian 16-bit PCM bytes into samples.
pub fn parse_pcm16le(data: &[u8]) -> RelayResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(RelayError::AudioDecodeFailure(
            "PCM byte length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    Ok(samples)
}

/// Pack 16-bit samples as little-endian bytes.
pub fn pack_pcm16le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
