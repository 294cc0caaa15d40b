//! # Audio Conversion Module
//!
//! Format conversion at both edges of the relay:
//!
//! - **Codec Bridge** (`codec`): inbound client audio — container decode,
//!   mono downmix, resample to the backend's 16 kHz 16-bit PCM contract.
//! - **Playback Decoder** (`playback`): outbound backend audio — structured
//!   decode with raw-PCM fallback, plus gapless playback scheduling.
//!
//! Outbound audio is never converted server-side; the backend's fixed output
//! format is already playable once correctly interpreted at the edge.

pub mod codec;
pub mod playback;

pub use codec::{AudioChunk, AudioCodecBridge, AudioEncoding};
pub use playback::{PlaybackDecoder, PlaybackScheduler};
