//! Opus decoding for remote audio.

use crate::error::{Error, Result};
use crate::media::PcmTap;

/// Rate webrtc negotiates for Opus.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

// 120 ms at 48 kHz, the longest frame an Opus packet can carry
const MAX_FRAME_SAMPLES: usize = 5760;

/// Decodes Opus RTP payloads to mono `f32` PCM.
pub struct OpusDecoder {
    decoder: opus::Decoder,
    output: Vec<f32>,
}

// SAFETY: the decoder state is owned by this value and only touched through
// `&mut self`; it holds no thread-local or shared data.
unsafe impl Send for OpusDecoder {}

impl OpusDecoder {
    pub fn new() -> Result<Self> {
        let decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| Error::Codec(format!("Failed to create Opus decoder: {:?}", e)))?;
        Ok(Self {
            decoder,
            output: vec![0.0; MAX_FRAME_SAMPLES],
        })
    }

    /// Decodes one packet and returns the samples, valid until the next call.
    pub fn decode(&mut self, payload: &[u8]) -> Result<&[f32]> {
        let len = self
            .decoder
            .decode_float(payload, &mut self.output, false)
            .map_err(|e| Error::Codec(format!("Opus decoding failed: {:?}", e)))?;
        Ok(&self.output[..len])
    }

    /// Decodes one packet straight into `tap`; returns the number of samples added.
    pub fn decode_into(&mut self, payload: &[u8], tap: &PcmTap) -> Result<usize> {
        let samples = self.decode(payload)?;
        tap.push(samples);
        Ok(samples.len())
    }
}
