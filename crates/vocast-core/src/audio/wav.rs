//! PCM/WAV codec
//!
//! Server payloads arrive base64-encoded and are either bare 16-bit mono PCM
//! or an already packaged WAV file. Everything handed to an output is a
//! canonical 44-byte-header WAV.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Size of the canonical PCM WAV header
pub const WAV_HEADER_LEN: usize = 44;

/// Bytes per 16-bit mono sample
pub const BYTES_PER_SAMPLE: usize = 2;

const RIFF_MAGIC: &[u8; 4] = b"RIFF";

// Some backends pad, some don't.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Raw little-endian 16-bit mono PCM with its sample rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcm {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
}

impl Pcm {
    pub fn new(bytes: Vec<u8>, sample_rate: u32) -> Self {
        Self { bytes, sample_rate }
    }

    /// Interpret a decoded payload: WAV input reports its own rate, bare PCM
    /// keeps the rate declared by the event.
    pub fn from_payload(bytes: Vec<u8>, declared_rate: u32) -> Result<Self> {
        if is_wav(&bytes) {
            let pcm = decode_wav(&bytes)?;
            if pcm.sample_rate != declared_rate {
                debug!(
                    "WAV payload at {} Hz overrides declared rate {} Hz",
                    pcm.sample_rate, declared_rate
                );
            }
            Ok(pcm)
        } else {
            Ok(Self::new(bytes, declared_rate))
        }
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / BYTES_PER_SAMPLE
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        pcm_duration_secs(self.bytes.len(), self.sample_rate)
    }

    pub fn to_f32(&self) -> Vec<f32> {
        pcm16_to_f32(&self.bytes)
    }

    pub fn to_wav(&self) -> Result<Vec<u8>> {
        encode_wav(&self.bytes, self.sample_rate)
    }
}

/// Duration of `byte_len` bytes of 16-bit mono PCM
pub fn pcm_duration_secs(byte_len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    (byte_len / BYTES_PER_SAMPLE) as f64 / sample_rate as f64
}

/// Decode a base64 payload into raw octets
pub fn decode_base64_to_pcm_bytes(b64: &str) -> Result<Vec<u8>> {
    let compact: String = b64.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(PAYLOAD_ENGINE.decode(compact.as_bytes())?)
}

/// Whether the bytes start with a RIFF container
pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= RIFF_MAGIC.len() && &bytes[..RIFF_MAGIC.len()] == RIFF_MAGIC
}

/// Wrap 16-bit mono PCM in a canonical 44-byte WAV header
pub fn encode_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    if pcm.len() % BYTES_PER_SAMPLE != 0 {
        warn!(
            "PCM payload has odd length {}, dropping trailing byte",
            pcm.len()
        );
    }

    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let sample_count = pcm.len() / BYTES_PER_SAMPLE;
    let mut buffer = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + pcm.len()));
    {
        let mut writer =
            WavWriter::new(&mut buffer, spec).map_err(|e| Error::AudioError(e.to_string()))?;
        {
            let mut samples = writer.get_i16_writer(sample_count as u32);
            for pair in pcm.chunks_exact(BYTES_PER_SAMPLE) {
                samples.write_sample(i16::from_le_bytes([pair[0], pair[1]]));
            }
            samples
                .flush()
                .map_err(|e| Error::AudioError(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::AudioError(e.to_string()))?;
    }

    Ok(buffer.into_inner())
}

/// Pass RIFF payloads through unchanged, wrap bare PCM
pub fn ensure_wav(bytes: Vec<u8>, sample_rate: u32) -> Result<Vec<u8>> {
    if is_wav(&bytes) {
        Ok(bytes)
    } else {
        encode_wav(&bytes, sample_rate)
    }
}

/// Sample rate declared by a WAV header
pub fn wav_sample_rate(wav: &[u8]) -> Result<u32> {
    Ok(WavReader::new(Cursor::new(wav))?.spec().sample_rate)
}

/// Parse a WAV container back into 16-bit mono PCM
///
/// Non 16-bit integer input is converted; multi-channel input is downmixed
/// by averaging.
pub fn decode_wav(wav: &[u8]) -> Result<Pcm> {
    let mut reader = WavReader::new(Cursor::new(wav))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) if channels == 1 => {
            let mut bytes = Vec::with_capacity(reader.len() as usize * BYTES_PER_SAMPLE);
            for sample in reader.samples::<i16>() {
                bytes.extend_from_slice(&sample?.to_le_bytes());
            }
            return Ok(Pcm::new(bytes, spec.sample_rate));
        }
        (SampleFormat::Int, bits) => {
            let max_val = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<_, _>>()?
        }
        (SampleFormat::Float, _) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
    };

    let mono: Vec<f32> = if channels == 1 {
        samples
    } else {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(Pcm::new(f32_to_pcm16(&mono), spec.sample_rate))
}

/// 16-bit little-endian PCM to normalized floats
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| {
            let s = i16::from_le_bytes([pair[0], pair[1]]);
            if s < 0 {
                s as f32 / 32768.0
            } else {
                s as f32 / 32767.0
            }
        })
        .collect()
}

/// Normalized floats to 16-bit little-endian PCM, clamped to [-1, 1]
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let v = if s < 0.0 {
            (s * 32768.0).round() as i16
        } else {
            (s * 32767.0).round() as i16
        };
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}
