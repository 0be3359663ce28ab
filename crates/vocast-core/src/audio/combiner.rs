//! Track combiner: one seekable WAV built from every chunk of a finished stream

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::wav::{decode_wav, encode_wav, pcm_duration_secs, BYTES_PER_SAMPLE, WAV_HEADER_LEN};
use crate::error::{Error, Result};
use crate::stream::AudioChunk;

/// Position of one chunk inside the combined track
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTiming {
    pub sequence_index: usize,
    /// Offset of the segment's first sample, in seconds
    pub start: f64,
    pub duration: f64,
    pub speaker: String,
    pub text: String,
}

impl SegmentTiming {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// The concatenated track
#[derive(Debug, Clone)]
pub struct CombinedTrack {
    wav: Arc<[u8]>,
    sample_rate: u32,
    segments: Vec<SegmentTiming>,
}

impl CombinedTrack {
    /// Load a previously written track as a single segment
    pub fn from_wav(bytes: &[u8]) -> Result<Self> {
        let decoded = decode_wav(bytes)?;
        let mut pcm = decoded.bytes;
        pcm.truncate(pcm.len() - pcm.len() % BYTES_PER_SAMPLE);
        let wav = encode_wav(&pcm, decoded.sample_rate)?;
        let segments = vec![SegmentTiming {
            sequence_index: 0,
            start: 0.0,
            duration: pcm_duration_secs(pcm.len(), decoded.sample_rate),
            speaker: String::new(),
            text: String::new(),
        }];
        Ok(Self {
            wav: wav.into(),
            sample_rate: decoded.sample_rate,
            segments,
        })
    }

    /// Playable WAV bytes (44-byte header followed by PCM)
    pub fn wav(&self) -> &[u8] {
        &self.wav
    }

    pub fn pcm(&self) -> &[u8] {
        &self.wav[WAV_HEADER_LEN..]
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total duration in seconds, computed from the sample count
    pub fn duration(&self) -> f64 {
        pcm_duration_secs(self.pcm().len(), self.sample_rate)
    }

    pub fn segments(&self) -> &[SegmentTiming] {
        &self.segments
    }

    /// Segment playing at `time` seconds
    pub fn segment_at(&self, time: f64) -> Option<&SegmentTiming> {
        if time < 0.0 {
            return None;
        }
        let found = self
            .segments
            .iter()
            .find(|s| time >= s.start && time < s.end());
        // The very end of the track still belongs to the last segment.
        found.or_else(|| {
            self.segments
                .last()
                .filter(|s| time >= s.start && time <= s.end() && s.duration > 0.0)
        })
    }

    /// PCM from `time` seconds to the end, aligned to a sample boundary
    pub fn pcm_from(&self, time: f64) -> &[u8] {
        let pcm = self.pcm();
        let sample = (time.max(0.0) * self.sample_rate as f64).floor() as usize;
        let offset = (sample * BYTES_PER_SAMPLE).min(pcm.len());
        &pcm[offset..]
    }

    /// Write the track as a `.wav` file
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &self.wav)?;
        info!(
            "Wrote combined track ({:.2}s, {} bytes) to {:?}",
            self.duration(),
            self.wav.len(),
            path
        );
        Ok(())
    }
}

/// Concatenate chunks in sequence order and wrap them once
///
/// The sample rate of the first decodable chunk is used for the whole track.
/// Chunks that fail to decode are left out of the track and the segment table.
pub fn combine(chunks: &[Arc<AudioChunk>]) -> Result<CombinedTrack> {
    let mut ordered: Vec<&Arc<AudioChunk>> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.sequence_index);

    let mut pcm = Vec::new();
    let mut segments = Vec::with_capacity(ordered.len());
    let mut sample_rate: Option<u32> = None;

    for chunk in ordered {
        let decoded = match chunk.decode() {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    "Skipping chunk {} while combining: {}",
                    chunk.sequence_index, e
                );
                continue;
            }
        };

        let rate = *sample_rate.get_or_insert(decoded.sample_rate);
        if decoded.sample_rate != rate {
            warn!(
                "Chunk {} is {} Hz but the track is {} Hz; sample rates must be uniform",
                chunk.sequence_index, decoded.sample_rate, rate
            );
        }

        let mut bytes = decoded.bytes;
        bytes.truncate(bytes.len() - bytes.len() % BYTES_PER_SAMPLE);

        let start = pcm_duration_secs(pcm.len(), rate);
        segments.push(SegmentTiming {
            sequence_index: chunk.sequence_index,
            start,
            duration: pcm_duration_secs(bytes.len(), rate),
            speaker: chunk.speaker.clone(),
            text: chunk.text.clone(),
        });
        pcm.extend_from_slice(&bytes);
    }

    let sample_rate = sample_rate.ok_or(Error::NoCombinedTrack)?;
    let wav = encode_wav(&pcm, sample_rate)?;

    debug!(
        "Combined {} segments into {:.2}s at {} Hz",
        segments.len(),
        pcm_duration_secs(pcm.len(), sample_rate),
        sample_rate
    );

    Ok(CombinedTrack {
        wav: wav.into(),
        sample_rate,
        segments,
    })
}
