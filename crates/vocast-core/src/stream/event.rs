//! Generation events and the audio chunks they carry

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::audio::{decode_base64_to_pcm_bytes, ensure_wav, is_wav, wav_sample_rate, Pcm};
use crate::error::Result;

/// Feature that started a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// Spoken chat responses, streamed alongside LLM tokens
    Chat,
    Audiobook,
    /// Multi-speaker podcast with transcript and progress phases
    Podcast,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::Chat => "chat",
            Feature::Audiobook => "audiobook",
            Feature::Podcast => "podcast",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chat" => Ok(Feature::Chat),
            "audiobook" => Ok(Feature::Audiobook),
            "podcast" => Ok(Feature::Podcast),
            other => Err(format!("unknown feature '{other}'")),
        }
    }
}

/// One decoded `data:` payload, tagged by its `type` field
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Audio(AudioEvent),

    /// Partial LLM text (chat)
    Content {
        #[serde(default)]
        content: String,
    },

    /// Script of the whole episode (podcast)
    Transcript {
        #[serde(default)]
        transcript: Vec<TranscriptLine>,
    },

    /// Generation progress (podcast)
    Phase {
        #[serde(default)]
        percent: f32,
        #[serde(default)]
        message: String,
    },

    Done,

    Error {
        #[serde(alias = "message")]
        error: String,
    },

    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Audio(_) => "audio",
            StreamEvent::Content { .. } => "content",
            StreamEvent::Transcript { .. } => "transcript",
            StreamEvent::Phase { .. } => "phase",
            StreamEvent::Done => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Unknown => "unknown",
        }
    }
}

/// Payload of an `audio` event
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioEvent {
    /// Base64 of bare PCM or of a complete WAV file
    #[serde(alias = "audio_base64", alias = "wav")]
    pub audio: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default)]
    pub segment_index: Option<usize>,

    #[serde(default)]
    pub speaker: String,

    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub voice_used: String,
}

fn default_sample_rate() -> u32 {
    24000
}

/// One line of a podcast transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptLine {
    #[serde(default)]
    pub speaker: String,
    #[serde(default)]
    pub text: String,
}

/// One unit of generated speech, immutable once received
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Position in the track, contiguous from 0
    pub sequence_index: usize,
    /// Base64 payload as received
    pub audio: String,
    pub sample_rate: u32,
    pub speaker: String,
    pub text: String,
    pub voice_used: String,
}

impl AudioChunk {
    /// Build a chunk from an event; `fallback_index` is used when the event
    /// carries no `segment_index`.
    pub fn from_event(event: AudioEvent, fallback_index: usize) -> Self {
        Self {
            sequence_index: event.segment_index.unwrap_or(fallback_index),
            audio: event.audio,
            sample_rate: event.sample_rate,
            speaker: event.speaker,
            text: event.text,
            voice_used: event.voice_used,
        }
    }

    /// Decode the payload into 16-bit PCM
    pub fn decode(&self) -> Result<Pcm> {
        let bytes = decode_base64_to_pcm_bytes(&self.audio)?;
        Pcm::from_payload(bytes, self.sample_rate)
    }

    /// The payload as a playable WAV and its sample rate
    ///
    /// A payload that is already a WAV file is returned as sent.
    pub fn to_wav(&self) -> Result<(Vec<u8>, u32)> {
        let bytes = decode_base64_to_pcm_bytes(&self.audio)?;
        let rate = if is_wav(&bytes) {
            wav_sample_rate(&bytes)?
        } else {
            self.sample_rate
        };
        Ok((ensure_wav(bytes, rate)?, rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_event_parses() {
        let json = r#"{"type":"audio","audio":"AAAA","sample_rate":16000,"segment_index":3,"speaker":"Ana","text":"Hi","voice_used":"v1"}"#;
        match serde_json::from_str::<StreamEvent>(json).unwrap() {
            StreamEvent::Audio(audio) => {
                assert_eq!(audio.sample_rate, 16000);
                assert_eq!(audio.segment_index, Some(3));
                assert_eq!(audio.speaker, "Ana");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_audio_defaults() {
        let json = r#"{"type":"audio","audio":"AAAA"}"#;
        let StreamEvent::Audio(audio) = serde_json::from_str::<StreamEvent>(json).unwrap() else {
            panic!("expected audio");
        };
        assert_eq!(audio.sample_rate, 24000);
        assert_eq!(audio.segment_index, None);

        let chunk = AudioChunk::from_event(audio, 7);
        assert_eq!(chunk.sequence_index, 7);
    }

    #[test]
    fn test_done_ignores_extra_fields() {
        let json = r#"{"type":"done","total_segments":4,"duration":12.5}"#;
        assert_eq!(serde_json::from_str::<StreamEvent>(json).unwrap(), StreamEvent::Done);
    }

    #[test]
    fn test_unknown_type() {
        let json = r#"{"type":"heartbeat"}"#;
        assert_eq!(serde_json::from_str::<StreamEvent>(json).unwrap(), StreamEvent::Unknown);
    }

    #[test]
    fn test_error_message_alias() {
        let json = r#"{"type":"error","message":"quota exceeded"}"#;
        assert_eq!(
            serde_json::from_str::<StreamEvent>(json).unwrap(),
            StreamEvent::Error {
                error: "quota exceeded".to_string()
            }
        );
    }

    #[test]
    fn test_audio_without_payload_is_rejected() {
        let json = r#"{"type":"audio","sample_rate":24000}"#;
        assert!(serde_json::from_str::<StreamEvent>(json).is_err());
    }

    #[test]
    fn test_transcript_and_phase() {
        let json = r#"{"type":"transcript","transcript":[{"speaker":"A","text":"one"},{"speaker":"B","text":"two"}]}"#;
        let StreamEvent::Transcript { transcript } = serde_json::from_str::<StreamEvent>(json).unwrap() else {
            panic!("expected transcript");
        };
        assert_eq!(transcript.len(), 2);

        let json = r#"{"type":"phase","percent":40,"message":"Synthesizing"}"#;
        let StreamEvent::Phase { percent, message } = serde_json::from_str::<StreamEvent>(json).unwrap() else {
            panic!("expected phase");
        };
        assert_eq!(percent, 40.0);
        assert_eq!(message, "Synthesizing");
    }

    #[test]
    fn test_feature_from_str() {
        assert_eq!("Podcast".parse::<Feature>().unwrap(), Feature::Podcast);
        assert!("radio".parse::<Feature>().is_err());
    }

    #[test]
    fn test_wav_payload_passes_through() {
        use crate::audio::encode_wav;
        use base64::Engine as _;

        let wav = encode_wav(&[1, 0, 2, 0], 16000).unwrap();
        let mut chunk = AudioChunk {
            sequence_index: 0,
            audio: base64::engine::general_purpose::STANDARD.encode(&wav),
            sample_rate: 24000,
            speaker: String::new(),
            text: String::new(),
            voice_used: String::new(),
        };
        assert_eq!(chunk.to_wav().unwrap(), (wav, 16000));

        chunk.audio = base64::engine::general_purpose::STANDARD.encode([1u8, 0, 2, 0]);
        let (wrapped, rate) = chunk.to_wav().unwrap();
        assert_eq!(rate, 24000);
        assert!(is_wav(&wrapped));
    }
}
