//! Output abstraction: something that turns WAV clips into sound

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::audio::wav::{pcm_duration_secs, WAV_HEADER_LEN};
use crate::audio::{encode_wav, f32_to_pcm16};
use crate::error::Result;

/// One playable WAV resource
#[derive(Clone)]
pub struct Clip {
    /// Sequence index of the chunk, or 0 for a combined track
    pub index: usize,
    pub wav: Arc<[u8]>,
    pub sample_rate: u32,
}

impl Clip {
    pub fn new(index: usize, wav: impl Into<Arc<[u8]>>, sample_rate: u32) -> Self {
        Self {
            index,
            wav: wav.into(),
            sample_rate,
        }
    }

    /// Requantize processed samples and wrap them as a WAV clip
    pub fn from_samples(index: usize, samples: &[f32], sample_rate: u32) -> Result<Self> {
        let pcm = f32_to_pcm16(samples);
        Ok(Self::new(index, encode_wav(&pcm, sample_rate)?, sample_rate))
    }

    pub fn pcm_len(&self) -> usize {
        self.wav.len().saturating_sub(WAV_HEADER_LEN)
    }

    pub fn sample_count(&self) -> usize {
        self.pcm_len() / 2
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(pcm_duration_secs(self.pcm_len(), self.sample_rate))
    }
}

impl fmt::Debug for Clip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clip")
            .field("index", &self.index)
            .field("bytes", &self.wav.len())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// How a voice stopped producing sound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEnd {
    /// Played to the end
    Completed,
    /// Interrupted by `stop`
    Stopped,
    /// The output rejected or failed the clip
    Failed(String),
}

/// Control side of an active voice
pub trait VoiceControl: Send + Sync {
    /// Silence the voice immediately and release its resources
    fn stop(&self);

    /// Playback position within the clip
    fn position(&self) -> Duration;
}

/// A clip that has been handed to an output
///
/// [`Voice::finished`] always resolves; it never reports an error, so a
/// sequential drain loop cannot stall on one bad clip.
pub struct Voice {
    index: usize,
    duration: Duration,
    control: Arc<dyn VoiceControl>,
    done: oneshot::Receiver<VoiceEnd>,
    ended: Option<VoiceEnd>,
}

impl Voice {
    pub fn new(
        index: usize,
        duration: Duration,
        control: Arc<dyn VoiceControl>,
        done: oneshot::Receiver<VoiceEnd>,
    ) -> Self {
        Self {
            index,
            duration,
            control,
            done,
            ended: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn control(&self) -> Arc<dyn VoiceControl> {
        Arc::clone(&self.control)
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn position(&self) -> Duration {
        self.control.position()
    }

    /// Wait for the voice to end
    pub async fn finished(&mut self) -> VoiceEnd {
        if let Some(end) = &self.ended {
            return end.clone();
        }
        let end = (&mut self.done)
            .await
            .unwrap_or_else(|_| VoiceEnd::Failed("output dropped the voice".to_string()));
        self.ended = Some(end.clone());
        end
    }
}

impl fmt::Debug for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Voice")
            .field("index", &self.index)
            .field("duration", &self.duration)
            .finish()
    }
}

/// An audio output path
///
/// `start` plays a clip right away (one resource per chunk). `schedule`
/// places a clip at a point of the output clock returned by `now`, which lets
/// consecutive clips butt against each other without a startup gap.
pub trait AudioOutput: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(&self, clip: Clip) -> Result<Voice>;

    /// Current time of the output clock
    fn now(&self) -> Duration;

    fn schedule(&self, clip: Clip, at: Duration) -> Result<Voice>;

    /// Stop everything and release the underlying context
    fn close(&self);
}
