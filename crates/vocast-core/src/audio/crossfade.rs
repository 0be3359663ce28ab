//! Equal-power crossfade across chunk boundaries
//!
//! Every streamed chunk is generated independently, so its first samples do
//! not line up with the last samples of the previous chunk. The head of chunk
//! N is blended with the tail of chunk N-1 using `cos`/`sin` gain curves; the
//! very first chunk of a session gets a short fade-in instead.
//!
//! The tail kept for the next blend is always taken from the chunk as it
//! arrived, never from blended output. Feeding blended samples forward makes
//! the distortion accumulate from chunk to chunk.

use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Crossfade parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossfadeConfig {
    /// Enable blending between chunks
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Blend window in milliseconds (10 ms = 480 samples at 48 kHz)
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: f32,

    /// Fade-in window for the first chunk of a session
    #[serde(default = "default_fade_in_ms")]
    pub fade_in_ms: f32,

    /// The blend never covers more than `1 / max_fraction` of a chunk
    #[serde(default = "default_max_fraction")]
    pub max_fraction: usize,
}

impl Default for CrossfadeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            crossfade_ms: default_crossfade_ms(),
            fade_in_ms: default_fade_in_ms(),
            max_fraction: default_max_fraction(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_crossfade_ms() -> f32 {
    10.0
}

fn default_fade_in_ms() -> f32 {
    2.0
}

fn default_max_fraction() -> usize {
    4
}

fn ms_to_samples(ms: f32, sample_rate: u32) -> usize {
    ((ms.max(0.0) / 1000.0) * sample_rate as f32).round() as usize
}

/// State carried from one chunk to the next
#[derive(Debug, Clone, PartialEq)]
pub struct CrossfadeState {
    config: CrossfadeConfig,
    window: usize,
    fade_in: usize,
    tail: Option<Vec<f32>>,
}

impl CrossfadeState {
    /// Fresh state for a session at `sample_rate`
    pub fn new(config: CrossfadeConfig, sample_rate: u32) -> Self {
        Self {
            config,
            window: ms_to_samples(config.crossfade_ms, sample_rate),
            fade_in: ms_to_samples(config.fade_in_ms, sample_rate),
            tail: None,
        }
    }

    /// Blend window in samples
    pub fn window(&self) -> usize {
        self.window
    }

    pub fn fade_in_len(&self) -> usize {
        self.fade_in
    }

    /// Pristine trailing samples of the previous chunk
    pub fn tail(&self) -> Option<&[f32]> {
        self.tail.as_deref()
    }

    /// True until the first chunk has gone through
    pub fn is_first(&self) -> bool {
        self.tail.is_none()
    }

    /// Forget the previous chunk; the next one is treated as the first
    pub fn reset(&mut self) {
        self.tail = None;
    }

    fn capture_tail(&mut self, samples: &[f32]) {
        if self.window == 0 {
            self.tail = Some(Vec::new());
            return;
        }
        let mut tail = vec![0.0f32; self.window];
        let take = samples.len().min(self.window);
        tail[self.window - take..].copy_from_slice(&samples[samples.len() - take..]);
        self.tail = Some(tail);
    }

    fn limit(&self, window: usize, chunk_len: usize) -> usize {
        window.min(chunk_len / self.config.max_fraction.max(1))
    }
}

/// Apply the fade-in or boundary blend to one decoded chunk
pub fn apply_crossfade(samples: &[f32], state: &mut CrossfadeState) -> Vec<f32> {
    let mut out = samples.to_vec();
    if samples.is_empty() {
        return out;
    }

    if state.config.enabled {
        match state.tail.as_deref() {
            None => {
                let w = state.limit(state.fade_in, samples.len());
                for (i, sample) in out.iter_mut().take(w).enumerate() {
                    let t = i as f32 / w as f32;
                    *sample *= (t * FRAC_PI_2).sin();
                }
            }
            Some(tail) => {
                let w = state.limit(state.window, samples.len()).min(tail.len());
                for i in 0..w {
                    let t = i as f32 / w as f32;
                    out[i] = tail[i] * (t * FRAC_PI_2).cos() + samples[i] * (t * FRAC_PI_2).sin();
                }
            }
        }
    }

    // Captured from the input, not from `out`.
    state.capture_tail(samples);
    out
}
