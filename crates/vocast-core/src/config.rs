//! Configuration types for the vocast pipeline

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::CrossfadeConfig;
use crate::error::{Error, Result};
use crate::stream::Feature;

/// Top-level settings, usually loaded from `vocast.toml` plus environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Settings {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let url = &self.stream.base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::ConfigError(format!(
                "stream.base_url must be an http(s) URL, got '{url}'"
            )));
        }
        if self.playback.lookahead == 0 {
            return Err(Error::ConfigError(
                "playback.lookahead must be at least 1".to_string(),
            ));
        }
        let crossfade = &self.playback.crossfade;
        if crossfade.crossfade_ms < 0.0 || crossfade.fade_in_ms < 0.0 {
            return Err(Error::ConfigError(
                "crossfade windows cannot be negative".to_string(),
            ));
        }
        if crossfade.max_fraction == 0 {
            return Err(Error::ConfigError(
                "playback.crossfade.max_fraction must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How chunks are placed on the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingStrategy {
    /// One clip per chunk, the next one starts when the previous ends
    #[default]
    Sequential,
    /// Clips are placed ahead of time on the output clock
    Timeline,
}

/// Playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub strategy: SchedulingStrategy,

    /// Start playing as soon as the first chunk arrives
    #[serde(default = "default_autoplay")]
    pub autoplay: bool,

    /// Clips scheduled ahead of the cursor in timeline mode
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,

    /// Period of time-update ticks for the combined-track player
    #[serde(default = "default_time_update_ms")]
    pub time_update_ms: u64,

    #[serde(default)]
    pub crossfade: CrossfadeConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulingStrategy::default(),
            autoplay: default_autoplay(),
            lookahead: default_lookahead(),
            time_update_ms: default_time_update_ms(),
            crossfade: CrossfadeConfig::default(),
        }
    }
}

impl PlaybackConfig {
    pub fn time_update_interval(&self) -> Duration {
        Duration::from_millis(self.time_update_ms.max(1))
    }
}

fn default_autoplay() -> bool {
    true
}

fn default_lookahead() -> usize {
    2
}

fn default_time_update_ms() -> u64 {
    250
}

/// Generation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_chat_endpoint")]
    pub chat_endpoint: String,

    #[serde(default = "default_audiobook_endpoint")]
    pub audiobook_endpoint: String,

    #[serde(default = "default_podcast_endpoint")]
    pub podcast_endpoint: String,

    /// Connect timeout in seconds; the body itself may stream for much longer
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_endpoint: default_chat_endpoint(),
            audiobook_endpoint: default_audiobook_endpoint(),
            podcast_endpoint: default_podcast_endpoint(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl StreamConfig {
    /// Endpoint path for a feature
    pub fn endpoint(&self, feature: Feature) -> &str {
        match feature {
            Feature::Chat => &self.chat_endpoint,
            Feature::Audiobook => &self.audiobook_endpoint,
            Feature::Podcast => &self.podcast_endpoint,
        }
    }

    /// Absolute URL for a feature's generation endpoint
    pub fn url(&self, feature: Feature) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint(feature).trim_start_matches('/')
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_chat_endpoint() -> String {
    "/api/chat/stream".to_string()
}

fn default_audiobook_endpoint() -> String {
    "/api/audiobook/generate".to_string()
}

fn default_podcast_endpoint() -> String {
    "/api/podcast/generate".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Where combined tracks are written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::download_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vocast")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.playback.strategy, SchedulingStrategy::Sequential);
        assert!(settings.playback.autoplay);
        assert_eq!(settings.playback.lookahead, 2);
        assert_eq!(settings.stream.connect_timeout_secs, 10);
    }

    #[test]
    fn test_feature_url_joins_slashes() {
        let config = StreamConfig {
            base_url: "http://localhost:9000/".to_string(),
            ..StreamConfig::default()
        };
        assert_eq!(
            config.url(Feature::Podcast),
            "http://localhost:9000/api/podcast/generate"
        );
    }

    #[test]
    fn test_strategy_parses_lowercase() {
        let config: PlaybackConfig =
            serde_json::from_str(r#"{"strategy":"timeline"}"#).unwrap();
        assert_eq!(config.strategy, SchedulingStrategy::Timeline);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(Settings::default().validate().is_ok());

        let mut settings = Settings::default();
        settings.stream.base_url = "localhost:8000".to_string();
        assert!(matches!(settings.validate(), Err(Error::ConfigError(_))));

        let mut settings = Settings::default();
        settings.playback.lookahead = 0;
        assert!(settings.validate().is_err());
    }
}
