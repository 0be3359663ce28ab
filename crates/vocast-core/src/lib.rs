//! Vocast Core - Streaming speech playback
//!
//! This crate consumes text-to-speech generations streamed as server-sent
//! events and plays the audio chunk by chunk while generation continues.
//!
//! # Architecture
//!
//! - `stream`: SSE transport and event decoding
//! - `playback`: ordered chunk queue, scheduler and audio outputs
//! - `session`: one generation plus its playback, with play/pause/stop
//! - `audio`: WAV handling, chunk crossfade and the combined track
//! - `player`: seekable playback of the combined track
//! - `conversation`: turn state for realtime voice mode
//!
//! Only one feature produces sound at a time: every session and player
//! claims the output from a shared [`PlaybackDriver`].
//!
//! # Example
//!
//! ```ignore
//! use vocast_core::{Feature, GenerationClient, GenerationRequest, PlaybackSession};
//!
//! let client = GenerationClient::new(settings.stream.clone())?;
//! let (session, mut events) =
//!     PlaybackSession::new(Feature::Audiobook, settings.playback, driver, output);
//!
//! let request = GenerationRequest::text(Feature::Audiobook, "Chapter one.");
//! session.run_generation(&client, &request).await?;
//! session.wait_for_playback().await;
//! ```

pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod playback;
pub mod player;
pub mod session;
pub mod stream;

pub use audio::{combine, CombinedTrack, SegmentTiming};
pub use config::{OutputConfig, PlaybackConfig, SchedulingStrategy, Settings, StreamConfig};
pub use conversation::{Conversation, ConversationState};
pub use error::{Error, Result};
#[cfg(feature = "device")]
pub use playback::DeviceOutput;
pub use playback::{
    AudioOutput, ChunkQueue, PlaybackDriver, PlaybackMode, PlaybackStatus, VirtualOutput,
};
pub use player::{PlayerEvent, PlayerState, TrackPlayer};
pub use session::{GenerationState, PlaybackSession, SessionEvent, SessionSnapshot};
pub use stream::{AudioChunk, Feature, GenerationClient, GenerationRequest, StreamEvent};
