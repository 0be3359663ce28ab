//! Chunk queueing, scheduling and output
//!
//! - [`ChunkQueue`]: ordered, awaitable store of received chunks
//! - [`Scheduler`]: drains the queue into an [`AudioOutput`]
//! - [`PlaybackDriver`]: decides which feature may produce sound
//! - [`VirtualOutput`] / `DeviceOutput`: clock-driven and speaker outputs

#[cfg(feature = "device")]
mod device;
mod driver;
mod output;
mod queue;
mod scheduler;
mod virtual_output;

#[cfg(feature = "device")]
pub use device::DeviceOutput;
pub use driver::{OutputClaim, PlaybackDriver, PlaybackMode, ResourceGuard, Teardown};
pub use output::{AudioOutput, Clip, Voice, VoiceControl, VoiceEnd};
pub use queue::{ChunkQueue, Enqueued};
pub use scheduler::{
    ActiveVoices, Command, Control, PlaybackStatus, Scheduler, SchedulerContext, TrackedVoice,
};
pub use virtual_output::{OutputEvent, VirtualOutput};
