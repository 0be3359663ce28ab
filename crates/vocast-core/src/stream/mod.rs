//! Consuming generation streams

mod client;
mod event;
pub mod sse;

pub use client::{EventStream, GenerationClient, GenerationRequest};
pub use event::{AudioChunk, AudioEvent, Feature, StreamEvent, TranscriptLine};
pub use sse::{events, SseDecoder, StreamStats};
