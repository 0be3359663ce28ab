//! Playback scheduler: takes chunks off the queue in order and plays them
//!
//! One scheduler task runs per `play()` of a session. It owns the crossfade
//! state and the clips it has prepared, and listens to a `watch` channel for
//! pause and stop. Stopping bumps the control epoch; a scheduler whose epoch
//! is stale exits without touching shared state.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::driver::OutputClaim;
use super::output::{AudioOutput, Clip, Voice, VoiceControl, VoiceEnd};
use super::queue::ChunkQueue;
use crate::audio::{apply_crossfade, CrossfadeState};
use crate::config::{PlaybackConfig, SchedulingStrategy};
use crate::error::Result;
use crate::session::SessionEvent;
use crate::stream::AudioChunk;

/// What the scheduler is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    #[default]
    Idle,
    /// Waiting for the next chunk to arrive
    Buffering,
    Playing,
    Paused,
    /// Every chunk of a finished generation has been played
    Complete,
}

/// Command sent to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play,
    Pause,
    Stop,
}

/// Control channel value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub command: Command,
    /// Incremented by every stop
    pub epoch: u64,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            command: Command::Stop,
            epoch: 0,
        }
    }
}

/// Voices currently handed to the output, so they can be silenced from
/// outside the scheduler task
#[derive(Default)]
pub struct ActiveVoices {
    next: AtomicU64,
    voices: Mutex<HashMap<u64, Arc<dyn VoiceControl>>>,
}

impl ActiveVoices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn track(self: &Arc<Self>, voice: Voice) -> TrackedVoice {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.voices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, voice.control());
        TrackedVoice {
            voice,
            id,
            registry: Arc::clone(self),
        }
    }

    /// Stop every tracked voice immediately
    pub fn stop_all(&self) {
        let voices: Vec<_> = self
            .voices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, v)| v)
            .collect();
        if !voices.is_empty() {
            debug!("Stopping {} active voice(s)", voices.len());
        }
        for voice in voices {
            voice.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.voices.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.voices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// A voice registered in [`ActiveVoices`]; stopped and unregistered on drop
pub struct TrackedVoice {
    voice: Voice,
    id: u64,
    registry: Arc<ActiveVoices>,
}

impl TrackedVoice {
    pub fn index(&self) -> usize {
        self.voice.index()
    }

    pub async fn finished(&mut self) -> VoiceEnd {
        self.voice.finished().await
    }
}

impl Drop for TrackedVoice {
    fn drop(&mut self) {
        self.voice.stop();
        self.registry.remove(self.id);
    }
}

/// Handles the scheduler shares with its session
#[derive(Clone)]
pub struct SchedulerContext {
    pub queue: Arc<ChunkQueue>,
    pub output: Arc<dyn AudioOutput>,
    pub voices: Arc<ActiveVoices>,
    pub status: Arc<watch::Sender<PlaybackStatus>>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

enum Next {
    Chunk(Arc<AudioChunk>),
    Drained,
    Interrupted,
}

struct Slot {
    chunk: Arc<AudioChunk>,
    voice: TrackedVoice,
    announced: bool,
}

/// Drains a [`ChunkQueue`] into an [`AudioOutput`]
pub struct Scheduler {
    ctx: SchedulerContext,
    config: PlaybackConfig,
    claim: Arc<OutputClaim>,
    control: watch::Receiver<Control>,
    epoch: u64,
    crossfade: Option<(u32, CrossfadeState)>,
    prepared: HashMap<usize, Clip>,
}

impl Scheduler {
    pub fn new(
        ctx: SchedulerContext,
        config: PlaybackConfig,
        claim: Arc<OutputClaim>,
        control: watch::Receiver<Control>,
    ) -> Self {
        let epoch = control.borrow().epoch;
        Self {
            ctx,
            config,
            claim,
            control,
            epoch,
            crossfade: None,
            prepared: HashMap::new(),
        }
    }

    /// Run until stopped, preempted or drained
    pub async fn run(mut self) {
        info!(
            strategy = ?self.config.strategy,
            output = self.ctx.output.name(),
            cursor = self.ctx.queue.cursor(),
            "Scheduler started"
        );
        match self.config.strategy {
            SchedulingStrategy::Sequential => self.run_sequential().await,
            SchedulingStrategy::Timeline => self.run_timeline().await,
        }
        debug!(epoch = self.epoch, "Scheduler finished");
    }

    fn is_current(&self) -> bool {
        self.control.borrow().epoch == self.epoch
    }

    fn command(&mut self) -> Command {
        let control = *self.control.borrow_and_update();
        if control.epoch != self.epoch {
            Command::Stop
        } else {
            control.command
        }
    }

    /// Wait for the next control change; `false` when this run is over
    async fn wait_for_command(&mut self) -> bool {
        self.control.changed().await.is_ok() && self.is_current()
    }

    fn set_status(&self, status: PlaybackStatus) {
        if !self.is_current() {
            return;
        }
        let changed = self.ctx.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.ctx.events.send(event).is_err() {
            debug!("Session event receiver dropped");
        }
    }

    async fn run_sequential(&mut self) {
        loop {
            match self.command() {
                Command::Stop => return,
                Command::Pause => {
                    self.set_status(PlaybackStatus::Paused);
                    if !self.wait_for_command().await {
                        return;
                    }
                    continue;
                }
                Command::Play => {}
            }

            let index = self.ctx.queue.cursor();
            let chunk = match self.next_chunk(index).await {
                Next::Chunk(chunk) => chunk,
                Next::Drained => return self.complete(),
                Next::Interrupted => continue,
            };

            let clip = match self.prepare(&chunk) {
                Ok(clip) => clip,
                Err(e) => {
                    self.skip(index, index + 1, e.to_string());
                    continue;
                }
            };

            if let Err(e) = self.claim.admit() {
                warn!("Output no longer owned, halting playback: {}", e);
                return;
            }
            let voice = match self.ctx.output.start(clip) {
                Ok(voice) => voice,
                Err(e) => {
                    self.skip(index, index + 1, e.to_string());
                    continue;
                }
            };
            let mut voice = self.ctx.voices.track(voice);
            self.set_status(PlaybackStatus::Playing);
            self.announce(&chunk);

            let end = loop {
                tokio::select! {
                    end = voice.finished() => break Some(end),
                    changed = self.control.changed() => {
                        if changed.is_err() || self.command() != Command::Play {
                            break None;
                        }
                    }
                }
            };
            drop(voice);

            match end {
                Some(VoiceEnd::Completed) => self.finish(index, index + 1),
                Some(VoiceEnd::Failed(reason)) => self.skip(index, index + 1, reason),
                Some(VoiceEnd::Stopped) => {
                    if self.command() == Command::Play {
                        warn!(index, "Voice stopped from outside the session, halting");
                        self.set_status(PlaybackStatus::Idle);
                        return;
                    }
                }
                // Paused or stopped mid-chunk: the cursor stays on `index`
                None => {}
            }
        }
    }

    async fn run_timeline(&mut self) {
        let lookahead = self.config.lookahead.max(1);
        let mut slots: VecDeque<Slot> = VecDeque::new();
        let mut next_index = self.ctx.queue.cursor();
        let mut next_start = Duration::ZERO;
        let mut exhausted = false;

        loop {
            match self.command() {
                Command::Stop => return,
                Command::Pause => {
                    slots.clear();
                    next_index = self.ctx.queue.cursor();
                    next_start = Duration::ZERO;
                    exhausted = false;
                    self.set_status(PlaybackStatus::Paused);
                    if !self.wait_for_command().await {
                        return;
                    }
                    continue;
                }
                Command::Play => {}
            }

            if slots.is_empty() {
                if exhausted {
                    return self.complete();
                }
                if self.ctx.queue.get(next_index).is_none() {
                    self.set_status(PlaybackStatus::Buffering);
                }
            }

            let room = !exhausted && slots.len() < lookahead;
            let front = async {
                match slots.front_mut() {
                    Some(slot) => slot.voice.finished().await,
                    None => std::future::pending::<VoiceEnd>().await,
                }
            };

            tokio::select! {
                end = front => {
                    let Some(slot) = slots.pop_front() else { continue };
                    let index = slot.chunk.sequence_index;
                    let cursor = slots
                        .front()
                        .map(|s| s.chunk.sequence_index)
                        .unwrap_or(next_index);
                    match end {
                        VoiceEnd::Completed => self.finish(index, cursor),
                        VoiceEnd::Failed(reason) => self.skip(index, cursor, reason),
                        VoiceEnd::Stopped => {
                            if self.command() == Command::Play {
                                warn!(index, "Voice stopped from outside the session, halting");
                                self.set_status(PlaybackStatus::Idle);
                                return;
                            }
                            continue;
                        }
                    }
                    self.announce_front(&mut slots);
                }
                chunk = self.ctx.queue.wait_at(next_index), if room => {
                    let Some(chunk) = chunk else {
                        exhausted = true;
                        continue;
                    };
                    let index = next_index;
                    next_index += 1;

                    let clip = match self.prepare(&chunk) {
                        Ok(clip) => clip,
                        Err(e) => {
                            let cursor = if slots.is_empty() { next_index } else { self.ctx.queue.cursor() };
                            self.skip(index, cursor, e.to_string());
                            continue;
                        }
                    };
                    if let Err(e) = self.claim.admit() {
                        warn!("Output no longer owned, halting playback: {}", e);
                        return;
                    }

                    let duration = clip.duration();
                    let at = self.ctx.output.now().max(next_start);
                    match self.ctx.output.schedule(clip, at) {
                        Ok(voice) => {
                            debug!(index, at_ms = at.as_millis() as u64, "Scheduled clip");
                            next_start = at + duration;
                            slots.push_back(Slot {
                                chunk,
                                voice: self.ctx.voices.track(voice),
                                announced: false,
                            });
                            self.set_status(PlaybackStatus::Playing);
                            self.announce_front(&mut slots);
                        }
                        Err(e) => {
                            let cursor = if slots.is_empty() { next_index } else { self.ctx.queue.cursor() };
                            self.skip(index, cursor, e.to_string());
                        }
                    }
                }
                changed = self.control.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn next_chunk(&mut self, index: usize) -> Next {
        if let Some(chunk) = self.ctx.queue.get(index) {
            return Next::Chunk(chunk);
        }
        if !self.ctx.queue.is_closed() {
            debug!(index, "Waiting for chunk");
            self.set_status(PlaybackStatus::Buffering);
        }
        loop {
            tokio::select! {
                chunk = self.ctx.queue.wait_at(index) => {
                    return chunk.map_or(Next::Drained, Next::Chunk);
                }
                changed = self.control.changed() => {
                    if changed.is_err() || self.command() != Command::Play {
                        return Next::Interrupted;
                    }
                }
            }
        }
    }

    /// Decode, crossfade and wrap a chunk, reusing an earlier result
    ///
    /// With crossfading off the payload is played as sent.
    fn prepare(&mut self, chunk: &AudioChunk) -> Result<Clip> {
        let index = chunk.sequence_index;
        if let Some(clip) = self.prepared.get(&index) {
            debug!(index, "Reusing prepared clip");
            return Ok(clip.clone());
        }

        let config = self.config.crossfade;
        if !config.enabled {
            let (wav, rate) = chunk.to_wav()?;
            let clip = Clip::new(index, wav, rate);
            self.prepared.insert(index, clip.clone());
            return Ok(clip);
        }

        let pcm = chunk.decode()?;
        let rate = pcm.sample_rate;
        match &self.crossfade {
            Some((current, _)) if *current == rate => {}
            Some((current, _)) => {
                warn!(index, from = *current, to = rate, "Sample rate changed mid-stream");
                self.crossfade = Some((rate, CrossfadeState::new(config, rate)));
            }
            None => self.crossfade = Some((rate, CrossfadeState::new(config, rate))),
        }

        let samples = pcm.to_f32();
        let processed = match self.crossfade.as_mut() {
            Some((_, state)) => apply_crossfade(&samples, state),
            None => samples,
        };
        let clip = Clip::from_samples(index, &processed, rate)?;
        self.prepared.insert(index, clip.clone());
        Ok(clip)
    }

    fn announce(&self, chunk: &AudioChunk) {
        self.emit(SessionEvent::SegmentStarted {
            index: chunk.sequence_index,
            speaker: chunk.speaker.clone(),
            text: chunk.text.clone(),
        });
    }

    fn announce_front(&self, slots: &mut VecDeque<Slot>) {
        if let Some(slot) = slots.front_mut() {
            if !slot.announced {
                slot.announced = true;
                self.announce(&slot.chunk);
            }
        }
    }

    fn finish(&mut self, index: usize, cursor: usize) {
        self.prepared.remove(&index);
        if !self.is_current() {
            return;
        }
        self.ctx.queue.set_cursor(cursor);
        self.emit(SessionEvent::SegmentEnded { index });
    }

    fn skip(&mut self, index: usize, cursor: usize, reason: String) {
        warn!(index, "Skipping chunk: {}", reason);
        self.prepared.remove(&index);
        if !self.is_current() {
            return;
        }
        self.ctx.queue.set_cursor(cursor);
        self.emit(SessionEvent::ChunkSkipped { index, reason });
    }

    fn complete(&mut self) {
        if !self.is_current() {
            return;
        }
        info!(chunks = self.ctx.queue.playable_len(), "Playback complete");
        self.set_status(PlaybackStatus::Complete);
        self.emit(SessionEvent::PlaybackComplete);
    }
}
