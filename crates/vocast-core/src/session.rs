//! Streaming playback session shared by chat, audiobook and podcast
//!
//! A session consumes one generation stream, queues its audio chunks, plays
//! them while the rest is still being generated, and builds the combined
//! track once the stream is done. Everything the UI needs to know is sent as
//! [`SessionEvent`]s on the channel returned by [`PlaybackSession::new`].

use futures::future::{AbortHandle, Abortable};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::{combine, CombinedTrack};
use crate::config::PlaybackConfig;
use crate::error::{Error, Result};
use crate::playback::{
    ActiveVoices, AudioOutput, ChunkQueue, Command, Control, Enqueued, OutputClaim,
    PlaybackDriver, PlaybackMode, PlaybackStatus, Scheduler, SchedulerContext, Teardown,
};
use crate::stream::{
    AudioChunk, Feature, GenerationClient, GenerationRequest, StreamEvent, TranscriptLine,
};

/// Events emitted by a session to the application layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A chunk was received and queued
    ChunkReady { index: usize, received: usize },

    /// Display metadata of a received chunk
    SegmentInfo {
        index: usize,
        speaker: String,
        text: String,
        voice_used: String,
        /// `None` when the payload could not be decoded
        duration: Option<f64>,
    },

    /// A chunk started sounding
    SegmentStarted {
        index: usize,
        speaker: String,
        text: String,
    },

    /// A chunk played to its end
    SegmentEnded { index: usize },

    /// A chunk could not be decoded or played and was passed over
    ChunkSkipped { index: usize, reason: String },

    /// Partial LLM text (chat)
    Content(String),

    /// Full transcript (podcast)
    Transcript(Vec<TranscriptLine>),

    /// Generation progress (podcast)
    Phase { percent: f32, message: String },

    /// The stream finished; `duration` is the combined track length
    GenerationComplete {
        chunks: usize,
        duration: Option<f64>,
    },

    GenerationFailed(String),

    /// Every queued chunk of a finished generation has played
    PlaybackComplete,

    StatusChanged(PlaybackStatus),
}

/// Where the generation stream stands
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum GenerationState {
    #[default]
    Idle,
    Generating,
    Complete,
    Failed(String),
    /// Aborted by `stop`
    Cancelled,
}

/// Point-in-time view of a session, for rendering
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub feature: Feature,
    pub generation: GenerationState,
    pub status: PlaybackStatus,
    pub is_generating: bool,
    pub is_playing: bool,
    pub is_paused: bool,
    pub play_index: usize,
    pub received: usize,
    pub combined_duration: Option<f64>,
}

#[derive(Default)]
struct SessionState {
    generation: GenerationState,
    claim: Option<Arc<OutputClaim>>,
    scheduler: Option<JoinHandle<()>>,
    abort: Option<AbortHandle>,
    combined: Option<Arc<CombinedTrack>>,
    autoplay: bool,
    next_arrival: usize,
}

struct SessionInner {
    id: Uuid,
    feature: Feature,
    config: PlaybackConfig,
    driver: Arc<PlaybackDriver>,
    ctx: SchedulerContext,
    control: watch::Sender<Control>,
    state: Mutex<SessionState>,
}

enum Flow {
    Continue,
    Done,
    Failed(String),
}

/// One generation and its playback
#[derive(Clone)]
pub struct PlaybackSession {
    inner: Arc<SessionInner>,
}

impl PlaybackSession {
    /// Create a session playing through `output`
    ///
    /// Returns the session and the receiver for its [`SessionEvent`]s.
    pub fn new(
        feature: Feature,
        config: PlaybackConfig,
        driver: Arc<PlaybackDriver>,
        output: Arc<dyn AudioOutput>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(PlaybackStatus::Idle);
        let (control, _) = watch::channel(Control::default());
        let id = Uuid::new_v4();

        let inner = SessionInner {
            id,
            feature,
            driver,
            ctx: SchedulerContext {
                queue: Arc::new(ChunkQueue::new()),
                output,
                voices: ActiveVoices::new(),
                status: Arc::new(status),
                events: events_tx,
            },
            control,
            state: Mutex::new(SessionState {
                autoplay: config.autoplay,
                ..SessionState::default()
            }),
            config,
        };
        debug!(session = %id, %feature, "Session created");

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn feature(&self) -> Feature {
        self.inner.feature
    }

    /// Start a generation with `client` and consume it
    pub async fn run_generation(
        &self,
        client: &GenerationClient,
        request: &GenerationRequest,
    ) -> Result<()> {
        self.inner.begin_generation()?;
        match client.start(request).await {
            Ok(events) => self.consume_started(events).await,
            Err(e) => {
                self.inner.fail_generation(e.to_string());
                Err(e)
            }
        }
    }

    /// Consume an already opened event stream
    ///
    /// Returns when the stream ends, fails or is aborted by [`stop`](Self::stop).
    /// Transport errors and `error` events are returned as errors after the
    /// session has been marked failed; audio already queued keeps playing.
    pub async fn consume<S>(&self, events: S) -> Result<()>
    where
        S: Stream<Item = Result<StreamEvent>> + Send,
    {
        self.inner.begin_generation()?;
        self.consume_started(events).await
    }

    async fn consume_started<S>(&self, events: S) -> Result<()>
    where
        S: Stream<Item = Result<StreamEvent>> + Send,
    {
        let (abort, registration) = AbortHandle::new_pair();
        {
            let mut state = self.inner.lock();
            if state.generation == GenerationState::Cancelled {
                return Ok(());
            }
            state.abort = Some(abort);
        }

        let mut events = std::pin::pin!(Abortable::new(events, registration));
        let mut done = false;
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => match self.inner.handle_event(event) {
                    Flow::Continue => {}
                    Flow::Done => {
                        done = true;
                        break;
                    }
                    Flow::Failed(message) => {
                        self.inner.fail_generation(message.clone());
                        return Err(Error::GenerationFailed(message));
                    }
                },
                Err(e) => {
                    error!(session = %self.inner.id, "Generation stream failed: {}", e);
                    self.inner.fail_generation(e.to_string());
                    return Err(e);
                }
            }
        }

        if self.inner.lock().generation == GenerationState::Cancelled {
            info!(session = %self.inner.id, "Generation aborted");
            return Ok(());
        }
        if !done {
            warn!(session = %self.inner.id, "Stream ended without a done event");
        }
        self.inner.complete_generation();
        Ok(())
    }

    /// Queue a chunk received outside of [`consume`](Self::consume)
    pub fn enqueue(&self, chunk: AudioChunk) -> Enqueued {
        self.inner.enqueue(chunk)
    }

    /// Mark the current set of chunks as final
    pub fn close(&self) {
        self.inner.ctx.queue.close();
    }

    /// Start or continue playback from the cursor
    ///
    /// Claims the output in [`PlaybackMode::Wav`]; whoever held it before is
    /// torn down first.
    pub fn play(&self) -> Result<()> {
        self.inner.play()
    }

    /// Silence the current chunk and hold the cursor on it
    pub fn pause(&self) {
        let inner = &self.inner;
        if !inner.scheduler_alive() {
            return;
        }
        let changed = inner.control.send_if_modified(|control| {
            if control.command == Command::Play {
                control.command = Command::Pause;
                true
            } else {
                false
            }
        });
        if changed {
            inner.ctx.voices.stop_all();
            info!(session = %inner.id, index = inner.ctx.queue.cursor(), "Playback paused");
        }
    }

    /// Continue after [`pause`](Self::pause), replaying the interrupted chunk
    pub fn resume(&self) -> Result<()> {
        if self.inner.control.borrow().command != Command::Pause {
            return Err(Error::InvalidTransition(
                "resume requires a paused session".to_string(),
            ));
        }
        self.inner.play()
    }

    /// Stop playback, rewind to the first chunk and abort the generation
    pub fn stop(&self) {
        self.inner.halt("stop");
    }

    /// Build (or rebuild) the combined track from every received chunk
    pub fn combine(&self) -> Result<Arc<CombinedTrack>> {
        self.inner.combine()
    }

    pub fn combined(&self) -> Option<Arc<CombinedTrack>> {
        self.inner.lock().combined.clone()
    }

    /// Every received chunk, in sequence order
    pub fn chunks(&self) -> Vec<Arc<AudioChunk>> {
        self.inner.ctx.queue.snapshot()
    }

    pub fn status(&self) -> PlaybackStatus {
        *self.inner.ctx.status.borrow()
    }

    pub fn generation_state(&self) -> GenerationState {
        self.inner.lock().generation.clone()
    }

    pub fn is_generating(&self) -> bool {
        self.inner.lock().generation == GenerationState::Generating
    }

    pub fn is_playing(&self) -> bool {
        self.inner.control.borrow().command == Command::Play
            && matches!(
                self.status(),
                PlaybackStatus::Playing | PlaybackStatus::Buffering
            )
    }

    pub fn is_paused(&self) -> bool {
        self.inner.control.borrow().command == Command::Pause
    }

    /// Index of the chunk under the play cursor
    pub fn play_index(&self) -> usize {
        self.inner.ctx.queue.cursor()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (generation, combined) = {
            let state = self.inner.lock();
            (state.generation.clone(), state.combined.clone())
        };
        SessionSnapshot {
            id: self.inner.id,
            feature: self.inner.feature,
            is_generating: generation == GenerationState::Generating,
            generation,
            status: self.status(),
            is_playing: self.is_playing(),
            is_paused: self.is_paused(),
            play_index: self.play_index(),
            received: self.inner.ctx.queue.received(),
            combined_duration: combined.map(|t| t.duration()),
        }
    }

    /// Wait until playback completes or is stopped
    pub async fn wait_for_playback(&self) -> PlaybackStatus {
        let mut status = self.inner.ctx.status.subscribe();
        let mut control = self.inner.control.subscribe();
        let mut started = false;
        loop {
            let current = *status.borrow_and_update();
            let command = control.borrow_and_update().command;
            started |= current != PlaybackStatus::Idle;
            match (current, command) {
                (PlaybackStatus::Complete, _) | (_, Command::Stop) => return current,
                (PlaybackStatus::Idle, Command::Play)
                    if started || !self.inner.scheduler_alive() =>
                {
                    return current
                }
                _ => {}
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return current;
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        return current;
                    }
                }
            }
        }
    }
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        if self.ctx.events.send(event).is_err() {
            debug!(session = %self.id, "Session event receiver dropped");
        }
    }

    fn owner(&self) -> String {
        format!("{} session {}", self.feature, self.id)
    }

    fn scheduler_alive(&self) -> bool {
        self.lock()
            .scheduler
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn set_status(&self, status: PlaybackStatus) {
        let changed = self.ctx.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if changed {
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn begin_generation(&self) -> Result<()> {
        let mut state = self.lock();
        if state.generation != GenerationState::Idle {
            return Err(Error::InvalidTransition(format!(
                "session already has a generation ({:?})",
                state.generation
            )));
        }
        state.generation = GenerationState::Generating;
        info!(session = %self.id, feature = %self.feature, "Generation started");
        Ok(())
    }

    fn fail_generation(&self, message: String) {
        {
            let mut state = self.lock();
            state.generation = GenerationState::Failed(message.clone());
            state.abort = None;
        }
        self.ctx.queue.close();
        self.emit(SessionEvent::GenerationFailed(message));
    }

    fn complete_generation(&self) {
        {
            let mut state = self.lock();
            state.generation = GenerationState::Complete;
            state.abort = None;
        }
        self.ctx.queue.close();

        let chunks = self.ctx.queue.received();
        let duration = match self.combine() {
            Ok(track) => Some(track.duration()),
            Err(e) => {
                warn!(session = %self.id, "No combined track: {}", e);
                None
            }
        };
        info!(session = %self.id, chunks, "Generation complete");
        self.emit(SessionEvent::GenerationComplete { chunks, duration });
    }

    fn handle_event(self: &Arc<Self>, event: StreamEvent) -> Flow {
        match event {
            StreamEvent::Audio(audio) => {
                let fallback = {
                    let mut state = self.lock();
                    let index = state.next_arrival;
                    state.next_arrival += 1;
                    index
                };
                self.enqueue(AudioChunk::from_event(audio, fallback));
            }
            StreamEvent::Content { content } => self.emit(SessionEvent::Content(content)),
            StreamEvent::Transcript { transcript } => {
                debug!(session = %self.id, lines = transcript.len(), "Transcript received");
                self.emit(SessionEvent::Transcript(transcript));
            }
            StreamEvent::Phase { percent, message } => {
                debug!(session = %self.id, percent, "{}", message);
                self.emit(SessionEvent::Phase { percent, message });
            }
            StreamEvent::Done => return Flow::Done,
            StreamEvent::Error { error } => {
                error!(session = %self.id, "Generation error: {}", error);
                return Flow::Failed(error);
            }
            StreamEvent::Unknown => debug!(session = %self.id, "Ignoring unknown event"),
        }
        Flow::Continue
    }

    fn enqueue(self: &Arc<Self>, chunk: AudioChunk) -> Enqueued {
        let index = chunk.sequence_index;
        let info = SessionEvent::SegmentInfo {
            index,
            speaker: chunk.speaker.clone(),
            text: chunk.text.clone(),
            voice_used: chunk.voice_used.clone(),
            duration: chunk.decode().ok().map(|pcm| pcm.duration_secs()),
        };

        let outcome = self.ctx.queue.enqueue(chunk);
        if !matches!(outcome, Enqueued::Ready { .. } | Enqueued::Buffered { .. }) {
            return outcome;
        }

        self.emit(info);
        self.emit(SessionEvent::ChunkReady {
            index,
            received: self.ctx.queue.received(),
        });

        let autoplay = std::mem::take(&mut self.lock().autoplay);
        if autoplay {
            if let Err(e) = self.play() {
                warn!(session = %self.id, "Autoplay failed: {}", e);
            }
        }
        outcome
    }

    fn play(self: &Arc<Self>) -> Result<()> {
        let control = *self.control.borrow();
        let alive = self.scheduler_alive();

        if alive && control.command == Command::Play {
            return Ok(());
        }
        if alive && control.command == Command::Pause {
            self.control.send_modify(|c| c.command = Command::Play);
            info!(session = %self.id, index = self.ctx.queue.cursor(), "Playback resumed");
            return Ok(());
        }

        let claim = self.claim()?;
        if self.ctx.queue.is_drained() {
            self.ctx.queue.reset_cursor();
        }

        self.control.send_modify(|c| c.command = Command::Play);
        let scheduler = Scheduler::new(
            self.ctx.clone(),
            self.config.clone(),
            claim,
            self.control.subscribe(),
        );
        let task = tokio::spawn(scheduler.run());
        let mut state = self.lock();
        state.autoplay = false;
        if let Some(previous) = state.scheduler.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn claim(self: &Arc<Self>) -> Result<Arc<OutputClaim>> {
        if let Some(claim) = self.lock().claim.as_ref().filter(|c| c.is_active()) {
            return Ok(Arc::clone(claim));
        }

        let weak: Weak<SessionInner> = Arc::downgrade(self);
        let teardown: Arc<dyn Teardown> = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.halt("preempted");
            }
        });
        let claim = Arc::new(
            self.driver
                .claim(PlaybackMode::Wav, self.owner(), teardown)?,
        );
        self.lock().claim = Some(Arc::clone(&claim));
        Ok(claim)
    }

    /// Stop everything this session holds
    fn halt(&self, reason: &str) {
        self.control.send_modify(|c| {
            c.command = Command::Stop;
            c.epoch += 1;
        });
        self.ctx.voices.stop_all();
        self.ctx.queue.reset_cursor();

        let (task, abort, claim, aborted) = {
            let mut state = self.lock();
            state.autoplay = false;
            let aborted = state.generation == GenerationState::Generating;
            if aborted {
                state.generation = GenerationState::Cancelled;
            }
            (
                state.scheduler.take(),
                state.abort.take(),
                state.claim.take(),
                aborted,
            )
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(abort) = abort {
            abort.abort();
        }
        if aborted {
            self.ctx.queue.close();
        }
        drop(claim);

        self.set_status(PlaybackStatus::Idle);
        info!(session = %self.id, reason, "Playback stopped");
    }

    fn combine(&self) -> Result<Arc<CombinedTrack>> {
        if self.lock().generation == GenerationState::Generating {
            return Err(Error::InvalidTransition(
                "cannot combine while generation is running".to_string(),
            ));
        }
        // Release the previous track before building its replacement
        self.lock().combined = None;

        let track = Arc::new(combine(&self.ctx.queue.snapshot())?);
        debug!(
            session = %self.id,
            duration = track.duration(),
            segments = track.segments().len(),
            "Combined track ready"
        );
        self.lock().combined = Some(Arc::clone(&track));
        Ok(track)
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = state.scheduler.take() {
            task.abort();
        }
        if let Some(abort) = state.abort.take() {
            abort.abort();
        }
        self.ctx.voices.stop_all();
        debug!(session = %self.id, "Session released");
    }
}
