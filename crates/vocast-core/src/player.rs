//! Seekable player for a finished, combined track

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audio::{encode_wav, CombinedTrack};
use crate::error::Result;
use crate::playback::{
    AudioOutput, Clip, OutputClaim, PlaybackDriver, PlaybackMode, Teardown, VoiceControl,
    VoiceEnd,
};

/// Player state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    #[default]
    Idle,
    Playing,
    Paused,
}

/// Events emitted by a [`TrackPlayer`]
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StateChanged(PlayerState),
    /// Periodic position report while playing, and after every seek
    TimeUpdate {
        position: f64,
        segment: Option<usize>,
    },
    /// The now-playing segment changed
    SegmentChanged(Option<usize>),
    /// Played to the end; the player is back at 0
    Ended,
}

#[derive(Default)]
struct PlayerShared {
    state: PlayerState,
    /// Track position at which the current voice started, or the held position
    offset: f64,
    voice: Option<Arc<dyn VoiceControl>>,
    claim: Option<OutputClaim>,
    /// Bumped on every start and stop so a stale voice end is ignored
    run: u64,
    segment: Option<usize>,
}

struct PlayerInner {
    track: Arc<CombinedTrack>,
    driver: Arc<PlaybackDriver>,
    output: Arc<dyn AudioOutput>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    shared: Mutex<PlayerShared>,
}

/// `Idle -> Playing <-> Paused -> Idle` over a [`CombinedTrack`]
#[derive(Clone)]
pub struct TrackPlayer {
    inner: Arc<PlayerInner>,
}

impl TrackPlayer {
    pub fn new(
        track: Arc<CombinedTrack>,
        driver: Arc<PlaybackDriver>,
        output: Arc<dyn AudioOutput>,
    ) -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = PlayerInner {
            track,
            driver,
            output,
            events,
            shared: Mutex::new(PlayerShared::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn track(&self) -> &Arc<CombinedTrack> {
        &self.inner.track
    }

    pub fn duration(&self) -> f64 {
        self.inner.track.duration()
    }

    pub fn state(&self) -> PlayerState {
        self.inner.lock().state
    }

    /// Current position in seconds
    pub fn position(&self) -> f64 {
        self.inner.position()
    }

    /// Index of the segment under the current position
    pub fn current_segment(&self) -> Option<usize> {
        self.inner
            .track
            .segment_at(self.position())
            .map(|s| s.sequence_index)
    }

    /// Start from the held position
    pub fn play(&self) -> Result<()> {
        if self.state() == PlayerState::Playing {
            return Ok(());
        }
        let offset = self.inner.lock().offset;
        self.inner.start_at(offset)
    }

    pub fn pause(&self) {
        let inner = &self.inner;
        let position = inner.position();
        let voice = {
            let mut shared = inner.lock();
            if shared.state != PlayerState::Playing {
                return;
            }
            shared.run += 1;
            shared.offset = position;
            shared.voice.take()
        };
        if let Some(voice) = voice {
            voice.stop();
        }
        inner.set_state(PlayerState::Paused);
        debug!(position, "Player paused");
    }

    /// Back to `Idle` at position 0
    pub fn stop(&self) {
        self.inner.halt();
    }

    /// Move to `time` seconds, clamped to the track
    ///
    /// Valid in every state; a playing track continues from the new position.
    pub fn seek(&self, time: f64) -> Result<()> {
        let target = time.clamp(0.0, self.duration());
        let playing = {
            let mut shared = self.inner.lock();
            shared.offset = target;
            shared.state == PlayerState::Playing
        };
        debug!(target, "Seek");
        if playing {
            self.inner.start_at(target)?;
        }
        self.time_update();
        Ok(())
    }

    /// Recompute the now-playing segment and report the position
    pub fn time_update(&self) -> f64 {
        let position = self.position();
        let segment = self
            .inner
            .track
            .segment_at(position)
            .map(|s| s.sequence_index);
        let changed = {
            let mut shared = self.inner.lock();
            let changed = shared.segment != segment;
            shared.segment = segment;
            changed
        };
        if changed {
            self.inner.emit(PlayerEvent::SegmentChanged(segment));
        }
        self.inner.emit(PlayerEvent::TimeUpdate { position, segment });
        position
    }

    /// Emit time updates every `period` while playing
    ///
    /// The task ends once the player is dropped.
    pub fn spawn_time_updates(&self, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let player = TrackPlayer { inner };
                if player.state() == PlayerState::Playing {
                    player.time_update();
                }
            }
        })
    }
}

impl PlayerInner {
    fn lock(&self) -> MutexGuard<'_, PlayerShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PlayerEvent) {
        if self.events.send(event).is_err() {
            debug!("Player event receiver dropped");
        }
    }

    fn set_state(&self, state: PlayerState) {
        let changed = {
            let mut shared = self.lock();
            let changed = shared.state != state;
            shared.state = state;
            changed
        };
        if changed {
            self.emit(PlayerEvent::StateChanged(state));
        }
    }

    fn position(&self) -> f64 {
        let shared = self.lock();
        let played = match (&shared.voice, shared.state) {
            (Some(voice), PlayerState::Playing) => voice.position().as_secs_f64(),
            _ => 0.0,
        };
        (shared.offset + played).min(self.track.duration())
    }

    fn claim(self: &Arc<Self>) -> Result<()> {
        if self.lock().claim.as_ref().is_some_and(|c| c.is_active()) {
            return Ok(());
        }
        let weak: Weak<PlayerInner> = Arc::downgrade(self);
        let teardown: Arc<dyn Teardown> = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.halt();
            }
        });
        let claim = self
            .driver
            .claim(PlaybackMode::Wav, "track player", teardown)?;
        self.lock().claim = Some(claim);
        Ok(())
    }

    fn start_at(self: &Arc<Self>, offset: f64) -> Result<()> {
        self.claim()?;

        let rate = self.track.sample_rate();
        let wav = encode_wav(self.track.pcm_from(offset), rate)?;

        // The old voice is silenced before the new one exists
        let previous = {
            let mut shared = self.lock();
            shared.run += 1;
            shared.offset = offset;
            shared.voice.take()
        };
        if let Some(previous) = previous {
            previous.stop();
        }

        let mut voice = match self.output.start(Clip::new(0, wav, rate)) {
            Ok(voice) => voice,
            Err(e) => {
                self.set_state(PlayerState::Paused);
                return Err(e);
            }
        };
        let run = {
            let mut shared = self.lock();
            shared.run += 1;
            shared.voice = Some(voice.control());
            shared.run
        };
        self.set_state(PlayerState::Playing);
        info!(offset, "Playing combined track");

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let end = voice.finished().await;
            if let Some(inner) = weak.upgrade() {
                inner.voice_ended(run, end);
            }
        });
        Ok(())
    }

    fn voice_ended(&self, run: u64, end: VoiceEnd) {
        {
            let mut shared = self.lock();
            if shared.run != run {
                return;
            }
            shared.run += 1;
            shared.voice = None;
            shared.offset = 0.0;
            shared.segment = None;
        }
        match end {
            VoiceEnd::Completed => {
                self.set_state(PlayerState::Idle);
                self.emit(PlayerEvent::Ended);
                info!("Combined track ended");
            }
            other => {
                debug!(?other, "Track voice ended early");
                self.set_state(PlayerState::Idle);
            }
        }
    }

    fn halt(&self) {
        let (voice, claim) = {
            let mut shared = self.lock();
            shared.run += 1;
            shared.offset = 0.0;
            shared.segment = None;
            (shared.voice.take(), shared.claim.take())
        };
        if let Some(voice) = voice {
            voice.stop();
        }
        drop(claim);
        self.set_state(PlayerState::Idle);
    }
}

impl Drop for PlayerInner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(voice) = shared.voice.take() {
            voice.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::combine;
    use crate::playback::{OutputEvent, VirtualOutput};
    use crate::stream::AudioChunk;
    use base64::Engine as _;

    fn track(segments: &[usize]) -> Arc<CombinedTrack> {
        let chunks: Vec<_> = segments
            .iter()
            .enumerate()
            .map(|(i, millis)| {
                Arc::new(AudioChunk {
                    sequence_index: i,
                    audio: base64::engine::general_purpose::STANDARD
                        .encode(vec![0u8; 48 * millis]),
                    sample_rate: 24000,
                    speaker: String::new(),
                    text: String::new(),
                    voice_used: String::new(),
                })
            })
            .collect();
        Arc::new(combine(&chunks).unwrap())
    }

    fn player(
        segments: &[usize],
    ) -> (
        TrackPlayer,
        mpsc::UnboundedReceiver<PlayerEvent>,
        VirtualOutput,
    ) {
        let output = VirtualOutput::new();
        let driver = PlaybackDriver::new(PlaybackMode::Wav);
        let (player, events) =
            TrackPlayer::new(track(segments), driver, Arc::new(output.clone()));
        (player, events, output)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_to_end_and_returns_to_idle() {
        let (player, mut events, output) = player(&[500, 500]);
        player.play().unwrap();
        assert_eq!(player.state(), PlayerState::Playing);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(player.state(), PlayerState::Idle);
        assert_eq!(player.position(), 0.0);
        assert_eq!(output.completed(), vec![0]);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.last(), Some(&PlayerEvent::Ended));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_clamps() {
        let (player, _events, _output) = player(&[500, 500]);
        player.seek(-3.0).unwrap();
        assert_eq!(player.position(), 0.0);
        player.seek(42.0).unwrap();
        assert!(close(player.position(), 1.0));
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_position() {
        let (player, _events, output) = player(&[500, 500]);
        player.play().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        player.pause();
        assert_eq!(player.state(), PlayerState::Paused);
        assert!(close(player.position(), 0.4));
        assert_eq!(output.live(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(close(player.position(), 0.4));

        player.play().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(close(player.position(), 0.7));
        assert_eq!(player.current_segment(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_while_playing_restarts_voice() {
        let (player, _events, output) = player(&[500, 500, 500]);
        player.play().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        player.seek(1.2).unwrap();
        assert_eq!(player.state(), PlayerState::Playing);
        assert_eq!(output.live(), 1);
        assert_eq!(player.current_segment(), Some(2));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_never_overlaps_voices() {
        let (player, _events, output) = player(&[500, 500]);
        player.play().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        player.seek(0.5).unwrap();
        player.seek(0.2).unwrap();
        assert_eq!(output.max_live(), 1);

        let at = Duration::from_millis(100);
        assert_eq!(
            output.events(),
            vec![
                OutputEvent::Started { index: 0, at: Duration::ZERO },
                OutputEvent::Stopped { index: 0, at },
                OutputEvent::Started { index: 0, at },
                OutputEvent::Stopped { index: 0, at },
                OutputEvent::Started { index: 0, at },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_updates_track_segments() {
        let (player, mut events, _output) = player(&[500, 500]);
        let ticker = player.spawn_time_updates(Duration::from_millis(250));
        player.play().unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        ticker.abort();

        let mut segments = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PlayerEvent::SegmentChanged(segment) = event {
                segments.push(segment);
            }
        }
        assert_eq!(segments, vec![Some(0), Some(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_rewinds() {
        let (player, _events, output) = player(&[500]);
        player.play().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        player.stop();
        assert_eq!(player.state(), PlayerState::Idle);
        assert_eq!(player.position(), 0.0);
        assert_eq!(output.live(), 0);
    }
}
