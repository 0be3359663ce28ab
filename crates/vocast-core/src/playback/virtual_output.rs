//! Clock-driven output without a sound device
//!
//! Each voice "plays" for exactly its clip duration on the tokio clock. Used
//! for headless runs and tests; under a paused test clock the timing is exact.
//! Every transition is recorded so callers can check ordering and overlap.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::output::{AudioOutput, Clip, Voice, VoiceControl, VoiceEnd};
use crate::error::{Error, Result};

/// A recorded output transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Started { index: usize, at: Duration },
    Ended { index: usize, at: Duration },
    Stopped { index: usize, at: Duration },
    Rejected { index: usize },
}

impl OutputEvent {
    pub fn index(&self) -> usize {
        match self {
            OutputEvent::Started { index, .. }
            | OutputEvent::Ended { index, .. }
            | OutputEvent::Stopped { index, .. }
            | OutputEvent::Rejected { index } => *index,
        }
    }
}

struct Shared {
    origin: Instant,
    log: Mutex<Vec<OutputEvent>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    reject: Mutex<HashSet<usize>>,
    voices: Mutex<Vec<Weak<VirtualVoice>>>,
}

impl Shared {
    fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.origin)
    }

    fn record(&self, event: OutputEvent) {
        debug!(?event, "virtual output");
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[derive(Default)]
struct VoiceState {
    started_at: Option<Instant>,
    finished: bool,
    done: Option<oneshot::Sender<VoiceEnd>>,
    timer: Option<JoinHandle<()>>,
}

struct VirtualVoice {
    index: usize,
    duration: Duration,
    shared: Arc<Shared>,
    state: Mutex<VoiceState>,
}

impl VirtualVoice {
    fn lock(&self) -> std::sync::MutexGuard<'_, VoiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self) {
        let mut state = self.lock();
        if state.finished || state.started_at.is_some() {
            return;
        }
        state.started_at = Some(Instant::now());
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);
        self.shared.record(OutputEvent::Started {
            index: self.index,
            at: self.shared.elapsed(),
        });
    }

    fn end(&self, how: VoiceEnd) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        if state.started_at.is_some() {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
        let at = self.shared.elapsed();
        let event = match how {
            VoiceEnd::Completed => OutputEvent::Ended {
                index: self.index,
                at,
            },
            _ => OutputEvent::Stopped {
                index: self.index,
                at,
            },
        };
        self.shared.record(event);
        if let Some(timer) = state.timer.take() {
            if !matches!(how, VoiceEnd::Completed) {
                timer.abort();
            }
        }
        if let Some(done) = state.done.take() {
            let _ = done.send(how);
        }
    }
}

impl VoiceControl for VirtualVoice {
    fn stop(&self) {
        self.end(VoiceEnd::Stopped);
    }

    fn position(&self) -> Duration {
        self.lock()
            .started_at
            .map(|t| Instant::now().saturating_duration_since(t).min(self.duration))
            .unwrap_or_default()
    }
}

/// Headless output on the tokio clock
#[derive(Clone)]
pub struct VirtualOutput {
    shared: Arc<Shared>,
}

impl VirtualOutput {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                origin: Instant::now(),
                log: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
                reject: Mutex::new(HashSet::new()),
                voices: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the output refuse the clip with this index
    pub fn reject_index(&self, index: usize) {
        self.shared
            .reject
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(index);
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<OutputEvent> {
        self.shared
            .log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Indices in the order they started
    pub fn started(&self) -> Vec<usize> {
        self.events()
            .iter()
            .filter(|e| matches!(e, OutputEvent::Started { .. }))
            .map(OutputEvent::index)
            .collect()
    }

    /// Indices in the order they played to the end
    pub fn completed(&self) -> Vec<usize> {
        self.events()
            .iter()
            .filter(|e| matches!(e, OutputEvent::Ended { .. }))
            .map(OutputEvent::index)
            .collect()
    }

    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Highest number of voices that were sounding at the same time
    pub fn max_live(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    fn spawn_voice(&self, clip: Clip, at: Option<Instant>) -> Result<Voice> {
        let rejected = self
            .shared
            .reject
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&clip.index);
        if rejected {
            self.shared.record(OutputEvent::Rejected { index: clip.index });
            return Err(Error::PlaybackError(format!(
                "virtual output rejected clip {}",
                clip.index
            )));
        }

        let duration = clip.duration();
        let (tx, rx) = oneshot::channel();
        let voice = Arc::new(VirtualVoice {
            index: clip.index,
            duration,
            shared: Arc::clone(&self.shared),
            state: Mutex::new(VoiceState {
                done: Some(tx),
                ..VoiceState::default()
            }),
        });

        if at.is_none() {
            voice.begin();
        }

        let timer = {
            let voice = Arc::clone(&voice);
            tokio::spawn(async move {
                if let Some(at) = at {
                    tokio::time::sleep_until(at).await;
                    voice.begin();
                }
                tokio::time::sleep(duration).await;
                voice.end(VoiceEnd::Completed);
            })
        };
        voice.lock().timer = Some(timer);

        let mut voices = self.shared.voices.lock().unwrap_or_else(|e| e.into_inner());
        voices.retain(|v| v.strong_count() > 0);
        voices.push(Arc::downgrade(&voice));
        drop(voices);

        Ok(Voice::new(clip.index, duration, voice, rx))
    }
}

impl Default for VirtualOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for VirtualOutput {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn start(&self, clip: Clip) -> Result<Voice> {
        self.spawn_voice(clip, None)
    }

    fn now(&self) -> Duration {
        self.shared.elapsed()
    }

    fn schedule(&self, clip: Clip, at: Duration) -> Result<Voice> {
        self.spawn_voice(clip, Some(self.shared.origin + at))
    }

    fn close(&self) {
        let voices: Vec<_> = self
            .shared
            .voices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .filter_map(|v| v.upgrade())
            .collect();
        for voice in voices {
            voice.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(index: usize, millis: u64) -> Clip {
        let samples = vec![0.0f32; (24 * millis) as usize];
        Clip::from_samples(index, &samples, 24000).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_completes_after_duration() {
        let output = VirtualOutput::new();
        let mut voice = output.start(clip(0, 250)).unwrap();
        assert_eq!(output.live(), 1);

        assert_eq!(voice.finished().await, VoiceEnd::Completed);
        assert_eq!(output.live(), 0);
        assert_eq!(
            output.events(),
            vec![
                OutputEvent::Started {
                    index: 0,
                    at: Duration::ZERO
                },
                OutputEvent::Ended {
                    index: 0,
                    at: Duration::from_millis(250)
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts() {
        let output = VirtualOutput::new();
        let mut voice = output.start(clip(4, 1000)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(voice.position(), Duration::from_millis(300));

        voice.stop();
        assert_eq!(voice.finished().await, VoiceEnd::Stopped);
        assert_eq!(output.live(), 0);
        assert!(output.completed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_voice_waits_for_its_slot() {
        let output = VirtualOutput::new();
        let mut first = output.schedule(clip(0, 100), Duration::ZERO).unwrap();
        let mut second = output
            .schedule(clip(1, 100), Duration::from_millis(100))
            .unwrap();

        first.finished().await;
        second.finished().await;
        assert_eq!(output.now(), Duration::from_millis(200));
        assert_eq!(output.completed(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_index() {
        let output = VirtualOutput::new();
        output.reject_index(2);
        assert!(output.start(clip(2, 10)).is_err());
        assert_eq!(output.events(), vec![OutputEvent::Rejected { index: 2 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_everything() {
        let output = VirtualOutput::new();
        let mut a = output.start(clip(0, 500)).unwrap();
        output.close();
        assert_eq!(a.finished().await, VoiceEnd::Stopped);
        assert_eq!(output.live(), 0);
    }
}
