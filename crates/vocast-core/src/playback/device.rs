//! Speaker output through rodio
//!
//! `rodio::OutputStream` is `!Send` on some platforms, so it lives on a
//! dedicated thread for the lifetime of the output; only the `Send` stream
//! handle crosses threads. Started clips get a sink each. Scheduled clips
//! share one sink and are padded with silence up to their start time.

use rodio::buffer::SamplesBuffer;
use rodio::source::{EmptyCallback, Zero};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::output::{AudioOutput, Clip, Voice, VoiceControl, VoiceEnd};
use crate::audio::{decode_wav, pcm16_to_f32};
use crate::error::{Error, Result};

/// One-shot completion slot shared by a voice and whoever ends it
struct Completion {
    done: Mutex<Option<oneshot::Sender<VoiceEnd>>>,
}

impl Completion {
    fn new(tx: oneshot::Sender<VoiceEnd>) -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(Some(tx)),
        })
    }

    fn is_pending(&self) -> bool {
        self.done.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn finish(&self, end: VoiceEnd) {
        let sender = self.done.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(end);
        }
    }
}

struct SinkVoice {
    sink: Arc<Sink>,
    stopped: Arc<AtomicBool>,
    completion: Arc<Completion>,
}

impl VoiceControl for SinkVoice {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.sink.stop();
            self.completion.finish(VoiceEnd::Stopped);
        }
    }

    fn position(&self) -> Duration {
        self.sink.get_pos()
    }
}

/// Shared sink used by scheduled clips
struct Timeline {
    sink: Arc<Sink>,
    /// Output-clock time at which the queued audio runs out
    queued_until: Duration,
    pending: Vec<Arc<Completion>>,
}

struct TimelineVoice {
    output: Arc<DeviceShared>,
    sink: Arc<Sink>,
    _completion: Arc<Completion>,
    start: Duration,
    duration: Duration,
}

impl VoiceControl for TimelineVoice {
    fn stop(&self) {
        // Queued sources cannot be removed one by one: the whole timeline goes.
        self.output.reset_timeline(&self.sink);
    }

    fn position(&self) -> Duration {
        self.output
            .now()
            .saturating_sub(self.start)
            .min(self.duration)
    }
}

struct DeviceShared {
    handle: OutputStreamHandle,
    origin: Instant,
    timeline: Mutex<Option<Timeline>>,
    voices: Mutex<Vec<Weak<SinkVoice>>>,
}

impl DeviceShared {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn reset_timeline(&self, sink: &Arc<Sink>) {
        let timeline = {
            let mut slot = self.timeline.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(t) if Arc::ptr_eq(&t.sink, sink) => slot.take(),
                _ => None,
            }
        };
        if let Some(timeline) = timeline {
            timeline.sink.stop();
            for completion in &timeline.pending {
                completion.finish(VoiceEnd::Stopped);
            }
            debug!("Timeline sink reset");
        }
    }
}

/// Default output device
pub struct DeviceOutput {
    shared: Arc<DeviceShared>,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeviceOutput {
    /// Open the default output device on a dedicated thread
    pub fn open() -> Result<Self> {
        let (init_tx, init_rx) = std_mpsc::channel::<Result<OutputStreamHandle>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("vocast-audio".into())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = init_tx.send(Err(Error::OutputDevice(e.to_string())));
                        return;
                    }
                };
                if init_tx.send(Ok(handle)).is_err() {
                    return;
                }
                // Keep the stream alive until shutdown or until the output is dropped
                let _ = shutdown_rx.recv();
                debug!("Audio thread exiting");
            })
            .map_err(|e| Error::OutputDevice(format!("failed to spawn audio thread: {e}")))?;

        let handle = init_rx
            .recv()
            .map_err(|_| Error::OutputDevice("audio thread died during startup".to_string()))??;
        info!("Audio output initialized on default device");

        Ok(Self {
            shared: Arc::new(DeviceShared {
                handle,
                origin: Instant::now(),
                timeline: Mutex::new(None),
                voices: Mutex::new(Vec::new()),
            }),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn samples(clip: &Clip) -> Result<(Vec<f32>, u32)> {
        let pcm = decode_wav(&clip.wav)?;
        Ok((pcm16_to_f32(&pcm.bytes), pcm.sample_rate))
    }

    fn new_sink(&self) -> Result<Sink> {
        Sink::try_new(&self.shared.handle).map_err(|e| Error::OutputDevice(e.to_string()))
    }
}

impl AudioOutput for DeviceOutput {
    fn name(&self) -> &'static str {
        "device"
    }

    fn start(&self, clip: Clip) -> Result<Voice> {
        let (samples, rate) = Self::samples(&clip)?;
        let duration = clip.duration();
        let sink = Arc::new(self.new_sink()?);
        sink.append(SamplesBuffer::new(1, rate, samples));

        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(tx);
        let stopped = Arc::new(AtomicBool::new(false));
        let voice = Arc::new(SinkVoice {
            sink: Arc::clone(&sink),
            stopped: Arc::clone(&stopped),
            completion: Arc::clone(&completion),
        });

        // sleep_until_end returns early once the sink is stopped
        thread::spawn(move || {
            sink.sleep_until_end();
            if !stopped.load(Ordering::SeqCst) {
                completion.finish(VoiceEnd::Completed);
            }
        });

        let mut voices = self.shared.voices.lock().unwrap_or_else(|e| e.into_inner());
        voices.retain(|v| v.strong_count() > 0);
        voices.push(Arc::downgrade(&voice));
        drop(voices);

        debug!(index = clip.index, ?duration, "Playing clip");
        Ok(Voice::new(clip.index, duration, voice, rx))
    }

    fn now(&self) -> Duration {
        self.shared.now()
    }

    fn schedule(&self, clip: Clip, at: Duration) -> Result<Voice> {
        let (samples, rate) = Self::samples(&clip)?;
        let duration = clip.duration();
        let now = self.shared.now();

        let mut slot = self.shared.timeline.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map_or(true, |t| t.sink.empty()) {
            *slot = Some(Timeline {
                sink: Arc::new(self.new_sink()?),
                queued_until: now,
                pending: Vec::new(),
            });
        }
        let Some(timeline) = slot.as_mut() else {
            return Err(Error::OutputDevice("timeline sink unavailable".to_string()));
        };

        let base = timeline.queued_until.max(now);
        let start = at.max(base);
        let gap = start - base;
        if !gap.is_zero() {
            timeline
                .sink
                .append(Zero::<f32>::new(1, rate).take_duration(gap));
        }
        timeline.sink.append(SamplesBuffer::new(1, rate, samples));

        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(tx);
        let signal = Arc::clone(&completion);
        timeline
            .sink
            .append(EmptyCallback::<f32>::new(Box::new(move || {
                signal.finish(VoiceEnd::Completed)
            })));
        timeline.queued_until = start + duration;
        timeline.pending.retain(|c| c.is_pending());
        timeline.pending.push(Arc::clone(&completion));

        let voice = Arc::new(TimelineVoice {
            output: Arc::clone(&self.shared),
            sink: Arc::clone(&timeline.sink),
            _completion: completion,
            start,
            duration,
        });
        drop(slot);

        debug!(index = clip.index, start_ms = start.as_millis() as u64, "Queued clip on timeline");
        Ok(Voice::new(clip.index, duration, voice, rx))
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
        let sink = self
            .shared
            .timeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| Arc::clone(&t.sink));
        if let Some(sink) = sink {
            self.shared.reset_timeline(&sink);
        }
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.close();
        if let Some(tx) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
        if let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            if thread.join().is_err() {
                warn!("Audio thread panicked");
            }
        }
    }
}
