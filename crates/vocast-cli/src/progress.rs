//! Terminal rendering of session and player events

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{self, IsTerminal};
use std::time::Duration;
use vocast_core::{PlayerEvent, SessionEvent};

const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {msg}";
const PHASE_TEMPLATE: &str = "{spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {msg}";
const TRACK_TEMPLATE: &str = "[{bar:40.cyan/blue}] {msg}";

/// Characters of the chat reply shown next to the spinner
const REPLY_TAIL: usize = 60;

/// Generation progress: chunk count, podcast phases, chat reply text and
/// now-speaking lines
pub struct GenerationProgress {
    bar: ProgressBar,
    phased: bool,
    reply: String,
}

impl GenerationProgress {
    /// Draws to stderr when it is a terminal, otherwise stays hidden
    pub fn new() -> Self {
        let bar = if io::stderr().is_terminal() {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
        };
        if let Ok(style) = ProgressStyle::with_template(SPINNER_TEMPLATE) {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message("waiting for audio");
        Self {
            bar,
            phased: false,
            reply: String::new(),
        }
    }

    pub fn handle(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Content(text) => {
                self.reply.push_str(text);
                self.bar.set_message(reply_tail(&self.reply));
            }
            SessionEvent::ChunkReady { received, .. } => {
                if !self.phased && self.reply.is_empty() {
                    self.bar.set_message(format!("{received} chunks received"));
                }
            }
            SessionEvent::Phase { percent, message } => {
                if !self.phased {
                    self.phased = true;
                    self.bar.set_length(100);
                    if let Ok(style) = ProgressStyle::with_template(PHASE_TEMPLATE) {
                        self.bar.set_style(style.progress_chars("=> "));
                    }
                }
                self.bar.set_position(percent.clamp(0.0, 100.0) as u64);
                self.bar.set_message(message.clone());
            }
            SessionEvent::SegmentStarted { speaker, text, .. } => {
                let line = if speaker.is_empty() {
                    text.clone()
                } else {
                    format!("{speaker}: {text}")
                };
                self.println(line);
            }
            SessionEvent::Transcript(lines) => {
                self.println(format!("transcript: {} lines", lines.len()));
            }
            SessionEvent::ChunkSkipped { index, reason } => {
                self.println(format!("skipped chunk {index}: {reason}"));
            }
            SessionEvent::GenerationComplete { chunks, duration } => {
                let length = duration.map(|d| format!(", {d:.1}s")).unwrap_or_default();
                self.bar.set_message(format!("generated {chunks} chunks{length}"));
            }
            SessionEvent::GenerationFailed(message) => {
                self.println(format!("generation failed: {message}"));
            }
            _ => {}
        }
    }

    /// Clear the spinner, leaving the full chat reply on screen
    pub fn finish(&self) {
        if !self.reply.is_empty() {
            self.println(self.reply.trim().to_string());
        }
        self.bar.finish_and_clear();
    }

    fn println(&self, line: String) {
        if self.bar.is_hidden() {
            println!("{line}");
        } else {
            self.bar.println(line);
        }
    }
}

impl Default for GenerationProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Position bar for `vocast play`
pub struct TrackProgress {
    bar: ProgressBar,
    duration: f64,
}

impl TrackProgress {
    pub fn new(duration: f64) -> Self {
        let bar = if io::stderr().is_terminal() {
            ProgressBar::new(1000)
        } else {
            ProgressBar::with_draw_target(Some(1000), ProgressDrawTarget::hidden())
        };
        if let Ok(style) = ProgressStyle::with_template(TRACK_TEMPLATE) {
            bar.set_style(style.progress_chars("=> "));
        }
        Self { bar, duration }
    }

    pub fn handle(&self, event: &PlayerEvent) {
        if let PlayerEvent::TimeUpdate { position, segment } = event {
            let fraction = if self.duration > 0.0 {
                (position / self.duration).clamp(0.0, 1.0)
            } else {
                0.0
            };
            self.bar.set_position((fraction * 1000.0) as u64);
            let segment = segment.map(|s| format!(" (segment {s})")).unwrap_or_default();
            self.bar.set_message(format!(
                "{} / {}{segment}",
                format_time(*position),
                format_time(self.duration)
            ));
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn reply_tail(reply: &str) -> String {
    let line = reply.trim().replace('\n', " ");
    let count = line.chars().count();
    if count <= REPLY_TAIL {
        return line;
    }
    let tail: String = line.chars().skip(count - REPLY_TAIL).collect();
    format!("...{tail}")
}

/// `m:ss`
pub fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}
