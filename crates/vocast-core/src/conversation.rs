//! Turn-taking state for realtime voice conversation
//!
//! The conversation itself (microphone, signalling, remote audio) lives
//! elsewhere; this type only tracks whose turn it is and holds the driver in
//! [`PlaybackMode::Websocket`] while the assistant speaks, so no generated
//! WAV audio can play over it.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::playback::{OutputClaim, PlaybackDriver, PlaybackMode, Teardown};

/// Whose turn it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    /// Voice mode is off
    #[default]
    Idle,
    /// Capturing the user's speech
    Listening,
    /// Waiting for the reply
    Processing,
    /// The reply is playing
    Speaking,
}

/// Voice conversation turn tracker
pub struct Conversation {
    driver: Arc<PlaybackDriver>,
    state: ConversationState,
    claim: Option<OutputClaim>,
    speaker: Option<Arc<dyn Teardown>>,
    events: mpsc::UnboundedSender<ConversationState>,
}

impl Conversation {
    /// Returns the conversation and a receiver of its state changes
    pub fn new(
        driver: Arc<PlaybackDriver>,
    ) -> (Self, mpsc::UnboundedReceiver<ConversationState>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                driver,
                state: ConversationState::Idle,
                claim: None,
                speaker: None,
                events,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// Enter voice mode; any WAV playback is torn down first
    pub fn start(&mut self) -> Result<()> {
        self.require(&[ConversationState::Idle], "start")?;
        self.driver.switch_mode(PlaybackMode::Websocket);
        info!("Voice conversation started");
        self.set_state(ConversationState::Listening);
        Ok(())
    }

    /// The user stopped talking
    pub fn submit(&mut self) -> Result<()> {
        self.require(&[ConversationState::Listening], "submit")?;
        self.set_state(ConversationState::Processing);
        Ok(())
    }

    /// The reply starts playing through `speaker`
    ///
    /// `speaker` is torn down if the output is taken away, e.g. when the
    /// conversation ends or the mode switches back.
    pub fn speak(&mut self, speaker: Arc<dyn Teardown>) -> Result<()> {
        self.require(&[ConversationState::Processing], "speak")?;
        let claim = self.driver.claim(
            PlaybackMode::Websocket,
            "voice conversation",
            Arc::clone(&speaker),
        )?;
        self.claim = Some(claim);
        self.speaker = Some(speaker);
        self.set_state(ConversationState::Speaking);
        Ok(())
    }

    /// The reply finished; back to listening
    pub fn finish_speaking(&mut self) -> Result<()> {
        self.require(&[ConversationState::Speaking], "finish_speaking")?;
        self.claim = None;
        self.speaker = None;
        self.set_state(ConversationState::Listening);
        Ok(())
    }

    /// The user talked over the reply
    pub fn interrupt(&mut self) -> Result<()> {
        self.require(&[ConversationState::Speaking], "interrupt")?;
        let still_owned = self.claim.take().is_some_and(|claim| claim.is_active());
        if let Some(speaker) = self.speaker.take() {
            if still_owned {
                speaker.teardown();
            }
        }
        debug!("Reply interrupted");
        self.set_state(ConversationState::Listening);
        Ok(())
    }

    /// Leave voice mode and hand the output back to WAV playback
    pub fn end(&mut self) {
        if self.state == ConversationState::Idle {
            return;
        }
        // The claim is still held here, so the switch tears the speaker down
        self.driver.switch_mode(PlaybackMode::Wav);
        self.claim = None;
        self.speaker = None;
        info!("Voice conversation ended");
        self.set_state(ConversationState::Idle);
    }

    /// Whether the reply still owns the output
    pub fn is_speaking(&self) -> bool {
        self.state == ConversationState::Speaking
            && self.claim.as_ref().is_some_and(|c| c.is_active())
    }

    fn require(&self, allowed: &[ConversationState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidTransition(format!(
                "cannot {action} while {:?}",
                self.state
            )))
        }
    }

    fn set_state(&mut self, state: ConversationState) {
        if self.state != state {
            debug!(old = ?self.state, new = ?state, "Conversation state transition");
            self.state = state;
            if self.events.send(state).is_err() {
                warn!("Conversation state receiver dropped");
            }
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.end();
    }
}
