//! Process-wide playback arbitration
//!
//! Chat, audiobook, podcast and voice conversation all produce sound through
//! the same speakers. The driver decides which of them may do so: it carries
//! the active [`PlaybackMode`], at most one live [`OutputClaim`], and any
//! resources registered for teardown. Switching modes or taking a new claim
//! tears down the previous owner synchronously, before the call returns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info};

use super::output::AudioOutput;
use crate::error::{Error, Result};

/// Which playback path currently owns the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Generated WAV chunks (chat, audiobook, podcast)
    #[default]
    Wav,
    /// Realtime voice conversation
    Websocket,
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackMode::Wav => f.write_str("wav"),
            PlaybackMode::Websocket => f.write_str("websocket"),
        }
    }
}

/// Something that can be silenced and released on demand
///
/// Called from whatever thread forces the teardown; implementations must not
/// block on the caller's runtime.
pub trait Teardown: Send + Sync {
    fn teardown(&self);
}

impl<F> Teardown for F
where
    F: Fn() + Send + Sync,
{
    fn teardown(&self) {
        self()
    }
}

struct ActiveClaim {
    id: u64,
    owner: String,
    teardown: Arc<dyn Teardown>,
}

struct Registered {
    id: u64,
    name: String,
    teardown: Arc<dyn Teardown>,
}

#[derive(Default)]
struct DriverState {
    mode: PlaybackMode,
    claim: Option<ActiveClaim>,
    resources: Vec<Registered>,
    next_id: u64,
}

impl DriverState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared playback arbiter, passed by `Arc` to every feature
pub struct PlaybackDriver {
    state: Mutex<DriverState>,
}

impl PlaybackDriver {
    pub fn new(mode: PlaybackMode) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DriverState {
                mode,
                ..DriverState::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> PlaybackMode {
        self.lock().mode
    }

    /// Owner of the live claim, if any
    pub fn holder(&self) -> Option<String> {
        self.lock().claim.as_ref().map(|c| c.owner.clone())
    }

    pub fn is_claimed(&self) -> bool {
        self.lock().claim.is_some()
    }

    /// Number of registered resources
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Change the active mode
    ///
    /// The live claim and every registered resource are torn down before
    /// this returns, whether or not the mode actually changes.
    pub fn switch_mode(&self, mode: PlaybackMode) {
        let (previous, claim, resources) = {
            let mut state = self.lock();
            let previous = state.mode;
            state.mode = mode;
            (
                previous,
                state.claim.take(),
                std::mem::take(&mut state.resources),
            )
        };

        if previous != mode {
            info!(from = %previous, to = %mode, "Switching playback mode");
        }
        // Teardown runs outside the lock: owners may call back into the driver.
        if let Some(claim) = claim {
            debug!(owner = %claim.owner, "Tearing down output claim");
            claim.teardown.teardown();
        }
        for resource in resources {
            debug!(resource = %resource.name, "Tearing down resource");
            resource.teardown.teardown();
        }
    }

    /// Take exclusive ownership of the output for `mode`
    ///
    /// Fails with [`Error::ModeInactive`] when `mode` is not the active mode.
    /// A previous claim is torn down first; `teardown` is how this claim will
    /// be silenced in turn.
    pub fn claim(
        self: &Arc<Self>,
        mode: PlaybackMode,
        owner: impl Into<String>,
        teardown: Arc<dyn Teardown>,
    ) -> Result<OutputClaim> {
        let owner = owner.into();
        let (id, previous) = {
            let mut state = self.lock();
            if state.mode != mode {
                return Err(Error::ModeInactive {
                    requested: mode,
                    active: state.mode,
                });
            }
            let id = state.next_id();
            let previous = state.claim.replace(ActiveClaim {
                id,
                owner: owner.clone(),
                teardown,
            });
            (id, previous)
        };

        if let Some(previous) = previous {
            info!(previous = %previous.owner, owner = %owner, "Preempting output owner");
            previous.teardown.teardown();
        } else {
            debug!(owner = %owner, %mode, "Output claimed");
        }

        Ok(OutputClaim {
            id,
            mode,
            owner,
            driver: Arc::downgrade(self),
        })
    }

    /// Register a resource to be torn down on the next mode switch
    pub fn register(
        self: &Arc<Self>,
        name: impl Into<String>,
        teardown: Arc<dyn Teardown>,
    ) -> ResourceGuard {
        let mut state = self.lock();
        let id = state.next_id();
        state.resources.push(Registered {
            id,
            name: name.into(),
            teardown,
        });
        ResourceGuard {
            id,
            driver: Arc::downgrade(self),
        }
    }

    /// Register an open output; the next mode switch closes it
    pub fn register_output(self: &Arc<Self>, output: &Arc<dyn AudioOutput>) -> ResourceGuard {
        let name = format!("{} output", output.name());
        let output = Arc::clone(output);
        self.register(name, Arc::new(move || output.close()))
    }

    fn is_current(&self, id: u64) -> bool {
        self.lock().claim.as_ref().is_some_and(|c| c.id == id)
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        if state.claim.as_ref().is_some_and(|c| c.id == id) {
            if let Some(claim) = state.claim.take() {
                debug!(owner = %claim.owner, "Output released");
            }
        }
    }

    fn unregister(&self, id: u64) {
        self.lock().resources.retain(|r| r.id != id);
    }
}

impl Default for PlaybackDriver {
    fn default() -> Self {
        Self {
            state: Mutex::new(DriverState::default()),
        }
    }
}

impl fmt::Debug for PlaybackDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("PlaybackDriver")
            .field("mode", &state.mode)
            .field("holder", &state.claim.as_ref().map(|c| c.owner.as_str()))
            .field("resources", &state.resources.len())
            .finish()
    }
}

/// Exclusive right to produce sound, released on drop
#[derive(Debug)]
pub struct OutputClaim {
    id: u64,
    mode: PlaybackMode,
    owner: String,
    driver: Weak<PlaybackDriver>,
}

impl OutputClaim {
    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether this claim still owns the output
    pub fn is_active(&self) -> bool {
        self.driver
            .upgrade()
            .is_some_and(|driver| driver.is_current(self.id))
    }

    /// Check the claim before creating a new playback resource
    ///
    /// A preempted owner that still tries to start audio would overlap with
    /// the current one.
    pub fn admit(&self) -> Result<()> {
        let Some(driver) = self.driver.upgrade() else {
            return Err(Error::PlaybackError("playback driver is gone".to_string()));
        };
        if driver.is_current(self.id) {
            return Ok(());
        }
        let holder = driver.holder();
        if let Some(holder) = &holder {
            error!(owner = %self.owner, %holder, "Overlapping output: preempted owner tried to start audio");
            debug_assert!(false, "{} started audio while {} owns the output", self.owner, holder);
        }
        Err(Error::ModeInactive {
            requested: self.mode,
            active: driver.mode(),
        })
    }
}

impl Drop for OutputClaim {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.upgrade() {
            driver.release(self.id);
        }
    }
}

/// Registration handle from [`PlaybackDriver::register`]; unregisters on drop
#[derive(Debug)]
pub struct ResourceGuard {
    id: u64,
    driver: Weak<PlaybackDriver>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.upgrade() {
            driver.unregister(self.id);
        }
    }
}
