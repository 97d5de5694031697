//! Audio session interruptions and route changes.
//!
//! A live stream cannot be paused in place: audio buffered before an
//! interruption is stale by the time it ends. So every interruption stops
//! the pipeline outright and every resume starts a fresh one at the live
//! edge.

use log::{debug, info, warn};
use serde_derive::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionSignal {
    BeginInterruption,
    EndInterruption { can_resume: bool },
    /// The device we were playing to went away, e.g. headphones unplugged.
    RouteOldDeviceUnavailable,
    RouteNewDeviceAvailable,
    /// Another app started playing.
    SecondaryAudioBegin,
    SecondaryAudioEnd,
    /// The platform audio service restarted underneath us.
    MediaServicesLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Interrupted,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Stop the whole pipeline, network fetch included.
    Stop,
    /// Start a fresh pipeline.
    Resume,
    None,
}

pub struct SessionController {
    state: SessionState,
}

impl Default for SessionController {
    fn default() -> Self {
        SessionController::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        SessionController { state: SessionState::Idle }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The user started playback.
    pub fn activate(&mut self) {
        self.state = SessionState::Active;
    }

    /// The user stopped playback; later signals have nothing to resume.
    pub fn deactivate(&mut self) {
        self.state = SessionState::Idle;
    }

    pub fn handle(&mut self, signal: SessionSignal) -> SessionAction {
        let (next, action) = match (self.state, signal) {
            (SessionState::Idle, _) => (SessionState::Idle, SessionAction::None),

            (SessionState::Active, SessionSignal::BeginInterruption)
            | (SessionState::Active, SessionSignal::RouteOldDeviceUnavailable)
            | (SessionState::Active, SessionSignal::SecondaryAudioBegin)
            | (SessionState::Active, SessionSignal::MediaServicesLost) => {
                (SessionState::Interrupted, SessionAction::Stop)
            }
            // output moved to a new device: restart on it
            (SessionState::Active, SessionSignal::RouteNewDeviceAvailable) => {
                (SessionState::Active, SessionAction::Resume)
            }
            (SessionState::Active, _) => (SessionState::Active, SessionAction::None),

            (SessionState::Interrupted, SessionSignal::EndInterruption { can_resume: true })
            | (SessionState::Interrupted, SessionSignal::SecondaryAudioEnd)
            | (SessionState::Interrupted, SessionSignal::RouteNewDeviceAvailable) => {
                (SessionState::Active, SessionAction::Resume)
            }
            (SessionState::Interrupted, SessionSignal::EndInterruption { can_resume: false }) => {
                (SessionState::Idle, SessionAction::None)
            }
            (SessionState::Interrupted, _) => (SessionState::Interrupted, SessionAction::None),
        };

        if next != self.state {
            info!("audio session {:?} -> {:?} on {:?}", self.state, next, signal);
        } else {
            debug!("audio session stays {:?} on {:?}", self.state, signal);
        }
        self.state = next;
        action
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuring audio session: {0}")]
    Configure(String),
    #[error("activating audio session: {0}")]
    Activate(String),
}

/// Platform audio session. Failures are logged and playback goes ahead
/// without it.
pub trait AudioSession: Send + Sync {
    fn configure(&self) -> Result<(), SessionError>;

    fn activate(&self) -> Result<(), SessionError>;
}

/// For platforms without a session API.
pub struct DefaultSession;

impl AudioSession for DefaultSession {
    fn configure(&self) -> Result<(), SessionError> {
        Ok(())
    }

    fn activate(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Runs `configure` (when asked to) and `activate`, logging failures.
pub fn prepare(session: &dyn AudioSession, configure: bool) {
    if configure {
        if let Err(e) = session.configure() {
            warn!("{}, continuing without it", e);
        }
    }
    if let Err(e) = session.activate() {
        warn!("{}, continuing without it", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> SessionController {
        let mut controller = SessionController::new();
        controller.activate();
        controller
    }

    #[test]
    fn idle_ignores_everything() {
        let mut controller = SessionController::new();

        for signal in [
            SessionSignal::BeginInterruption,
            SessionSignal::EndInterruption { can_resume: true },
            SessionSignal::RouteNewDeviceAvailable,
            SessionSignal::SecondaryAudioEnd,
        ] {
            assert_eq!(controller.handle(signal), SessionAction::None);
        }
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[test]
    fn interruption_stops_and_resumable_end_restarts() {
        let mut controller = active();

        assert_eq!(controller.handle(SessionSignal::BeginInterruption), SessionAction::Stop);
        assert_eq!(controller.state(), SessionState::Interrupted);

        let end = SessionSignal::EndInterruption { can_resume: true };
        assert_eq!(controller.handle(end), SessionAction::Resume);
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[test]
    fn unresumable_end_goes_idle() {
        let mut controller = active();
        controller.handle(SessionSignal::BeginInterruption);

        let end = SessionSignal::EndInterruption { can_resume: false };
        assert_eq!(controller.handle(end), SessionAction::None);
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(controller.handle(SessionSignal::RouteNewDeviceAvailable), SessionAction::None);
    }

    #[test]
    fn route_and_secondary_audio_act_as_interruptions() {
        let mut controller = active();
        assert_eq!(controller.handle(SessionSignal::RouteOldDeviceUnavailable), SessionAction::Stop);
        assert_eq!(controller.handle(SessionSignal::RouteNewDeviceAvailable), SessionAction::Resume);

        assert_eq!(controller.handle(SessionSignal::SecondaryAudioBegin), SessionAction::Stop);
        assert_eq!(controller.handle(SessionSignal::SecondaryAudioEnd), SessionAction::Resume);

        assert_eq!(controller.handle(SessionSignal::MediaServicesLost), SessionAction::Stop);
        assert_eq!(controller.state(), SessionState::Interrupted);
    }

    #[test]
    fn repeated_begin_stops_once() {
        let mut controller = active();

        assert_eq!(controller.handle(SessionSignal::BeginInterruption), SessionAction::Stop);
        assert_eq!(controller.handle(SessionSignal::BeginInterruption), SessionAction::None);
    }

    #[test]
    fn new_device_while_active_restarts_on_it() {
        let mut controller = active();

        assert_eq!(controller.handle(SessionSignal::RouteNewDeviceAvailable), SessionAction::Resume);
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[test]
    fn user_stop_drops_pending_resume() {
        let mut controller = active();
        controller.handle(SessionSignal::BeginInterruption);

        controller.deactivate();

        assert_eq!(controller.handle(SessionSignal::EndInterruption { can_resume: true }), SessionAction::None);
    }
}
