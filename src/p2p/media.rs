// Media layer seam for calls
// The signaling state machine only needs offers, answers and ICE plumbing;
// capture, codecs and the actual peer connection live behind this trait.

use log::debug;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::models::{CallType, IceCandidate, SessionDescription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Media error: {0}")]
pub struct MediaError(pub String);

pub trait MediaEngine: Send {
    /// Acquire local capture for the call type.
    fn start(&mut self, call_type: CallType) -> Result<(), MediaError>;
    fn create_offer(&mut self) -> Result<SessionDescription, MediaError>;
    fn accept_offer(&mut self, offer: &SessionDescription) -> Result<SessionDescription, MediaError>;
    fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), MediaError>;
    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError>;
    /// Release capture and tear down the media session. Idempotent.
    fn stop(&mut self);
}

#[derive(Debug, Default)]
struct LoopbackState {
    active: Option<CallType>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    stops: usize,
    fail_start: bool,
}

/// Media engine that negotiates simulated SDP and records what it was given.
///
/// Clones share state, so a clone kept outside the session can observe the
/// engine the session owns.
#[derive(Debug, Clone, Default)]
pub struct LoopbackMedia {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose capture always fails.
    pub fn failing() -> Self {
        let media = Self::default();
        if let Ok(mut state) = media.state.lock() {
            state.fail_start = true;
        }
        media
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LoopbackState) -> R) -> Result<R, MediaError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| MediaError("loopback state poisoned".to_string()))?;
        Ok(f(&mut state))
    }

    pub fn is_active(&self) -> bool {
        self.with_state(|s| s.active.is_some()).unwrap_or(false)
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.with_state(|s| s.candidates.clone()).unwrap_or_default()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.with_state(|s| s.remote_description.clone()).ok().flatten()
    }

    pub fn stop_count(&self) -> usize {
        self.with_state(|s| s.stops).unwrap_or(0)
    }

    fn description(kind: &str, call_type: Option<CallType>) -> SessionDescription {
        let media = match call_type {
            Some(CallType::Video) => "audio video",
            _ => "audio",
        };
        SessionDescription {
            sdp: format!("simulated-sdp-{} {}", kind, media),
            sdp_type: kind.to_string(),
        }
    }
}

impl MediaEngine for LoopbackMedia {
    fn start(&mut self, call_type: CallType) -> Result<(), MediaError> {
        self.with_state(|s| {
            if s.fail_start {
                return Err(MediaError("capture device unavailable".to_string()));
            }
            s.active = Some(call_type);
            s.candidates.clear();
            s.local_description = None;
            s.remote_description = None;
            Ok(())
        })?
    }

    fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        self.with_state(|s| {
            let offer = Self::description("offer", s.active);
            s.local_description = Some(offer.clone());
            offer
        })
    }

    fn accept_offer(&mut self, offer: &SessionDescription) -> Result<SessionDescription, MediaError> {
        self.with_state(|s| {
            s.remote_description = Some(offer.clone());
            let answer = Self::description("answer", s.active);
            s.local_description = Some(answer.clone());
            answer
        })
    }

    fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), MediaError> {
        self.with_state(|s| s.remote_description = Some(answer.clone()))
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError> {
        debug!("Loopback media applying ICE candidate {}", candidate.candidate);
        self.with_state(|s| s.candidates.push(candidate.clone()))
    }

    fn stop(&mut self) {
        let _ = self.with_state(|s| {
            if s.active.take().is_some() {
                s.stops += 1;
            }
        });
    }
}
