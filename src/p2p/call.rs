// Call signaling state machine
//
// Idle -> Ringing -> Connecting -> Active -> Ended, driven by local calls and
// by signaling messages relayed over the session. The machine is pure: it
// takes the clock as an argument and returns the side effects for the
// session actor to carry out.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::media::{MediaEngine, MediaError};
use super::session::SessionActor;
use super::{SessionClosed, SessionManager};
use crate::models::{
    CallAccepted, CallDirection, CallEnded, CallRejected, CallRequest, CallState, CallType, EndReason,
    Payload, RejectReason,
};

/// Reference window after which a call that stopped progressing is torn down.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Another call is already in progress")]
    Busy,
    #[error("Call timed out")]
    Timeout,
    #[error("Call was rejected by the remote side")]
    RemoteRejected,
    #[error("No call in progress")]
    NoActiveCall,
    #[error("Operation not valid while the call is {0}")]
    InvalidState(CallState),
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("Session is shut down")]
    Closed,
}

impl From<SessionClosed> for CallError {
    fn from(_: SessionClosed) -> Self {
        CallError::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    LocalHangup,
    RemoteHangup,
    /// We declined an incoming call.
    Declined,
    RemoteRejected,
    Busy,
    Timeout,
    ConnectionLost,
    MediaFailure,
}

impl CallEndReason {
    /// The error a caller waiting on the call would see, if the end was a failure.
    pub fn error(&self) -> Option<CallError> {
        match self {
            CallEndReason::Busy => Some(CallError::Busy),
            CallEndReason::Timeout => Some(CallError::Timeout),
            CallEndReason::RemoteRejected => Some(CallError::RemoteRejected),
            _ => None,
        }
    }
}

/// The single in-flight call of a local identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub id: String,
    pub contact_id: String,
    pub call_type: CallType,
    pub direction: CallDirection,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub end_reason: Option<CallEndReason>,
    last_progress: Instant,
}

impl CallSession {
    fn new(contact_id: &str, call_type: CallType, direction: CallDirection, now: Instant) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            contact_id: contact_id.to_string(),
            call_type,
            direction,
            state: CallState::Ringing,
            started_at: Utc::now(),
            end_reason: None,
            last_progress: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Someone is calling us; answer with `accept_call` or `reject_call`.
    Incoming(CallSession),
    StateChanged(CallSession),
    Ended { session: CallSession, reason: CallEndReason },
    /// A second caller was turned away while we were busy.
    BusyRejected { caller: String, call_type: CallType },
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    Send { to: String, payload: Payload },
    Notify(CallEvent),
}

pub struct CallStateMachine {
    session: Option<CallSession>,
    timeout: Duration,
    media: Box<dyn MediaEngine>,
    media_started: bool,
}

impl CallStateMachine {
    pub fn new(timeout: Duration, media: Box<dyn MediaEngine>) -> Self {
        Self {
            session: None,
            timeout,
            media,
            media_started: false,
        }
    }

    pub fn current(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> CallState {
        self.session.as_ref().map(|s| s.state).unwrap_or(CallState::Idle)
    }

    pub fn start_call(&mut self, contact_id: &str, call_type: CallType, now: Instant) -> Result<Vec<CallAction>, CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }
        let session = CallSession::new(contact_id, call_type, CallDirection::Outgoing, now);
        info!("Calling {} ({:?}), call {}", contact_id, call_type, session.id);
        self.session = Some(session.clone());

        Ok(vec![
            CallAction::Notify(CallEvent::StateChanged(session)),
            CallAction::Send {
                to: contact_id.to_string(),
                payload: Payload::CallRequest(CallRequest { call_type }),
            },
        ])
    }

    pub fn accept(&mut self, now: Instant) -> Result<Vec<CallAction>, CallError> {
        let (contact_id, call_type) = self.expect_ringing(CallDirection::Incoming)?;

        if let Err(e) = self.start_media(call_type) {
            warn!("Could not start media for call with {}: {}", contact_id, e);
            return Ok(self.finish(CallEndReason::MediaFailure, Some(Self::ended(EndReason::Failure))));
        }

        let mut actions = vec![CallAction::Send {
            to: contact_id,
            payload: Payload::CallAccepted(CallAccepted { call_type }),
        }];
        actions.extend(self.transition(CallState::Connecting, now));
        Ok(actions)
    }

    pub fn reject(&mut self, _now: Instant) -> Result<Vec<CallAction>, CallError> {
        self.expect_ringing(CallDirection::Incoming)?;
        Ok(self.finish(CallEndReason::Declined, Some(Self::rejected(RejectReason::Declined))))
    }

    /// Hang up whatever call is in progress, in any state.
    pub fn end(&mut self, _now: Instant) -> Result<Vec<CallAction>, CallError> {
        if self.session.is_none() {
            return Err(CallError::NoActiveCall);
        }
        Ok(self.finish(CallEndReason::LocalHangup, Some(Self::ended(EndReason::Hangup))))
    }

    /// Feed a signaling message received from `from`.
    pub fn handle_signal(&mut self, from: &str, payload: &Payload, now: Instant) -> Vec<CallAction> {
        if let Payload::CallRequest(request) = payload {
            return self.on_call_request(from, request.call_type, now);
        }

        let Some(session) = self.session.as_ref() else {
            debug!("Ignoring {} from {} with no call in progress", payload.kind(), from);
            return Vec::new();
        };
        if session.contact_id != from {
            debug!(
                "Ignoring {} from {}; current call is with {}",
                payload.kind(),
                from,
                session.contact_id
            );
            return Vec::new();
        }
        let (state, direction, call_type) = (session.state, session.direction, session.call_type);

        match payload {
            Payload::CallAccepted(_) if state == CallState::Ringing && direction == CallDirection::Outgoing => {
                let offer = self.start_media(call_type).and_then(|_| self.media.create_offer().map_err(CallError::from));
                match offer {
                    Ok(offer) => {
                        let mut actions = self.transition(CallState::Connecting, now);
                        actions.push(CallAction::Send {
                            to: from.to_string(),
                            payload: Payload::Offer(offer),
                        });
                        actions
                    }
                    Err(e) => {
                        warn!("Could not start media for call with {}: {}", from, e);
                        self.finish(CallEndReason::MediaFailure, Some(Self::ended(EndReason::Failure)))
                    }
                }
            }
            Payload::CallRejected(rejected) => {
                let reason = match rejected.reason {
                    RejectReason::Busy => CallEndReason::Busy,
                    RejectReason::Timeout => CallEndReason::Timeout,
                    RejectReason::Declined => CallEndReason::RemoteRejected,
                };
                self.finish(reason, None)
            }
            Payload::CallEnded(ended) => {
                let reason = match ended.reason {
                    EndReason::Hangup => CallEndReason::RemoteHangup,
                    EndReason::Timeout => CallEndReason::Timeout,
                    EndReason::Failure => CallEndReason::MediaFailure,
                };
                self.finish(reason, None)
            }
            Payload::Offer(offer) if state == CallState::Connecting && direction == CallDirection::Incoming => {
                match self.media.accept_offer(offer) {
                    Ok(answer) => {
                        let mut actions = vec![CallAction::Send {
                            to: from.to_string(),
                            payload: Payload::Answer(answer),
                        }];
                        actions.extend(self.transition(CallState::Active, now));
                        actions
                    }
                    Err(e) => {
                        warn!("Could not answer offer from {}: {}", from, e);
                        self.finish(CallEndReason::MediaFailure, Some(Self::ended(EndReason::Failure)))
                    }
                }
            }
            Payload::Answer(answer) if state == CallState::Connecting && direction == CallDirection::Outgoing => {
                match self.media.apply_answer(answer) {
                    Ok(()) => self.transition(CallState::Active, now),
                    Err(e) => {
                        warn!("Could not apply answer from {}: {}", from, e);
                        self.finish(CallEndReason::MediaFailure, Some(Self::ended(EndReason::Failure)))
                    }
                }
            }
            Payload::IceCandidate(candidate) if matches!(state, CallState::Connecting | CallState::Active) => {
                if let Err(e) = self.media.add_ice_candidate(candidate) {
                    warn!("Dropping ICE candidate from {}: {}", from, e);
                }
                Vec::new()
            }
            other => {
                debug!("Ignoring {} from {} while {} ({:?})", other.kind(), from, state, direction);
                Vec::new()
            }
        }
    }

    /// The transport to `contact_id` went away.
    pub fn connection_lost(&mut self, contact_id: &str) -> Vec<CallAction> {
        match &self.session {
            Some(session) if session.contact_id == contact_id => self.finish(CallEndReason::ConnectionLost, None),
            _ => Vec::new(),
        }
    }

    /// Tear down a call that has not progressed within the timeout window.
    /// Active calls never time out here.
    pub fn check_timeout(&mut self, now: Instant) -> Vec<CallAction> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        if session.state == CallState::Active || now.saturating_duration_since(session.last_progress) < self.timeout {
            return Vec::new();
        }
        info!("Call {} with {} timed out while {}", session.id, session.contact_id, session.state);
        let notice = match session.state {
            CallState::Ringing => Self::rejected(RejectReason::Timeout),
            _ => Self::ended(EndReason::Timeout),
        };
        self.finish(CallEndReason::Timeout, Some(notice))
    }

    fn on_call_request(&mut self, from: &str, call_type: CallType, now: Instant) -> Vec<CallAction> {
        if let Some(session) = &self.session {
            info!("Rejecting call from {} as busy (in call with {})", from, session.contact_id);
            return vec![
                CallAction::Send {
                    to: from.to_string(),
                    payload: Self::rejected(RejectReason::Busy),
                },
                CallAction::Notify(CallEvent::BusyRejected {
                    caller: from.to_string(),
                    call_type,
                }),
            ];
        }

        let session = CallSession::new(from, call_type, CallDirection::Incoming, now);
        info!("Incoming {:?} call from {}", call_type, from);
        self.session = Some(session.clone());
        vec![CallAction::Notify(CallEvent::Incoming(session))]
    }

    fn expect_ringing(&self, direction: CallDirection) -> Result<(String, CallType), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        if session.state != CallState::Ringing || session.direction != direction {
            return Err(CallError::InvalidState(session.state));
        }
        Ok((session.contact_id.clone(), session.call_type))
    }

    fn start_media(&mut self, call_type: CallType) -> Result<(), CallError> {
        self.media.start(call_type)?;
        self.media_started = true;
        Ok(())
    }

    fn transition(&mut self, state: CallState, now: Instant) -> Vec<CallAction> {
        match self.session.as_mut() {
            Some(session) => {
                debug!("Call {}: {} -> {}", session.id, session.state, state);
                session.state = state;
                session.last_progress = now;
                vec![CallAction::Notify(CallEvent::StateChanged(session.clone()))]
            }
            None => Vec::new(),
        }
    }

    /// Move to Ended and drop the session. Ended is terminal: nothing refers
    /// to the old session afterwards, so late signaling cannot revive it.
    fn finish(&mut self, reason: CallEndReason, notify_peer: Option<Payload>) -> Vec<CallAction> {
        let Some(mut session) = self.session.take() else {
            return Vec::new();
        };
        if self.media_started {
            self.media.stop();
            self.media_started = false;
        }
        session.state = CallState::Ended;
        session.end_reason = Some(reason);
        info!("Call {} with {} ended: {:?}", session.id, session.contact_id, reason);

        let mut actions = Vec::new();
        if let Some(payload) = notify_peer {
            actions.push(CallAction::Send {
                to: session.contact_id.clone(),
                payload,
            });
        }
        actions.push(CallAction::Notify(CallEvent::Ended { session, reason }));
        actions
    }

    fn rejected(reason: RejectReason) -> Payload {
        Payload::CallRejected(CallRejected { reason })
    }

    fn ended(reason: EndReason) -> Payload {
        Payload::CallEnded(CallEnded { reason })
    }
}

impl SessionActor {
    pub(crate) fn start_call(&mut self, contact_id: &str, call_type: CallType) -> Result<CallSession, CallError> {
        if !self.is_reachable(contact_id) {
            return Err(CallError::NotConnected(contact_id.to_string()));
        }
        let actions = self.calls.start_call(contact_id, call_type, Instant::now())?;
        self.run_call_actions(actions);
        self.calls
            .current()
            .cloned()
            .ok_or_else(|| CallError::NotConnected(contact_id.to_string()))
    }

    pub(crate) fn accept_call(&mut self) -> Result<CallSession, CallError> {
        let contact_id = self.calls.current().map(|s| s.contact_id.clone()).unwrap_or_default();
        let actions = self.calls.accept(Instant::now())?;
        let ended = actions.iter().find_map(|action| match action {
            CallAction::Notify(CallEvent::Ended { reason, .. }) => Some(*reason),
            _ => None,
        });
        self.run_call_actions(actions);

        match self.calls.current() {
            Some(session) => Ok(session.clone()),
            None if ended == Some(CallEndReason::MediaFailure) => {
                Err(CallError::Media(MediaError("could not start local media".to_string())))
            }
            None => Err(CallError::NotConnected(contact_id)),
        }
    }

    pub(crate) fn reject_call(&mut self) -> Result<(), CallError> {
        let actions = self.calls.reject(Instant::now())?;
        self.run_call_actions(actions);
        Ok(())
    }

    pub(crate) fn end_call(&mut self) -> Result<(), CallError> {
        let actions = self.calls.end(Instant::now())?;
        self.run_call_actions(actions);
        Ok(())
    }

    pub(crate) fn current_call(&self) -> Option<CallSession> {
        self.calls.current().cloned()
    }

    pub(crate) fn handle_call_signal(&mut self, from: &str, payload: &Payload) {
        let actions = self.calls.handle_signal(from, payload, Instant::now());
        self.run_call_actions(actions);
    }

    pub(crate) fn check_call_timeout(&mut self) {
        let actions = self.calls.check_timeout(Instant::now());
        self.run_call_actions(actions);
    }

    pub(crate) fn call_connection_lost(&mut self, contact_id: &str) {
        let actions = self.calls.connection_lost(contact_id);
        self.run_call_actions(actions);
    }

    /// Carry out state machine actions. A signal that cannot be delivered
    /// means the contact is gone, which ends a call with them. Ended is
    /// terminal, so state changes queued behind such a failure are dropped.
    fn run_call_actions(&mut self, actions: Vec<CallAction>) {
        for action in actions {
            match action {
                CallAction::Send { to, payload } => {
                    let kind = payload.kind();
                    if let Err(e) = self.send_internal(&to, payload) {
                        warn!("Could not deliver {} to {}: {}", kind, to, e);
                        let followup = self.calls.connection_lost(&to);
                        self.run_call_actions(followup);
                    }
                }
                CallAction::Notify(CallEvent::StateChanged(session))
                    if self.calls.current().map(|current| &current.id) != Some(&session.id) =>
                {
                    debug!("Call {} already ended; not reporting {}", session.id, session.state);
                }
                CallAction::Notify(event) => self.listeners.calls.emit(&event),
            }
        }
    }
}

impl SessionManager {
    /// Ring `contact_id`. Fails with `Busy` if a call is already in progress.
    pub async fn start_call(&self, contact_id: &str, call_type: CallType) -> Result<CallSession, CallError> {
        let contact_id = contact_id.to_string();
        self.invoke(move |actor| actor.start_call(&contact_id, call_type)).await?
    }

    pub async fn accept_call(&self) -> Result<CallSession, CallError> {
        self.invoke(|actor| actor.accept_call()).await?
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.invoke(|actor| actor.reject_call()).await?
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.invoke(|actor| actor.end_call()).await?
    }

    pub async fn current_call(&self) -> Option<CallSession> {
        self.invoke(|actor| actor.current_call()).await.ok().flatten()
    }
}
