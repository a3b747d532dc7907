use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use xpchat_shared::protocol::IceCandidate;
use xpchat_shared::types::{CallId, CallKind, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Offering,
    Ringing,
    Connecting,
    Active,
    Ended,
    Rejected,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Failed)
    }

    /// States in which remote ICE candidates are taken.
    pub fn accepts_ice(&self) -> bool {
        matches!(
            self,
            Self::Offering | Self::Ringing | Self::Connecting | Self::Active
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// Caller: local media acquired and `call_offer` sent.
    OfferSent,
    /// Callee: a remote offer was applied.
    OfferReceived,
    AnswerReceived,
    RejectReceived,
    OfferTimedOut,
    /// Callee: the user accepted and the answer was sent.
    Accepted,
    /// Callee: the user declined.
    Declined,
    RingTimedOut,
    /// Media, transport or description setup failed before the call connected.
    SetupFailed,
    TransportConnected,
    TransportFailed,
    TransportClosed,
    EndReceived,
    Hangup,
    PeerLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved { from: CallState, to: CallState },
    Ignored,
}

/// What to do with a remote ICE candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum IceDisposition {
    Apply(IceCandidate),
    Buffered,
    Dropped,
}

/// One call with one remote peer.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: CallId,
    pub role: CallRole,
    pub kind: CallKind,
    pub remote_id: UserId,
    state: CallState,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl CallSession {
    pub fn outgoing(remote_id: UserId, kind: CallKind) -> Self {
        Self::new(CallId::new(), CallRole::Caller, kind, remote_id)
    }

    pub fn incoming(remote_id: UserId, call_id: CallId, kind: CallKind) -> Self {
        Self::new(call_id, CallRole::Callee, kind, remote_id)
    }

    fn new(call_id: CallId, role: CallRole, kind: CallKind, remote_id: UserId) -> Self {
        Self {
            call_id,
            role,
            kind,
            remote_id,
            state: CallState::Idle,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// `None` matches any session; signals without a call id predate it.
    pub fn matches(&self, call_id: Option<CallId>) -> bool {
        call_id.map_or(true, |id| id == self.call_id)
    }

    pub fn handle(&mut self, event: CallEvent) -> Transition {
        use CallEvent as E;
        use CallState as S;

        let next = match (self.state, self.role, event) {
            (S::Idle, CallRole::Caller, E::OfferSent) => S::Offering,
            (S::Idle, CallRole::Callee, E::OfferReceived) => S::Ringing,

            (S::Offering, _, E::AnswerReceived) => S::Connecting,
            (S::Offering, _, E::RejectReceived) => S::Rejected,
            (S::Offering, _, E::OfferTimedOut) => S::Failed,

            (S::Ringing, _, E::Accepted) => S::Connecting,
            (S::Ringing, _, E::Declined | E::RingTimedOut) => S::Rejected,
            (S::Idle | S::Offering | S::Ringing, _, E::SetupFailed) => S::Failed,

            (S::Connecting, _, E::TransportConnected) => S::Active,
            (S::Connecting, _, E::TransportFailed | E::TransportClosed) => S::Failed,
            (S::Active, _, E::TransportFailed | E::TransportClosed) => S::Ended,

            (S::Active, _, E::PeerLeft) => S::Ended,
            (s, _, E::PeerLeft) if !s.is_terminal() => S::Failed,

            (s, _, E::EndReceived | E::Hangup) if !s.is_terminal() => S::Ended,

            _ => {
                debug!(
                    call = %self.call_id,
                    state = ?self.state,
                    event = ?event,
                    "Ignoring call event"
                );
                return Transition::Ignored;
            }
        };

        let from = self.state;
        self.state = next;
        match next {
            S::Active => self.connected_at = Some(Utc::now()),
            s if s.is_terminal() => {
                self.ended_at = Some(Utc::now());
                self.pending_candidates.clear();
            }
            _ => {}
        }

        debug!(
            call = %self.call_id,
            remote = %self.remote_id.short(),
            ?from,
            to = ?next,
            "Call state changed"
        );
        Transition::Moved { from, to: next }
    }

    /// Decide what to do with a remote candidate. Candidates that arrive
    /// before the remote description are held until it is applied.
    pub fn accept_candidate(&mut self, candidate: IceCandidate) -> IceDisposition {
        if !self.state.accepts_ice() {
            return IceDisposition::Dropped;
        }
        if self.remote_description_set {
            IceDisposition::Apply(candidate)
        } else {
            self.pending_candidates.push(candidate);
            IceDisposition::Buffered
        }
    }

    /// Mark the remote description applied and hand back the buffered
    /// candidates. Later calls return nothing.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending_candidates)
    }
}
