//! Drives [`CallSession`]s from signaling envelopes, user actions, transport
//! events and timers.
//!
//! The manager owns one session per remote identity. Outgoing envelopes go to
//! `signal_tx` (the signaling client forwards them to the relay) and
//! everything the UI should learn about goes to `notify_tx`. The session map
//! lock is never held across a media acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use xpchat_shared::constants::{DEFAULT_OFFER_TIMEOUT_SECS, DEFAULT_RING_TIMEOUT_SECS};
use xpchat_shared::protocol::{
    CallAnswerRequest, CallAnswerSignal, CallEndRequest, CallEndSignal, CallOfferRequest,
    CallOfferSignal, CallRejectionRequest, CallRejectionSignal, ClientMessage,
    IceCandidateRequest, IceCandidateSignal, SessionDescription, ServerMessage,
};
use xpchat_shared::types::{CallId, CallKind, UserId};

use crate::call::{CallEvent, CallRole, CallSession, CallState, IceDisposition, Transition};
use crate::media::{LocalMediaController, LocalMediaState, MediaDevices, MediaError, MediaTrack};
use crate::peer::{PeerFactory, PeerTransport, TransportError, TransportEvent, TransportNotice};

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Caller gives up when no answer arrives in time.
    pub offer_timeout: Duration,
    /// Callee stops ringing and rejects.
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(DEFAULT_OFFER_TIMEOUT_SECS),
            ring_timeout: Duration::from_secs(DEFAULT_RING_TIMEOUT_SECS),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call with {0}")]
    AlreadyInCall(UserId),

    #[error("No call with {0}")]
    NoSession(UserId),

    #[error("Call with {remote} is {state:?}")]
    InvalidState { remote: UserId, state: CallState },

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallNotification {
    StateChanged {
        remote: UserId,
        call_id: CallId,
        state: CallState,
    },
    IncomingCall {
        remote: UserId,
        remote_name: String,
        call_id: CallId,
        kind: CallKind,
    },
    /// Call setup or an established call failed; `reason` is for display.
    Error {
        remote: UserId,
        call_id: CallId,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Offer,
    Ring,
}

struct Entry<T> {
    session: CallSession,
    transport: Option<T>,
}

type Sessions<T> = HashMap<UserId, Entry<T>>;

struct Inner<D, F: PeerFactory> {
    local_id: UserId,
    config: CallConfig,
    media: LocalMediaController<D>,
    factory: F,
    sessions: Mutex<Sessions<F::Transport>>,
    signal_tx: mpsc::UnboundedSender<ClientMessage>,
    notify_tx: mpsc::UnboundedSender<CallNotification>,
    transport_tx: mpsc::UnboundedSender<TransportNotice>,
}

pub struct CallManager<D, F: PeerFactory> {
    inner: Arc<Inner<D, F>>,
}

impl<D, F: PeerFactory> Clone for CallManager<D, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: MediaDevices, F: PeerFactory> CallManager<D, F> {
    /// Must be called inside a tokio runtime: transport events are pumped by
    /// a background task that lives as long as the manager.
    pub fn new(
        local_id: UserId,
        config: CallConfig,
        devices: D,
        factory: F,
        signal_tx: mpsc::UnboundedSender<ClientMessage>,
        notify_tx: mpsc::UnboundedSender<CallNotification>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local_id,
            config,
            media: LocalMediaController::new(devices),
            factory,
            sessions: Mutex::new(HashMap::new()),
            signal_tx,
            notify_tx,
            transport_tx,
        });
        spawn_transport_pump(Arc::downgrade(&inner), transport_rx);
        Self { inner }
    }

    pub fn local_id(&self) -> &UserId {
        &self.inner.local_id
    }

    pub async fn state_of(&self, remote: &UserId) -> Option<CallState> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(remote).map(|e| e.session.state())
    }

    pub async fn call_id_of(&self, remote: &UserId) -> Option<CallId> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(remote).map(|e| e.session.call_id)
    }

    pub fn media_state(&self) -> Option<LocalMediaState> {
        self.inner.media.state()
    }

    // -----------------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------------

    /// Acquire media, open a transport and send `call_offer` to `remote`.
    pub async fn initiate_call(&self, remote: &UserId, kind: CallKind) -> Result<CallId, CallError> {
        let inner = &self.inner;
        let call_id = {
            let mut sessions = inner.sessions.lock().await;
            if sessions.contains_key(remote) {
                return Err(CallError::AlreadyInCall(remote.clone()));
            }
            let session = CallSession::outgoing(remote.clone(), kind);
            let call_id = session.call_id;
            sessions.insert(
                remote.clone(),
                Entry {
                    session,
                    transport: None,
                },
            );
            call_id
        };
        info!(remote = %remote.short(), call = %call_id, kind = kind.as_str(), "Starting call");

        let tracks = match inner.media.acquire(call_id, kind).await {
            Ok(tracks) => tracks,
            Err(e) => {
                let mut sessions = inner.sessions.lock().await;
                if sessions.get(remote).is_some_and(|e| e.session.call_id == call_id) {
                    sessions.remove(remote);
                }
                if e != MediaError::Cancelled {
                    inner.notify_error(remote, call_id, e.to_string());
                }
                return Err(e.into());
            }
        };

        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = sessions
            .get_mut(remote)
            .filter(|e| e.session.call_id == call_id)
        else {
            // Hung up while the device prompt was open.
            inner.media.release(call_id);
            return Err(MediaError::Cancelled.into());
        };

        let (transport, offer) = match inner.open_offer(remote, call_id, &tracks) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(remote = %remote.short(), error = %e, "Could not create offer");
                sessions.remove(remote);
                inner.media.release(call_id);
                inner.notify_error(remote, call_id, e.to_string());
                return Err(e.into());
            }
        };

        entry.transport = Some(transport);
        entry.session.handle(CallEvent::OfferSent);
        inner.after_transition(&mut sessions, remote);
        drop(sessions);

        inner.send(ClientMessage::CallOffer(CallOfferRequest {
            to_user_id: remote.clone(),
            offer,
            call_type: kind,
            call_id: Some(call_id),
        }));
        self.spawn_timeout(remote.clone(), call_id, TimeoutKind::Offer);
        Ok(call_id)
    }

    /// Answer the ringing call from `remote`.
    pub async fn accept_call(&self, remote: &UserId) -> Result<(), CallError> {
        let inner = &self.inner;
        let (call_id, kind) = {
            let sessions = inner.sessions.lock().await;
            let entry = sessions
                .get(remote)
                .ok_or_else(|| CallError::NoSession(remote.clone()))?;
            if entry.session.state() != CallState::Ringing {
                return Err(CallError::InvalidState {
                    remote: remote.clone(),
                    state: entry.session.state(),
                });
            }
            (entry.session.call_id, entry.session.kind)
        };

        let tracks = match inner.media.acquire(call_id, kind).await {
            Ok(tracks) => tracks,
            Err(e) => {
                let mut sessions = inner.sessions.lock().await;
                inner.fail_setup(&mut sessions, remote, call_id, e.to_string());
                return Err(e.into());
            }
        };

        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = sessions.get_mut(remote).filter(|e| {
            e.session.call_id == call_id && e.session.state() == CallState::Ringing
        }) else {
            inner.media.release(call_id);
            return Err(CallError::NoSession(remote.clone()));
        };

        let answer = match &entry.transport {
            Some(t) => t.attach_tracks(&tracks).and_then(|_| t.create_answer()),
            None => Err(TransportError::Closed),
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                inner.fail_setup(&mut sessions, remote, call_id, e.to_string());
                return Err(e.into());
            }
        };

        entry.session.handle(CallEvent::Accepted);
        inner.after_transition(&mut sessions, remote);
        drop(sessions);

        info!(remote = %remote.short(), call = %call_id, "Call accepted");
        inner.send(ClientMessage::CallAnswer(CallAnswerRequest {
            to_user_id: remote.clone(),
            answer,
            call_id: Some(call_id),
        }));
        Ok(())
    }

    /// Decline the ringing call from `remote`.
    pub async fn reject_call(&self, remote: &UserId) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut sessions = inner.sessions.lock().await;
        let entry = sessions
            .get_mut(remote)
            .ok_or_else(|| CallError::NoSession(remote.clone()))?;
        let call_id = entry.session.call_id;

        if let Transition::Ignored = entry.session.handle(CallEvent::Declined) {
            return Err(CallError::InvalidState {
                remote: remote.clone(),
                state: entry.session.state(),
            });
        }
        inner.after_transition(&mut sessions, remote);
        drop(sessions);

        inner.send(ClientMessage::CallRejection(CallRejectionRequest {
            to_user_id: remote.clone(),
            call_id: Some(call_id),
        }));
        Ok(())
    }

    /// End the call with `remote`. Media and transport are released before
    /// this returns, whether or not `call_end` could be sent.
    pub async fn hangup(&self, remote: &UserId) -> Result<(), CallError> {
        let inner = &self.inner;
        let mut sessions = inner.sessions.lock().await;
        let entry = sessions
            .get_mut(remote)
            .ok_or_else(|| CallError::NoSession(remote.clone()))?;
        let call_id = entry.session.call_id;
        let was = entry.session.state();

        entry.session.handle(CallEvent::Hangup);
        inner.after_transition(&mut sessions, remote);
        drop(sessions);

        // The peer never heard of a call still acquiring media.
        if was != CallState::Idle {
            inner.send(ClientMessage::CallEnd(CallEndRequest {
                to_user_id: remote.clone(),
                call_id: Some(call_id),
            }));
        }
        info!(remote = %remote.short(), call = %call_id, "Hung up");
        Ok(())
    }

    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        Ok(self.inner.media.toggle_mute()?)
    }

    pub fn toggle_video(&self) -> Result<bool, CallError> {
        Ok(self.inner.media.toggle_video()?)
    }

    /// Start or stop screen sharing. Returns whether sharing is now on.
    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        let inner = &self.inner;
        let sharing = inner
            .media
            .state()
            .map(|s| s.screen_sharing)
            .ok_or(MediaError::NotHeld)?;

        if sharing {
            if let Some(camera) = inner.media.stop_screen_share()? {
                self.replace_outgoing_video(&camera).await;
            }
            Ok(false)
        } else {
            let screen = inner.media.start_screen_share().await?;
            self.replace_outgoing_video(&screen).await;
            Ok(true)
        }
    }

    async fn replace_outgoing_video(&self, track: &MediaTrack) {
        let sessions = self.inner.sessions.lock().await;
        for entry in sessions.values() {
            if entry.session.state() != CallState::Active {
                continue;
            }
            if let Some(t) = &entry.transport {
                if let Err(e) = t.replace_video_track(track) {
                    warn!(remote = %entry.session.remote_id.short(), error = %e, "Video track swap failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound signaling
    // -----------------------------------------------------------------------

    /// Feed one envelope from the relay. Non-call kinds are ignored except
    /// a peer's connection going away, which ends calls with that peer. A
    /// manual "offline" status leaves calls alone.
    pub async fn handle_signal(&self, message: ServerMessage) {
        match message {
            ServerMessage::CallOffer(sig) => self.on_offer(sig).await,
            ServerMessage::CallAnswer(sig) => self.on_answer(sig).await,
            ServerMessage::CallRejection(sig) => self.on_rejection(sig).await,
            ServerMessage::IceCandidate(sig) => self.on_remote_candidate(sig).await,
            ServerMessage::CallEnd(sig) => self.on_end(sig).await,
            ServerMessage::UserStatusChange(change) if change.disconnected => {
                self.on_peer_left(&change.user_id).await
            }
            other => debug!(kind = other.kind(), "Not a call signal"),
        }
    }

    async fn on_offer(&self, sig: CallOfferSignal) {
        let inner = &self.inner;
        let remote = sig.from_user_id;
        let mut sessions = inner.sessions.lock().await;

        if let Some(existing) = sessions.get_mut(&remote) {
            if existing.session.call_id == sig.call_id {
                debug!(call = %sig.call_id, "Duplicate offer ignored");
                return;
            }

            let glare = existing.session.role == CallRole::Caller
                && existing.session.state() == CallState::Offering;

            if glare && inner.local_id < remote {
                info!(remote = %remote.short(), "Glare: keeping our outgoing call");
                drop(sessions);
                inner.reject_offer(&remote, sig.call_id);
                return;
            }
            if !glare {
                warn!(remote = %remote.short(), call = %sig.call_id, "Second offer for a live call");
                drop(sessions);
                inner.reject_offer(&remote, sig.call_id);
                return;
            }

            info!(remote = %remote.short(), "Glare: yielding to the incoming call");
            existing.session.handle(CallEvent::RejectReceived);
            inner.after_transition(&mut sessions, &remote);
        }

        let transport = match inner.open_answerer(&remote, sig.call_id, &sig.offer) {
            Ok(t) => t,
            Err(e) => {
                warn!(remote = %remote.short(), error = %e, "Could not apply remote offer");
                drop(sessions);
                inner.reject_offer(&remote, sig.call_id);
                inner.notify_error(&remote, sig.call_id, e.to_string());
                return;
            }
        };

        let mut session = CallSession::incoming(remote.clone(), sig.call_id, sig.call_type);
        session.remote_description_applied();
        session.handle(CallEvent::OfferReceived);

        info!(
            remote = %remote.short(),
            call = %sig.call_id,
            kind = sig.call_type.as_str(),
            "Incoming call"
        );
        inner.notify(CallNotification::IncomingCall {
            remote: remote.clone(),
            remote_name: sig.from_user_name,
            call_id: sig.call_id,
            kind: sig.call_type,
        });
        inner.notify_state(&session);
        sessions.insert(
            remote.clone(),
            Entry {
                session,
                transport: Some(transport),
            },
        );
        drop(sessions);

        self.spawn_timeout(remote, sig.call_id, TimeoutKind::Ring);
    }

    async fn on_answer(&self, sig: CallAnswerSignal) {
        let inner = &self.inner;
        let remote = sig.from_user_id;
        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = inner.matching(&mut sessions, &remote, sig.call_id) else {
            return;
        };
        if entry.session.state() != CallState::Offering {
            debug!(remote = %remote.short(), state = ?entry.session.state(), "Answer ignored");
            return;
        }

        let applied = match &entry.transport {
            Some(t) => t.set_remote_description(&sig.answer),
            None => Err(TransportError::Closed),
        };
        if let Err(e) = applied {
            let call_id = entry.session.call_id;
            warn!(remote = %remote.short(), error = %e, "Could not apply answer");
            entry.session.handle(CallEvent::SetupFailed);
            inner.after_transition(&mut sessions, &remote);
            drop(sessions);
            inner.notify_error(&remote, call_id, e.to_string());
            inner.send(ClientMessage::CallEnd(CallEndRequest {
                to_user_id: remote,
                call_id: Some(call_id),
            }));
            return;
        }

        entry.session.handle(CallEvent::AnswerReceived);
        let pending = entry.session.remote_description_applied();
        if let Some(t) = &entry.transport {
            for candidate in &pending {
                if let Err(e) = t.add_ice_candidate(candidate) {
                    warn!(remote = %remote.short(), error = %e, "Buffered candidate rejected");
                }
            }
        }
        if !pending.is_empty() {
            debug!(remote = %remote.short(), count = pending.len(), "Flushed buffered candidates");
        }
        inner.after_transition(&mut sessions, &remote);
    }

    async fn on_rejection(&self, sig: CallRejectionSignal) {
        let inner = &self.inner;
        let remote = sig.from_user_id;
        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = inner.matching(&mut sessions, &remote, sig.call_id) else {
            return;
        };
        match entry.session.handle(CallEvent::RejectReceived) {
            Transition::Moved { .. } => {
                info!(remote = %remote.short(), "Call rejected by peer");
                inner.after_transition(&mut sessions, &remote);
            }
            Transition::Ignored => debug!(remote = %remote.short(), "Rejection ignored"),
        }
    }

    async fn on_remote_candidate(&self, sig: IceCandidateSignal) {
        let inner = &self.inner;
        let remote = sig.from_user_id;
        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = inner.matching(&mut sessions, &remote, sig.call_id) else {
            return;
        };
        match entry.session.accept_candidate(sig.candidate) {
            IceDisposition::Apply(candidate) => {
                if let Some(t) = &entry.transport {
                    if let Err(e) = t.add_ice_candidate(&candidate) {
                        warn!(remote = %remote.short(), error = %e, "Candidate rejected");
                    }
                }
            }
            IceDisposition::Buffered => {
                debug!(remote = %remote.short(), "Candidate buffered until remote description")
            }
            IceDisposition::Dropped => debug!(remote = %remote.short(), "Candidate dropped"),
        }
    }

    async fn on_end(&self, sig: CallEndSignal) {
        let inner = &self.inner;
        let remote = sig.from_user_id;
        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = inner.matching(&mut sessions, &remote, sig.call_id) else {
            return;
        };
        if let Transition::Moved { .. } = entry.session.handle(CallEvent::EndReceived) {
            info!(remote = %remote.short(), name = %sig.from_user_name, "Call ended by peer");
            inner.after_transition(&mut sessions, &remote);
        }
    }

    async fn on_peer_left(&self, remote: &UserId) {
        let inner = &self.inner;
        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = sessions.get_mut(remote) else {
            return;
        };
        let call_id = entry.session.call_id;
        if let Transition::Moved { to, .. } = entry.session.handle(CallEvent::PeerLeft) {
            inner.after_transition(&mut sessions, remote);
            if to == CallState::Failed {
                inner.notify_error(remote, call_id, "Peer went offline".into());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transport events and timers
    // -----------------------------------------------------------------------

    pub async fn on_transport_event(&self, remote: &UserId, call_id: CallId, event: TransportEvent) {
        let inner = &self.inner;
        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = sessions
            .get_mut(remote)
            .filter(|e| e.session.call_id == call_id)
        else {
            debug!(remote = %remote.short(), call = %call_id, ?event, "Stale transport event");
            return;
        };

        let lost = match event {
            TransportEvent::Connected => CallEvent::TransportConnected,
            TransportEvent::Failed => CallEvent::TransportFailed,
            TransportEvent::Closed => CallEvent::TransportClosed,
            TransportEvent::LocalCandidate(candidate) => {
                drop(sessions);
                inner.send(ClientMessage::IceCandidate(IceCandidateRequest {
                    to_user_id: remote.clone(),
                    candidate,
                    call_id: Some(call_id),
                }));
                return;
            }
        };

        let Transition::Moved { to, .. } = entry.session.handle(lost) else {
            return;
        };
        inner.after_transition(&mut sessions, remote);
        drop(sessions);

        if to.is_terminal() {
            if to == CallState::Failed {
                inner.notify_error(remote, call_id, "Connection failed".into());
            }
            inner.send(ClientMessage::CallEnd(CallEndRequest {
                to_user_id: remote.clone(),
                call_id: Some(call_id),
            }));
        }
    }

    pub async fn on_timeout(&self, remote: &UserId, call_id: CallId, kind: TimeoutKind) {
        let inner = &self.inner;
        let mut sessions = inner.sessions.lock().await;
        let Some(entry) = sessions
            .get_mut(remote)
            .filter(|e| e.session.call_id == call_id)
        else {
            return;
        };

        let event = match kind {
            TimeoutKind::Offer => CallEvent::OfferTimedOut,
            TimeoutKind::Ring => CallEvent::RingTimedOut,
        };
        if let Transition::Ignored = entry.session.handle(event) {
            return;
        }
        info!(remote = %remote.short(), call = %call_id, ?kind, "Call timed out");
        inner.after_transition(&mut sessions, remote);
        drop(sessions);

        match kind {
            TimeoutKind::Offer => inner.notify_error(remote, call_id, "No answer".into()),
            TimeoutKind::Ring => inner.send(ClientMessage::CallRejection(CallRejectionRequest {
                to_user_id: remote.clone(),
                call_id: Some(call_id),
            })),
        }
    }

    fn spawn_timeout(&self, remote: UserId, call_id: CallId, kind: TimeoutKind) {
        let after = match kind {
            TimeoutKind::Offer => self.inner.config.offer_timeout,
            TimeoutKind::Ring => self.inner.config.ring_timeout,
        };
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                CallManager { inner }.on_timeout(&remote, call_id, kind).await;
            }
        });
    }
}

fn spawn_transport_pump<D: MediaDevices, F: PeerFactory>(
    weak: Weak<Inner<D, F>>,
    mut rx: mpsc::UnboundedReceiver<TransportNotice>,
) {
    tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            CallManager { inner }
                .on_transport_event(&notice.remote, notice.call_id, notice.event)
                .await;
        }
    });
}

impl<D: MediaDevices, F: PeerFactory> Inner<D, F> {
    fn send(&self, message: ClientMessage) {
        let kind = message.kind();
        if self.signal_tx.send(message).is_err() {
            warn!(kind, "Signaling channel closed, envelope dropped");
        }
    }

    fn notify(&self, notification: CallNotification) {
        let _ = self.notify_tx.send(notification);
    }

    fn notify_state(&self, session: &CallSession) {
        self.notify(CallNotification::StateChanged {
            remote: session.remote_id.clone(),
            call_id: session.call_id,
            state: session.state(),
        });
    }

    fn notify_error(&self, remote: &UserId, call_id: CallId, reason: String) {
        self.notify(CallNotification::Error {
            remote: remote.clone(),
            call_id,
            reason,
        });
    }

    /// Announce the session's new state; terminal sessions are removed with
    /// their transport closed and media released.
    fn after_transition(&self, sessions: &mut Sessions<F::Transport>, remote: &UserId) {
        let Some(entry) = sessions.get(remote) else {
            return;
        };
        if !entry.session.state().is_terminal() {
            self.notify_state(&entry.session);
            return;
        }
        let Some(entry) = sessions.remove(remote) else {
            return;
        };
        if let Some(t) = &entry.transport {
            t.close();
        }
        self.media.release(entry.session.call_id);
        info!(
            remote = %remote.short(),
            call = %entry.session.call_id,
            state = ?entry.session.state(),
            "Call finished"
        );
        self.notify_state(&entry.session);
    }

    /// Session for `remote` when the signal's call id matches it.
    fn matching<'a>(
        &self,
        sessions: &'a mut Sessions<F::Transport>,
        remote: &UserId,
        call_id: Option<CallId>,
    ) -> Option<&'a mut Entry<F::Transport>> {
        match sessions.get_mut(remote) {
            Some(entry) if entry.session.matches(call_id) => Some(entry),
            Some(entry) => {
                debug!(
                    remote = %remote.short(),
                    current = %entry.session.call_id,
                    "Signal for another call ignored"
                );
                None
            }
            None => {
                debug!(remote = %remote.short(), "Signal without a session ignored");
                None
            }
        }
    }

    /// Callee setup failed: fail the session and tell the caller right away.
    fn fail_setup(
        &self,
        sessions: &mut Sessions<F::Transport>,
        remote: &UserId,
        call_id: CallId,
        reason: String,
    ) {
        let Some(entry) = sessions
            .get_mut(remote)
            .filter(|e| e.session.call_id == call_id)
        else {
            return;
        };
        if let Transition::Moved { .. } = entry.session.handle(CallEvent::SetupFailed) {
            self.after_transition(sessions, remote);
            self.reject_offer(remote, call_id);
            self.notify_error(remote, call_id, reason);
        }
    }

    fn reject_offer(&self, remote: &UserId, call_id: CallId) {
        self.send(ClientMessage::CallRejection(CallRejectionRequest {
            to_user_id: remote.clone(),
            call_id: Some(call_id),
        }));
    }

    fn open_offer(
        &self,
        remote: &UserId,
        call_id: CallId,
        tracks: &[MediaTrack],
    ) -> Result<(F::Transport, SessionDescription), TransportError> {
        let transport = self
            .factory
            .create(remote, call_id, self.transport_tx.clone())?;
        match transport
            .attach_tracks(tracks)
            .and_then(|_| transport.create_offer())
        {
            Ok(offer) => Ok((transport, offer)),
            Err(e) => {
                transport.close();
                Err(e)
            }
        }
    }

    fn open_answerer(
        &self,
        remote: &UserId,
        call_id: CallId,
        offer: &SessionDescription,
    ) -> Result<F::Transport, TransportError> {
        let transport = self
            .factory
            .create(remote, call_id, self.transport_tx.clone())?;
        match transport.set_remote_description(offer) {
            Ok(()) => Ok(transport),
            Err(e) => {
                transport.close();
                Err(e)
            }
        }
    }
}
