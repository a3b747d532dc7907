use thiserror::Error;
use tokio::sync::mpsc;

use xpchat_shared::protocol::{IceCandidate, SessionDescription};
use xpchat_shared::types::{CallId, UserId};

use crate::media::MediaTrack;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Negotiation failed: {0}")]
    Negotiation(String),
}

/// Callbacks of a peer connection, turned into values.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Failed,
    Closed,
    LocalCandidate(IceCandidate),
}

/// A [`TransportEvent`] tagged with the call it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportNotice {
    pub remote: UserId,
    pub call_id: CallId,
    pub event: TransportEvent,
}

/// One WebRTC peer connection.
pub trait PeerTransport: Send + Sync {
    fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), TransportError>;
    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;
    fn attach_tracks(&self, tracks: &[MediaTrack]) -> Result<(), TransportError>;
    /// Swap the outgoing video without renegotiating.
    fn replace_video_track(&self, track: &MediaTrack) -> Result<(), TransportError>;
    fn close(&self);
}

/// Builds transports. Each transport reports its events on `events`.
pub trait PeerFactory: Send + Sync + 'static {
    type Transport: PeerTransport + 'static;

    fn create(
        &self,
        remote: &UserId,
        call_id: CallId,
        events: mpsc::UnboundedSender<TransportNotice>,
    ) -> Result<Self::Transport, TransportError>;
}
