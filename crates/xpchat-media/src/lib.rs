//! Client-side call handling for XPchat.
//!
//! [`call::CallSession`] is the per-call state machine, [`media`] owns local
//! capture, [`peer`] abstracts the WebRTC transport and [`manager::CallManager`]
//! ties them to the signaling stream.

pub mod call;
pub mod manager;
pub mod media;
pub mod peer;

pub use call::{CallEvent, CallRole, CallSession, CallState, IceDisposition, Transition};
pub use manager::{CallConfig, CallError, CallManager, CallNotification, TimeoutKind};
pub use media::{LocalMediaController, LocalMediaState, MediaDevices, MediaError, MediaTrack, TrackKind};
pub use peer::{PeerFactory, PeerTransport, TransportError, TransportEvent, TransportNotice};
