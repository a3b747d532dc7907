//! Local capture ownership.
//!
//! Exactly one capture can be held at a time. The slot is claimed before the
//! device prompt is awaited so a second caller fails fast with
//! [`MediaError::Busy`] instead of racing for the camera, and a release while
//! the prompt is open cancels the pending acquisition.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use xpchat_shared::types::{CallId, CallKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media access denied")]
    AccessDenied,

    #[error("No capture device found")]
    DeviceNotFound,

    #[error("Capture already in use")]
    Busy,

    #[error("Acquisition cancelled")]
    Cancelled,

    #[error("Nothing captured")]
    NotHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

/// Handle to one captured track. Clones share the same flags.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop capture. Irreversible.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            debug!(track = %self.id, kind = ?self.kind, "Track stopped");
        }
    }
}

/// Platform capture backend (browser `getUserMedia`, cpal, a test fake).
pub trait MediaDevices: Send + Sync + 'static {
    fn acquire(
        &self,
        kind: CallKind,
    ) -> impl Future<Output = Result<Vec<MediaTrack>, MediaError>> + Send;

    fn acquire_screen(&self) -> impl Future<Output = Result<MediaTrack, MediaError>> + Send;
}

/// Snapshot of the held capture.
#[derive(Debug, Clone, Default)]
pub struct LocalMediaState {
    pub tracks: Vec<MediaTrack>,
    pub screen_track: Option<MediaTrack>,
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl LocalMediaState {
    fn camera_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
        if let Some(screen) = &self.screen_track {
            screen.stop();
        }
    }
}

enum Slot {
    Free,
    Acquiring { owner: CallId },
    Held { owner: CallId, state: LocalMediaState },
}

pub struct LocalMediaController<D> {
    devices: D,
    slot: Mutex<Slot>,
}

impl<D: MediaDevices> LocalMediaController<D> {
    pub fn new(devices: D) -> Self {
        Self {
            devices,
            slot: Mutex::new(Slot::Free),
        }
    }

    // A panic while holding the slot leaves plain data behind; keep using it.
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire capture for `kind` on behalf of call `owner`.
    pub async fn acquire(
        &self,
        owner: CallId,
        kind: CallKind,
    ) -> Result<Vec<MediaTrack>, MediaError> {
        {
            let mut slot = self.slot();
            if !matches!(*slot, Slot::Free) {
                return Err(MediaError::Busy);
            }
            *slot = Slot::Acquiring { owner };
        }

        let result = self.devices.acquire(kind).await;

        let mut slot = self.slot();
        let still_ours = matches!(*slot, Slot::Acquiring { owner: o } if o == owner);

        match result {
            Ok(tracks) if still_ours => {
                info!(call = %owner, kind = kind.as_str(), tracks = tracks.len(), "Media acquired");
                let state = LocalMediaState {
                    video_enabled: tracks.iter().any(|t| t.kind == TrackKind::Video),
                    tracks: tracks.clone(),
                    ..Default::default()
                };
                *slot = Slot::Held { owner, state };
                Ok(tracks)
            }
            Ok(tracks) => {
                debug!(call = %owner, "Acquisition finished after release, stopping tracks");
                for t in &tracks {
                    t.stop();
                }
                Err(MediaError::Cancelled)
            }
            Err(e) => {
                warn!(call = %owner, error = %e, "Media acquisition failed");
                if still_ours {
                    *slot = Slot::Free;
                }
                Err(e)
            }
        }
    }

    /// Stop everything held (or pending) for `owner`. Returns whether
    /// anything was released.
    pub fn release(&self, owner: CallId) -> bool {
        let mut slot = self.slot();
        match &*slot {
            Slot::Held { owner: o, state } if *o == owner => {
                state.stop_all();
                info!(call = %owner, "Media released");
            }
            Slot::Acquiring { owner: o } if *o == owner => {
                debug!(call = %owner, "Pending acquisition cancelled");
            }
            _ => return false,
        }
        *slot = Slot::Free;
        true
    }

    pub fn owner(&self) -> Option<CallId> {
        match &*self.slot() {
            Slot::Free => None,
            Slot::Acquiring { owner } | Slot::Held { owner, .. } => Some(*owner),
        }
    }

    pub fn state(&self) -> Option<LocalMediaState> {
        match &*self.slot() {
            Slot::Held { state, .. } => Some(state.clone()),
            _ => None,
        }
    }

    /// Flip the microphone. Returns the new muted flag.
    pub fn toggle_mute(&self) -> Result<bool, MediaError> {
        let mut slot = self.slot();
        let Slot::Held { state, .. } = &mut *slot else {
            return Err(MediaError::NotHeld);
        };
        state.muted = !state.muted;
        for t in state.tracks.iter().filter(|t| t.kind == TrackKind::Audio) {
            t.set_enabled(!state.muted);
        }
        Ok(state.muted)
    }

    /// Flip the camera. Returns the new video-enabled flag.
    pub fn toggle_video(&self) -> Result<bool, MediaError> {
        let mut slot = self.slot();
        let Slot::Held { state, .. } = &mut *slot else {
            return Err(MediaError::NotHeld);
        };
        let Some(camera) = state.camera_track() else {
            return Err(MediaError::DeviceNotFound);
        };
        let enabled = !state.video_enabled;
        camera.set_enabled(enabled);
        state.video_enabled = enabled;
        Ok(enabled)
    }

    /// Start capturing the screen. The returned track replaces the outgoing
    /// video on every active transport.
    pub async fn start_screen_share(&self) -> Result<MediaTrack, MediaError> {
        let owner = match &*self.slot() {
            Slot::Held { owner, state } if !state.screen_sharing => *owner,
            Slot::Held { .. } => return Err(MediaError::Busy),
            _ => return Err(MediaError::NotHeld),
        };

        let track = self.devices.acquire_screen().await?;

        let mut slot = self.slot();
        match &mut *slot {
            Slot::Held { owner: o, state } if *o == owner && !state.screen_sharing => {
                state.screen_sharing = true;
                state.screen_track = Some(track.clone());
                info!(call = %owner, "Screen share started");
                Ok(track)
            }
            _ => {
                track.stop();
                Err(MediaError::Cancelled)
            }
        }
    }

    /// Stop screen capture. Returns the camera track to restore, if any.
    pub fn stop_screen_share(&self) -> Result<Option<MediaTrack>, MediaError> {
        let mut slot = self.slot();
        let Slot::Held { state, .. } = &mut *slot else {
            return Err(MediaError::NotHeld);
        };
        if let Some(screen) = state.screen_track.take() {
            screen.stop();
        }
        state.screen_sharing = false;
        Ok(state.camera_track().cloned())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Scripted capture backend recording every track it hands out.
    #[derive(Clone, Default)]
    pub struct FakeDevices {
        pub deny: Arc<AtomicBool>,
        pub no_device: Arc<AtomicBool>,
        pub delay_ms: Arc<AtomicUsize>,
        pub issued: Arc<Mutex<Vec<MediaTrack>>>,
    }

    impl FakeDevices {
        pub fn issued(&self) -> Vec<MediaTrack> {
            self.issued.lock().unwrap().clone()
        }

        pub fn all_stopped(&self) -> bool {
            self.issued().iter().all(|t| !t.is_live())
        }

        async fn pause(&self) {
            let ms = self.delay_ms.load(Ordering::SeqCst) as u64;
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }

        fn issue(&self, kind: TrackKind) -> MediaTrack {
            let mut issued = self.issued.lock().unwrap();
            let track = MediaTrack::new(format!("track-{}", issued.len()), kind);
            issued.push(track.clone());
            track
        }
    }

    impl MediaDevices for FakeDevices {
        async fn acquire(&self, kind: CallKind) -> Result<Vec<MediaTrack>, MediaError> {
            self.pause().await;
            if self.deny.load(Ordering::SeqCst) {
                return Err(MediaError::AccessDenied);
            }
            if self.no_device.load(Ordering::SeqCst) {
                return Err(MediaError::DeviceNotFound);
            }
            let mut tracks = Vec::new();
            if kind.wants_audio() {
                tracks.push(self.issue(TrackKind::Audio));
            }
            if kind.wants_video() {
                let video = if kind == CallKind::Screen {
                    TrackKind::Screen
                } else {
                    TrackKind::Video
                };
                tracks.push(self.issue(video));
            }
            Ok(tracks)
        }

        async fn acquire_screen(&self) -> Result<MediaTrack, MediaError> {
            self.pause().await;
            Ok(self.issue(TrackKind::Screen))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeDevices;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_acquire_is_busy_and_release_stops_tracks() {
        let devices = FakeDevices::default();
        let media = LocalMediaController::new(devices.clone());
        let first = CallId::new();

        let tracks = media.acquire(first, CallKind::Video).await.unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(
            media.acquire(CallId::new(), CallKind::Audio).await.unwrap_err(),
            MediaError::Busy
        );

        // Only the owner can release.
        assert!(!media.release(CallId::new()));
        assert!(devices.issued().iter().all(|t| t.is_live()));

        assert!(media.release(first));
        assert!(devices.all_stopped());
        assert!(media.owner().is_none());
    }

    #[tokio::test]
    async fn denied_access_frees_the_slot() {
        let devices = FakeDevices::default();
        devices.deny.store(true, Ordering::SeqCst);
        let media = LocalMediaController::new(devices.clone());

        assert_eq!(
            media.acquire(CallId::new(), CallKind::Audio).await.unwrap_err(),
            MediaError::AccessDenied
        );
        assert!(media.owner().is_none());

        devices.deny.store(false, Ordering::SeqCst);
        assert!(media.acquire(CallId::new(), CallKind::Audio).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn release_during_acquisition_cancels() {
        let devices = FakeDevices::default();
        devices.delay_ms.store(500, Ordering::SeqCst);
        let media = Arc::new(LocalMediaController::new(devices.clone()));
        let owner = CallId::new();

        let pending = tokio::spawn({
            let media = Arc::clone(&media);
            async move { media.acquire(owner, CallKind::Video).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(media.owner(), Some(owner));
        assert!(media.release(owner));

        assert_eq!(pending.await.unwrap().unwrap_err(), MediaError::Cancelled);
        assert!(devices.all_stopped());
        assert!(media.owner().is_none());
    }

    #[tokio::test]
    async fn toggles_flip_track_flags() {
        let media = LocalMediaController::new(FakeDevices::default());
        let tracks = media.acquire(CallId::new(), CallKind::Video).await.unwrap();
        let audio = tracks.iter().find(|t| t.kind == TrackKind::Audio).unwrap();
        let video = tracks.iter().find(|t| t.kind == TrackKind::Video).unwrap();

        assert_eq!(media.toggle_mute(), Ok(true));
        assert!(!audio.is_enabled());
        assert_eq!(media.toggle_mute(), Ok(false));
        assert!(audio.is_enabled());

        assert_eq!(media.toggle_video(), Ok(false));
        assert!(!video.is_enabled());
        assert!(!media.state().unwrap().video_enabled);
    }

    #[tokio::test]
    async fn screen_share_round_trip() {
        let devices = FakeDevices::default();
        let media = LocalMediaController::new(devices.clone());
        assert_eq!(media.start_screen_share().await.unwrap_err(), MediaError::NotHeld);

        media.acquire(CallId::new(), CallKind::Video).await.unwrap();
        let screen = media.start_screen_share().await.unwrap();
        assert_eq!(screen.kind, TrackKind::Screen);
        assert!(media.state().unwrap().screen_sharing);
        assert_eq!(media.start_screen_share().await.unwrap_err(), MediaError::Busy);

        let camera = media.stop_screen_share().unwrap().unwrap();
        assert_eq!(camera.kind, TrackKind::Video);
        assert!(!screen.is_live());
        assert!(!media.state().unwrap().screen_sharing);
    }
}
