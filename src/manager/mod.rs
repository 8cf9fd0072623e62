pub mod inventory;

use std::path::PathBuf;

use serde::Serialize;

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::interface::platform::{AuthorizationGrant, Backend, ForegroundPresence, MirrorPlatform};
use crate::resource::recorder::{RecordingArtifact, RecordingPipeline};
use crate::resource::screen::{DisplayMirror, Frame, FrameCapturePipeline, Geometry, SinkKind};

/// Identifies one open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub id: u64,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Active,
}

/// Serializable snapshot of the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<u64>,
    pub geometry: Option<Geometry>,
    pub capture_enabled: bool,
    pub recording_enabled: bool,
    pub recording: bool,
    pub recording_file: Option<PathBuf>,
    pub bound_sinks: Vec<SinkKind>,
    pub frames_received: u64,
}

struct ActiveSession {
    id: u64,
    geometry: Geometry,
    mirror: DisplayMirror,
}

/// Owns the mirroring handle and multiplexes it between still capture and
/// recording.
///
/// All methods take `&mut self`: one logical owner drives a session. Only the
/// platform's buffer-arrival path runs on other threads.
pub struct CaptureSessionManager {
    platform: Box<dyn MirrorPlatform>,
    presence: Option<Box<dyn ForegroundPresence>>,
    capture: FrameCapturePipeline,
    recorder: RecordingPipeline,
    session: Option<ActiveSession>,
    next_session_id: u64,
}

impl CaptureSessionManager {
    pub fn new(backend: Backend, config: &CaptureConfig) -> Self {
        let Backend { platform, encoders } = backend;
        Self {
            platform,
            presence: None,
            capture: FrameCapturePipeline::new(config.buffer_depth),
            recorder: RecordingPipeline::new(
                encoders,
                config.movies_dir(),
                &config.file_prefix,
                config.frame_rate,
                config.bitrate_factor,
            ),
            session: None,
            next_session_id: 1,
        }
    }

    /// Build the manager over the backend named in `config`.
    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        let backend = inventory::create_backend(&config.backend, config)?;
        Ok(Self::new(backend, config))
    }

    pub fn with_presence(mut self, presence: Box<dyn ForegroundPresence>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Physical geometry of the platform's display, when known.
    pub fn primary_geometry(&self) -> Option<Geometry> {
        self.platform.primary_geometry()
    }

    pub fn state(&self) -> SessionState {
        if self.session.is_some() {
            SessionState::Active
        } else {
            SessionState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            session_id: self.session.as_ref().map(|s| s.id),
            geometry: self.session.as_ref().map(|s| s.geometry),
            capture_enabled: self.capture.is_enabled(),
            recording_enabled: self.recorder.is_enabled(),
            recording: self.recorder.is_recording(),
            recording_file: self.recorder.current_file().map(|p| p.to_path_buf()),
            bound_sinks: self
                .session
                .as_ref()
                .map(|s| s.mirror.bound_sinks())
                .unwrap_or_default(),
            frames_received: self.capture.frames_received(),
        }
    }

    fn notify_active(&self) {
        if let Some(presence) = self.presence.as_ref() {
            presence.session_active();
        }
    }

    fn notify_idle(&self) {
        if let Some(presence) = self.presence.as_ref() {
            presence.session_idle();
        }
    }

    /// Open a session over `grant`, consuming it.
    pub fn open(
        &mut self,
        grant: AuthorizationGrant,
        geometry: Geometry,
        want_capture: bool,
        want_recording: bool,
    ) -> Result<SessionHandle> {
        if self.session.is_some() {
            return Err(CaptureError::AlreadyOpen);
        }
        if !grant.is_affirmative() {
            log::warn!(status:? = grant.status(); "Refusing session without an affirmative grant");
            return Err(CaptureError::AuthorizationInvalid);
        }
        if !want_capture && !want_recording {
            // Neither pipeline could ever bind a sink to the mirror.
            log::warn!("Refusing session with no pipeline enabled");
            return Err(CaptureError::NotEnabled);
        }
        if grant.geometry() != geometry {
            log::warn!(
                granted:display = grant.geometry(),
                requested:display = geometry;
                "Session geometry differs from the consent geometry"
            );
        }

        // The platform may end capture without foreground presence.
        self.notify_active();

        self.capture.set_enabled(want_capture);
        self.recorder.set_enabled(want_recording);

        let mut sinks = Vec::new();
        if want_capture {
            match self.capture.prepare(geometry) {
                Ok(surface) => sinks.push((SinkKind::FrameQueue, surface)),
                Err(err) => {
                    self.abort_open();
                    return Err(err);
                }
            }
        }

        let mirror = match DisplayMirror::create(self.platform.as_mut(), grant, geometry, sinks) {
            Ok(mirror) => mirror,
            Err(err) => {
                log::error!(err:display = err; "Failed to create display mirror");
                self.abort_open();
                return Err(err);
            }
        };

        let id = self.next_session_id;
        self.next_session_id += 1;
        self.session = Some(ActiveSession { id, geometry, mirror });

        log::info!(
            session = id,
            geometry:display = geometry,
            capture = want_capture,
            recording = want_recording;
            "Capture session opened"
        );
        Ok(SessionHandle { id, geometry })
    }

    fn abort_open(&mut self) {
        self.capture.release(None);
        self.capture.set_enabled(false);
        self.recorder.set_enabled(false);
        self.notify_idle();
    }

    /// Tear the session down if the platform withdrew the authorization.
    fn check_authorization(&mut self) -> Result<()> {
        let revoked = self
            .session
            .as_ref()
            .is_some_and(|session| session.mirror.is_revoked());
        if revoked {
            log::warn!("Mirroring authorization lost; closing session");
            self.shutdown();
            return Err(CaptureError::AuthorizationInvalid);
        }
        Ok(())
    }

    /// Latest mirrored frame. Never blocks.
    pub fn capture(&mut self) -> Result<Frame> {
        self.check_authorization()?;
        if self.session.is_none() {
            return Err(CaptureError::NotBound);
        }
        self.capture.capture()
    }

    pub fn start_recording(&mut self) -> Result<()> {
        self.check_authorization()?;
        let Some(session) = self.session.as_mut() else {
            return Err(CaptureError::NotEnabled);
        };
        self.recorder.start(&mut session.mirror, session.geometry)
    }

    pub fn stop_recording(&mut self) -> Result<RecordingArtifact> {
        self.check_authorization()?;
        let Some(session) = self.session.as_mut() else {
            return Err(CaptureError::NotRecording);
        };
        self.recorder.stop(&mut session.mirror)
    }

    /// Release everything the session owns. Idempotent.
    ///
    /// Order: recording, frame capture sink and queue, mirror, presence.
    pub fn shutdown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if self.recorder.is_recording() {
            match self.recorder.stop(&mut session.mirror) {
                Ok(artifact) => {
                    log::info!(file:display = artifact; "Recording closed by shutdown; file left in place")
                }
                Err(err) => log::warn!(err:display = err; "Recording teardown failed"),
            }
        }

        self.capture.release(Some(&mut session.mirror));

        session.mirror.stop();

        self.notify_idle();

        self.capture.set_enabled(false);
        self.recorder.set_enabled(false);
        log::info!(session = session.id; "Capture session closed");
    }
}

impl Drop for CaptureSessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
