//! Continuous recording of the mirror into an encoder-backed file.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{CaptureError, Result};
use crate::interface::platform::{Encoder, EncoderFactory, EncoderSettings};
use crate::resource::screen::{DisplayMirror, Geometry, SinkKind};

pub mod ffmpeg;
pub mod output;

pub use output::OutputNaming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Preparing,
    Recording,
    Failed,
}

/// A finalized recording. Ownership of the file passes to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingArtifact {
    path: PathBuf,
}

impl RecordingArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

impl Display for RecordingArtifact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Encoder parameters for a recording of `geometry`.
pub fn encoder_settings(output: PathBuf, geometry: Geometry, frame_rate: u32, bitrate_factor: u32) -> EncoderSettings {
    EncoderSettings {
        output,
        width: geometry.width,
        height: geometry.height,
        frame_rate,
        bit_rate: bitrate_factor as u64 * geometry.pixel_count(),
    }
}

struct ActiveRecording {
    encoder: Box<dyn Encoder>,
    file: PathBuf,
}

pub struct RecordingPipeline {
    enabled: bool,
    encoders: Box<dyn EncoderFactory>,
    naming: OutputNaming,
    frame_rate: u32,
    bitrate_factor: u32,
    state: RecorderState,
    active: Option<ActiveRecording>,
}

impl RecordingPipeline {
    pub fn new(
        encoders: Box<dyn EncoderFactory>,
        output_dir: PathBuf,
        file_prefix: &str,
        frame_rate: u32,
        bitrate_factor: u32,
    ) -> Self {
        let naming = OutputNaming::new(output_dir, file_prefix, encoders.container_extension());
        Self {
            enabled: false,
            encoders,
            naming,
            frame_rate,
            bitrate_factor,
            state: RecorderState::Idle,
            active: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.file.as_path())
    }

    pub fn naming(&self) -> &OutputNaming {
        &self.naming
    }

    fn transition(&mut self, next: RecorderState) {
        log::debug!(from:? = self.state, to:? = next; "Recorder state change");
        self.state = next;
    }

    /// Begin recording the mirror. Already recording is a silent no-op.
    pub fn start(&mut self, mirror: &mut DisplayMirror, geometry: Geometry) -> Result<()> {
        if !self.enabled {
            return Err(CaptureError::NotEnabled);
        }
        if self.state == RecorderState::Recording {
            log::debug!("Recording already in progress; start ignored");
            return Ok(());
        }

        self.transition(RecorderState::Preparing);
        match self.prepare(mirror, geometry) {
            Ok(active) => {
                log::info!(file:? = active.file; "Recording started");
                self.active = Some(active);
                self.transition(RecorderState::Recording);
                Ok(())
            }
            Err(reason) => {
                self.transition(RecorderState::Failed);
                log::error!(reason = reason.as_str(); "Recording setup failed");
                self.transition(RecorderState::Idle);
                Err(CaptureError::RecordingSetupFailed(reason))
            }
        }
    }

    /// Build a fresh encoder and point the mirror's recorder sink at it.
    /// Anything allocated before a failure is released here.
    fn prepare(&mut self, mirror: &mut DisplayMirror, geometry: Geometry) -> std::result::Result<ActiveRecording, String> {
        std::fs::create_dir_all(self.naming.dir())
            .map_err(|e| format!("Failed to create output dir '{:?}': {e}", self.naming.dir()))?;

        let file = self.naming.next_path();
        let settings = encoder_settings(file.clone(), geometry, self.frame_rate, self.bitrate_factor);

        let mut encoder = self
            .encoders
            .create(&settings)
            .map_err(|e| format!("create encoder: {e}"))?;

        let surface = match encoder.prepare() {
            Ok(surface) => surface,
            Err(e) => {
                encoder.release();
                return Err(format!("prepare encoder: {e}"));
            }
        };

        if let Err(e) = mirror.rebind_sink(SinkKind::Recorder, surface) {
            encoder.release();
            return Err(format!("bind recorder sink: {e}"));
        }

        if let Err(e) = encoder.start() {
            mirror.detach_sink(SinkKind::Recorder);
            encoder.release();
            return Err(format!("start encoder: {e}"));
        }

        Ok(ActiveRecording { encoder, file })
    }

    /// Stop and finalize the current recording.
    ///
    /// The recorder sink is detached before the encoder stops so the mirror
    /// never posts into a finalized encoder. The encoder is released either way.
    pub fn stop(&mut self, mirror: &mut DisplayMirror) -> Result<RecordingArtifact> {
        let Some(mut active) = self.active.take() else {
            return Err(CaptureError::NotRecording);
        };

        mirror.detach_sink(SinkKind::Recorder);
        let finalized = active.encoder.stop();
        active.encoder.release();
        self.transition(RecorderState::Idle);

        match finalized {
            Ok(()) => {
                log::info!(file:? = active.file; "Recording finalized");
                Ok(RecordingArtifact { path: active.file })
            }
            Err(e) => Err(CaptureError::RecordingFinalizeFailed {
                path: active.file,
                reason: e.to_string(),
            }),
        }
    }
}

impl Drop for RecordingPipeline {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.encoder.stop() {
                log::warn!(err:display = e; "Failed to finalize recording on drop");
            }
            active.encoder.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::platform::AuthorizationGrant;
    use crate::resource::screen::loopback::{LoopbackEvent, LoopbackPlatform};

    const GEOMETRY: Geometry = Geometry::new(16, 8, 160);

    fn setup(dir: &Path) -> (RecordingPipeline, DisplayMirror, crate::resource::screen::loopback::LoopbackController) {
        let (mut platform, controller) = LoopbackPlatform::new(GEOMETRY);
        let mirror = DisplayMirror::create(
            &mut platform,
            AuthorizationGrant::granted("tok", GEOMETRY),
            GEOMETRY,
            Vec::new(),
        )
        .unwrap();
        let mut pipeline = RecordingPipeline::new(
            Box::new(controller.encoder_factory()),
            dir.to_path_buf(),
            "Clip",
            30,
            5,
        );
        pipeline.set_enabled(true);
        (pipeline, mirror, controller)
    }

    #[test]
    fn test_bitrate_scales_with_resolution() {
        let settings = encoder_settings(PathBuf::from("a.mp4"), Geometry::new(1080, 1920, 420), 30, 5);
        assert_eq!(settings.bit_rate, 10_368_000);
        assert_eq!(settings.frame_rate, 30);
    }

    #[test]
    fn test_disabled_start_is_not_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut mirror, _controller) = setup(dir.path());
        pipeline.set_enabled(false);
        assert!(matches!(pipeline.start(&mut mirror, GEOMETRY), Err(CaptureError::NotEnabled)));
        assert_eq!(pipeline.state(), RecorderState::Idle);
    }

    #[test]
    fn test_stop_while_idle_is_not_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut mirror, _controller) = setup(dir.path());
        assert!(matches!(pipeline.stop(&mut mirror), Err(CaptureError::NotRecording)));
        assert_eq!(pipeline.state(), RecorderState::Idle);
    }

    #[test]
    fn test_record_cycle_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut mirror, controller) = setup(dir.path());

        pipeline.start(&mut mirror, GEOMETRY).unwrap();
        assert!(pipeline.is_recording());
        assert!(mirror.has_sink(SinkKind::Recorder));
        controller.emit_frame();
        controller.emit_frame();

        let artifact = pipeline.stop(&mut mirror).unwrap();
        assert!(!mirror.has_sink(SinkKind::Recorder));
        assert_eq!(pipeline.state(), RecorderState::Idle);

        let name = artifact.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Clip_") && name.ends_with(".rgba"), "{name}");
        let len = std::fs::metadata(artifact.path()).unwrap().len();
        assert_eq!(len, 2 * 16 * 8 * 4);
        assert!(controller.events().contains(&LoopbackEvent::EncoderStopped { frames: 2 }));
    }

    #[test]
    fn test_second_start_reuses_display_with_fresh_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut mirror, controller) = setup(dir.path());

        pipeline.start(&mut mirror, GEOMETRY).unwrap();
        pipeline.start(&mut mirror, GEOMETRY).unwrap();
        pipeline.stop(&mut mirror).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        pipeline.start(&mut mirror, GEOMETRY).unwrap();
        pipeline.stop(&mut mirror).unwrap();

        let events = controller.events();
        let created = events
            .iter()
            .filter(|e| matches!(e, LoopbackEvent::DisplayCreated(_)))
            .count();
        let prepared = events
            .iter()
            .filter(|e| matches!(e, LoopbackEvent::EncoderPrepared(_)))
            .count();
        assert_eq!(created, 1);
        assert_eq!(prepared, 2);
    }

    #[test]
    fn test_setup_failure_releases_and_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, mut mirror, controller) = setup(dir.path());
        controller.fail_next_encoder();

        let err = pipeline.start(&mut mirror, GEOMETRY).unwrap_err();
        assert!(matches!(err, CaptureError::RecordingSetupFailed(_)));
        assert_eq!(pipeline.state(), RecorderState::Idle);
        assert!(!mirror.has_sink(SinkKind::Recorder));

        // No automatic retry, but a manual one works.
        pipeline.start(&mut mirror, GEOMETRY).unwrap();
        assert!(pipeline.is_recording());
    }
}
