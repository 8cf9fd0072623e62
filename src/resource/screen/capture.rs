use crate::error::{CaptureError, Result};
use crate::interface::platform::Surface;

use super::frame::FrameBufferSource;
use super::mirror::{DisplayMirror, SinkKind};
use super::{Frame, Geometry};

/// On-demand still capture over the mirror's frame queue sink.
pub struct FrameCapturePipeline {
    enabled: bool,
    depth: usize,
    source: Option<FrameBufferSource>,
}

impl FrameCapturePipeline {
    pub fn new(depth: usize) -> Self {
        Self {
            enabled: false,
            depth,
            source: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_bound(&self) -> bool {
        self.source.is_some()
    }

    pub fn frames_received(&self) -> u64 {
        self.source.as_ref().map_or(0, FrameBufferSource::frames_received)
    }

    /// Allocate the frame queue and return its sink surface for the mirror.
    /// Reuses the queue if one is already allocated.
    pub fn prepare(&mut self, geometry: Geometry) -> Result<Surface> {
        if !self.enabled {
            return Err(CaptureError::NotEnabled);
        }
        let depth = self.depth;
        let source = self
            .source
            .get_or_insert_with(|| FrameBufferSource::new(geometry, depth));
        Ok(source.surface())
    }

    /// Allocate the frame queue and bind it to an existing mirror.
    pub fn enable(&mut self, mirror: &mut DisplayMirror, geometry: Geometry) -> Result<()> {
        let surface = self.prepare(geometry)?;
        if let Err(err) = mirror.rebind_sink(SinkKind::FrameQueue, surface) {
            self.release(None);
            return Err(err);
        }
        Ok(())
    }

    pub fn capture(&mut self) -> Result<Frame> {
        if !self.enabled {
            return Err(CaptureError::NotEnabled);
        }
        let source = self.source.as_mut().ok_or(CaptureError::NotBound)?;
        source.poll()
    }

    /// Unbind the sink from `mirror` (if given) and close the queue.
    pub fn release(&mut self, mirror: Option<&mut DisplayMirror>) {
        let Some(mut source) = self.source.take() else {
            return;
        };
        if let Some(mirror) = mirror {
            mirror.release_sink(SinkKind::FrameQueue);
        }
        source.close();
        log::debug!(frames = source.frames_received(); "Frame capture sink released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::platform::AuthorizationGrant;
    use crate::resource::screen::loopback::LoopbackPlatform;

    const GEOMETRY: Geometry = Geometry::new(8, 4, 160);

    #[test]
    fn test_disabled_pipeline_reports_not_enabled() {
        let mut pipeline = FrameCapturePipeline::new(2);
        assert!(matches!(pipeline.capture(), Err(CaptureError::NotEnabled)));
        assert!(matches!(pipeline.prepare(GEOMETRY), Err(CaptureError::NotEnabled)));
    }

    #[test]
    fn test_enabled_but_unbound_reports_not_bound() {
        let mut pipeline = FrameCapturePipeline::new(2);
        pipeline.set_enabled(true);
        assert!(matches!(pipeline.capture(), Err(CaptureError::NotBound)));
    }

    #[test]
    fn test_enable_on_existing_mirror() {
        let (mut platform, controller) = LoopbackPlatform::new(GEOMETRY);
        let grant = AuthorizationGrant::granted("tok", GEOMETRY);
        let mut mirror = DisplayMirror::create(&mut platform, grant, GEOMETRY, Vec::new()).unwrap();
        assert!(!mirror.is_streaming());

        let mut pipeline = FrameCapturePipeline::new(2);
        pipeline.set_enabled(true);
        pipeline.enable(&mut mirror, GEOMETRY).unwrap();
        assert!(mirror.has_sink(SinkKind::FrameQueue));

        assert!(matches!(pipeline.capture(), Err(CaptureError::NoFrameAvailable)));
        controller.emit_frame();
        let frame = pipeline.capture().unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 4));

        pipeline.release(Some(&mut mirror));
        assert!(!mirror.has_sink(SinkKind::FrameQueue));
        assert_eq!(controller.live_displays(), 0);
        assert!(matches!(pipeline.capture(), Err(CaptureError::NotBound)));
    }
}
