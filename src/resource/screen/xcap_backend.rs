//! Desktop mirroring backend using the xcap library.
//!
//! Each platform display runs a pump thread that grabs the configured monitor
//! at the session frame rate. Recordings go through the ffmpeg encoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xcap::Monitor;

use crate::config::CaptureConfig;
use crate::error::PlatformError;
use crate::interface::platform::{
    AuthorizationGrant, Backend, BackendMetadata, MirrorPlatform, Projection, Surface, VirtualDisplay,
};
use crate::resource::recorder::ffmpeg::FfmpegEncoderFactory;

use super::pump::PumpedDisplay;
use super::{Geometry, RawBuffer};

const BASE_DPI: f32 = 96.0;

fn monitor_at(index: usize) -> Result<Monitor, PlatformError> {
    let monitors = Monitor::all().map_err(|e| PlatformError::failed("Monitor::all", e.to_string()))?;
    monitors
        .into_iter()
        .nth(index)
        .ok_or_else(|| PlatformError::Unavailable(format!("monitor index {index} out of range")))
}

/// Grab one frame from monitor `index`, scaled to `geometry` if needed.
fn grab(index: usize, geometry: Geometry) -> Option<RawBuffer> {
    let monitor = monitor_at(index).ok()?;
    let image = match monitor.capture_image() {
        Ok(image) => image,
        Err(e) => {
            log::debug!(err:display = e; "Monitor capture failed");
            return None;
        }
    };

    let image = if image.width() != geometry.width || image.height() != geometry.height {
        image::imageops::resize(
            &image,
            geometry.width.max(1),
            geometry.height.max(1),
            image::imageops::FilterType::Nearest,
        )
    } else {
        image
    };

    let (width, height) = image.dimensions();
    Some(RawBuffer::packed(width, height, image.into_raw()))
}

// ============================================================================
// Platform
// ============================================================================

pub struct XcapPlatform {
    monitor_index: usize,
    frame_interval: Duration,
}

impl XcapPlatform {
    pub fn new(monitor_index: usize, frame_rate: u32) -> Self {
        Self {
            monitor_index,
            frame_interval: Duration::from_secs(1) / frame_rate.max(1),
        }
    }
}

impl MirrorPlatform for XcapPlatform {
    fn project(&mut self, _grant: &AuthorizationGrant) -> Result<Box<dyn Projection>, PlatformError> {
        // Desktop capture has no OS-side consent token; the grant was checked
        // by the caller and only the monitor needs to exist.
        monitor_at(self.monitor_index)?;
        Ok(Box::new(XcapProjection {
            monitor_index: self.monitor_index,
            frame_interval: self.frame_interval,
            stopped: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn primary_geometry(&self) -> Option<Geometry> {
        let monitor = monitor_at(self.monitor_index).ok()?;
        let width = monitor.width().ok()?;
        let height = monitor.height().ok()?;
        let scale = monitor.scale_factor().unwrap_or(1.0);
        Some(Geometry::new(width, height, (BASE_DPI * scale).round() as u32))
    }
}

struct XcapProjection {
    monitor_index: usize,
    frame_interval: Duration,
    stopped: Arc<AtomicBool>,
}

impl Projection for XcapProjection {
    fn create_display(
        &mut self,
        name: &str,
        geometry: Geometry,
        surface: Surface,
    ) -> Result<Box<dyn VirtualDisplay>, PlatformError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PlatformError::Unavailable("projection stopped".to_string()));
        }

        let index = self.monitor_index;
        let stopped = Arc::clone(&self.stopped);
        let source = move || {
            if stopped.load(Ordering::Acquire) {
                return None;
            }
            grab(index, geometry)
        };

        let display = PumpedDisplay::spawn(name, self.frame_interval, surface, source)
            .map_err(|e| PlatformError::failed("spawn pump", e.to_string()))?;
        Ok(Box::new(display))
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}

// ============================================================================
// Registration
// ============================================================================

fn create_backend(config: &CaptureConfig) -> Result<Backend, PlatformError> {
    Ok(Backend {
        platform: Box::new(XcapPlatform::new(config.monitor_index, config.frame_rate)),
        encoders: Box::new(FfmpegEncoderFactory::new(config.ffmpeg_path.clone())),
    })
}

inventory::submit!(BackendMetadata {
    id: "xcap",
    name: "Desktop monitor (xcap + ffmpeg)",
    factory: create_backend,
});
