//! In-process mirroring backend.
//!
//! Displays produce a synthetic test pattern, either when the host calls
//! [`LoopbackController::emit_frame`] or on a pump thread at a fixed rate.
//! Every platform call is recorded as a [`LoopbackEvent`] and failures can be
//! injected, which makes this backend the harness for session tests.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::CaptureConfig;
use crate::error::PlatformError;
use crate::interface::platform::{
    AuthorizationGrant, Backend, BackendMetadata, Encoder, EncoderFactory, EncoderSettings,
    MirrorPlatform, Projection, Surface, SurfaceSink, VirtualDisplay,
};

use super::pump::PumpedDisplay;
use super::{Geometry, PixelFormat, RawBuffer};

/// Default loopback "screen": a 1080x1920 phone panel.
pub const LOOPBACK_GEOMETRY: Geometry = Geometry::new(1080, 1920, 420);

/// Row alignment of synthetic buffers, in bytes.
const ROW_ALIGNMENT: usize = 64;

const PADDING_BYTE: u8 = 0xAB;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackEvent {
    ProjectionStarted,
    DisplayCreated(String),
    SurfaceAttached(String),
    SurfaceDetached(String),
    DisplayReleased(String),
    ProjectionStopped,
    EncoderPrepared(PathBuf),
    EncoderStarted,
    EncoderStopped { frames: u64 },
    EncoderReleased,
}

// ============================================================================
// Shared State
// ============================================================================

struct DisplaySlot {
    name: String,
    geometry: Geometry,
    surface: Mutex<Option<Surface>>,
    released: AtomicBool,
}

#[derive(Default)]
struct LoopbackState {
    displays: Mutex<Vec<Arc<DisplaySlot>>>,
    events: Mutex<Vec<LoopbackEvent>>,
    projection_active: AtomicBool,
    revoked: AtomicBool,
    refuse_next: Mutex<Option<PlatformError>>,
    fail_next_encoder: AtomicBool,
    sequence: AtomicU64,
}

impl LoopbackState {
    fn record(&self, event: LoopbackEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// Synthetic RGBA frame with 64-byte aligned rows. Pixel `(x, y)` holds
/// `[x, y, seq, 255]` truncated to bytes; padding bytes are `0xAB`.
pub fn synthetic_frame(geometry: Geometry, seq: u64) -> RawBuffer {
    let pixel_stride = PixelFormat::Rgba8888.bytes_per_pixel();
    let visible = pixel_stride * geometry.width as usize;
    let row_stride = visible.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT;

    let mut data = vec![PADDING_BYTE; row_stride * geometry.height as usize];
    for (y, row) in data.chunks_exact_mut(row_stride).enumerate() {
        for (x, px) in row[..visible].chunks_exact_mut(pixel_stride).enumerate() {
            px.copy_from_slice(&[x as u8, y as u8, seq as u8, 255]);
        }
    }

    RawBuffer {
        width: geometry.width,
        height: geometry.height,
        pixel_stride,
        row_stride,
        format: PixelFormat::Rgba8888,
        data,
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Test-side handle onto a [`LoopbackPlatform`].
#[derive(Clone)]
pub struct LoopbackController {
    state: Arc<LoopbackState>,
}

impl LoopbackController {
    /// Post one synthetic frame to every attached display surface.
    /// Returns how many surfaces received it.
    pub fn emit_frame(&self) -> usize {
        let targets: Vec<(Geometry, Surface)> = match self.state.displays.lock() {
            Ok(displays) => displays
                .iter()
                .filter(|slot| !slot.released.load(Ordering::Acquire))
                .filter_map(|slot| {
                    let surface = slot.surface.lock().ok()?.clone()?;
                    Some((slot.geometry, surface))
                })
                .collect(),
            Err(_) => return 0,
        };

        let seq = self.state.next_sequence();
        for (geometry, surface) in &targets {
            surface.post(&synthetic_frame(*geometry, seq));
        }
        targets.len()
    }

    /// Withdraw the authorization of the live projection.
    pub fn revoke(&self) {
        self.state.revoked.store(true, Ordering::Release);
    }

    /// Make the next `project` call fail with `err`.
    pub fn refuse_next_projection(&self, err: PlatformError) {
        if let Ok(mut slot) = self.state.refuse_next.lock() {
            *slot = Some(err);
        }
    }

    /// Make the next encoder fail in `prepare`.
    pub fn fail_next_encoder(&self) {
        self.state.fail_next_encoder.store(true, Ordering::Release);
    }

    pub fn projection_active(&self) -> bool {
        self.state.projection_active.load(Ordering::Acquire)
    }

    /// Displays created and not yet released.
    pub fn live_displays(&self) -> usize {
        self.state
            .displays
            .lock()
            .map(|displays| displays.len())
            .unwrap_or(0)
    }

    pub fn events(&self) -> Vec<LoopbackEvent> {
        self.state
            .events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.state.events.lock() {
            events.clear();
        }
    }

    pub fn encoder_factory(&self) -> LoopbackEncoderFactory {
        LoopbackEncoderFactory {
            state: Arc::clone(&self.state),
        }
    }
}

// ============================================================================
// Platform
// ============================================================================

pub struct LoopbackPlatform {
    state: Arc<LoopbackState>,
    geometry: Geometry,
    frame_interval: Option<Duration>,
}

impl LoopbackPlatform {
    /// Platform whose displays only produce on `emit_frame`.
    pub fn new(geometry: Geometry) -> (Self, LoopbackController) {
        Self::build(geometry, None)
    }

    /// Platform whose displays produce `frame_rate` frames per second on their own.
    pub fn with_frame_rate(geometry: Geometry, frame_rate: u32) -> (Self, LoopbackController) {
        let interval = Duration::from_secs(1) / frame_rate.max(1);
        Self::build(geometry, Some(interval))
    }

    fn build(geometry: Geometry, frame_interval: Option<Duration>) -> (Self, LoopbackController) {
        let state = Arc::new(LoopbackState::default());
        let controller = LoopbackController {
            state: Arc::clone(&state),
        };
        (
            Self {
                state,
                geometry,
                frame_interval,
            },
            controller,
        )
    }
}

impl MirrorPlatform for LoopbackPlatform {
    fn project(&mut self, _grant: &AuthorizationGrant) -> Result<Box<dyn Projection>, PlatformError> {
        if let Some(err) = self.state.refuse_next.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(err);
        }
        if self.state.projection_active.swap(true, Ordering::AcqRel) {
            return Err(PlatformError::Unavailable("projection already active".to_string()));
        }

        self.state.revoked.store(false, Ordering::Release);
        self.state.record(LoopbackEvent::ProjectionStarted);
        Ok(Box::new(LoopbackProjection {
            state: Arc::clone(&self.state),
            frame_interval: self.frame_interval,
            stopped: false,
        }))
    }

    fn primary_geometry(&self) -> Option<Geometry> {
        Some(self.geometry)
    }
}

struct LoopbackProjection {
    state: Arc<LoopbackState>,
    frame_interval: Option<Duration>,
    stopped: bool,
}

impl Projection for LoopbackProjection {
    fn create_display(
        &mut self,
        name: &str,
        geometry: Geometry,
        surface: Surface,
    ) -> Result<Box<dyn VirtualDisplay>, PlatformError> {
        if self.stopped {
            return Err(PlatformError::Unavailable("projection stopped".to_string()));
        }
        if self.state.revoked.load(Ordering::Acquire) {
            return Err(PlatformError::Revoked);
        }

        let slot = Arc::new(DisplaySlot {
            name: name.to_string(),
            geometry,
            surface: Mutex::new(Some(Arc::clone(&surface))),
            released: AtomicBool::new(false),
        });

        let pump = match self.frame_interval {
            Some(interval) => {
                let state = Arc::clone(&self.state);
                let source = move || Some(synthetic_frame(geometry, state.next_sequence()));
                let pump = PumpedDisplay::spawn(name, interval, surface, source)
                    .map_err(|e| PlatformError::failed("spawn pump", e.to_string()))?;
                Some(pump)
            }
            None => None,
        };

        if let Ok(mut displays) = self.state.displays.lock() {
            displays.push(Arc::clone(&slot));
        }
        self.state.record(LoopbackEvent::DisplayCreated(name.to_string()));

        Ok(Box::new(LoopbackDisplay {
            state: Arc::clone(&self.state),
            slot,
            pump,
        }))
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.state.projection_active.store(false, Ordering::Release);
        self.state.record(LoopbackEvent::ProjectionStopped);
    }

    fn is_revoked(&self) -> bool {
        self.state.revoked.load(Ordering::Acquire)
    }
}

impl Drop for LoopbackProjection {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopbackDisplay {
    state: Arc<LoopbackState>,
    slot: Arc<DisplaySlot>,
    pump: Option<PumpedDisplay>,
}

impl VirtualDisplay for LoopbackDisplay {
    fn set_surface(&mut self, surface: Option<Surface>) {
        let event = match surface {
            Some(_) => LoopbackEvent::SurfaceAttached(self.slot.name.clone()),
            None => LoopbackEvent::SurfaceDetached(self.slot.name.clone()),
        };
        if let Some(pump) = self.pump.as_mut() {
            pump.set_surface(surface.clone());
        }
        if let Ok(mut current) = self.slot.surface.lock() {
            *current = surface;
        }
        self.state.record(event);
    }

    fn release(&mut self) {
        if self.slot.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut pump) = self.pump.take() {
            pump.release();
        }
        if let Ok(mut current) = self.slot.surface.lock() {
            *current = None;
        }
        if let Ok(mut displays) = self.state.displays.lock() {
            displays.retain(|slot| !Arc::ptr_eq(slot, &self.slot));
        }
        self.state.record(LoopbackEvent::DisplayReleased(self.slot.name.clone()));
    }
}

impl Drop for LoopbackDisplay {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Raw stream encoder
// ============================================================================

/// Encoder that appends tightly packed RGBA frames to the output file.
///
/// Posted frames go through a bounded channel to a writer thread, so the
/// mirror's producer never waits on disk I/O.
pub struct LoopbackEncoderFactory {
    state: Arc<LoopbackState>,
}

impl EncoderFactory for LoopbackEncoderFactory {
    fn container_extension(&self) -> &'static str {
        "rgba"
    }

    fn create(&mut self, settings: &EncoderSettings) -> Result<Box<dyn Encoder>, PlatformError> {
        Ok(Box::new(RawStreamEncoder {
            state: Arc::clone(&self.state),
            settings: settings.clone(),
            surface: None,
            writer: None,
        }))
    }
}

struct RawStreamSurface {
    width: u32,
    height: u32,
    tx: Mutex<Option<flume::Sender<Vec<u8>>>>,
    recording: AtomicBool,
    short_frame: AtomicBool,
}

impl SurfaceSink for RawStreamSurface {
    fn post(&self, buffer: &RawBuffer) {
        if !self.recording.load(Ordering::Acquire)
            || buffer.width != self.width
            || buffer.height != self.height
        {
            return;
        }

        let packed = buffer.to_packed();
        if packed.len() != buffer.pixel_stride * buffer.width as usize * buffer.height as usize {
            self.short_frame.store(true, Ordering::Release);
            return;
        }

        let Ok(tx) = self.tx.lock() else {
            return;
        };
        if let Some(tx) = tx.as_ref() {
            // Writer is behind; drop the frame.
            let _ = tx.try_send(packed);
        }
    }
}

struct RawStreamEncoder {
    state: Arc<LoopbackState>,
    settings: EncoderSettings,
    surface: Option<Arc<RawStreamSurface>>,
    writer: Option<JoinHandle<std::io::Result<u64>>>,
}

impl RawStreamEncoder {
    /// Stop accepting frames and wait for the writer to drain.
    fn close_input(&mut self) -> Result<u64, PlatformError> {
        if let Some(surface) = self.surface.as_ref() {
            surface.recording.store(false, Ordering::Release);
            if let Ok(mut tx) = surface.tx.lock() {
                tx.take();
            }
        }
        match self.writer.take() {
            Some(writer) => match writer.join() {
                Ok(Ok(frames)) => Ok(frames),
                Ok(Err(e)) => Err(PlatformError::failed("finalize", e.to_string())),
                Err(_) => Err(PlatformError::failed("finalize", "writer thread panicked")),
            },
            None => Ok(0),
        }
    }
}

impl Encoder for RawStreamEncoder {
    fn prepare(&mut self) -> Result<Surface, PlatformError> {
        if self.state.fail_next_encoder.swap(false, Ordering::AcqRel) {
            return Err(PlatformError::failed("prepare", "injected encoder failure"));
        }

        let file = File::create(&self.settings.output)
            .map_err(|e| PlatformError::failed("create output", e.to_string()))?;

        let (tx, rx) = flume::bounded::<Vec<u8>>(self.settings.frame_rate.max(1) as usize);
        let writer = thread::Builder::new()
            .name("loopback-writer".to_string())
            .spawn(move || -> std::io::Result<u64> {
                let mut out = BufWriter::new(file);
                let mut frames = 0;
                for frame in rx.iter() {
                    out.write_all(&frame)?;
                    frames += 1;
                }
                out.flush()?;
                Ok(frames)
            })
            .map_err(|e| PlatformError::failed("spawn writer", e.to_string()))?;

        let surface = Arc::new(RawStreamSurface {
            width: self.settings.width,
            height: self.settings.height,
            tx: Mutex::new(Some(tx)),
            recording: AtomicBool::new(false),
            short_frame: AtomicBool::new(false),
        });
        self.surface = Some(Arc::clone(&surface));
        self.writer = Some(writer);
        self.state
            .record(LoopbackEvent::EncoderPrepared(self.settings.output.clone()));
        Ok(surface)
    }

    fn start(&mut self) -> Result<(), PlatformError> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| PlatformError::failed("start", "encoder not prepared"))?;
        surface.recording.store(true, Ordering::Release);
        self.state.record(LoopbackEvent::EncoderStarted);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlatformError> {
        if self.surface.is_none() {
            return Err(PlatformError::failed("stop", "encoder not prepared"));
        }
        let frames = self.close_input()?;
        if self
            .surface
            .as_ref()
            .is_some_and(|surface| surface.short_frame.load(Ordering::Acquire))
        {
            return Err(PlatformError::failed("finalize", "short frame buffer"));
        }

        self.state.record(LoopbackEvent::EncoderStopped { frames });
        Ok(())
    }

    fn release(&mut self) {
        if let Err(e) = self.close_input() {
            log::warn!(err:display = e; "Loopback writer failed during release");
        }
        if self.surface.take().is_some() {
            self.state.record(LoopbackEvent::EncoderReleased);
        }
    }
}

impl Drop for RawStreamEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Registration
// ============================================================================

fn create_backend(config: &CaptureConfig) -> Result<Backend, PlatformError> {
    let (platform, controller) = LoopbackPlatform::with_frame_rate(LOOPBACK_GEOMETRY, config.frame_rate);
    Ok(Backend {
        platform: Box::new(platform),
        encoders: Box::new(controller.encoder_factory()),
    })
}

inventory::submit!(BackendMetadata {
    id: "loopback",
    name: "In-process loopback",
    factory: create_backend,
});
