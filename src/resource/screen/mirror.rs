use std::collections::HashMap;

use serde::Serialize;

use crate::error::{CaptureError, Result};
use crate::interface::platform::{AuthorizationGrant, MirrorPlatform, Projection, Surface, VirtualDisplay};

use super::Geometry;

/// Which pipeline a mirror output feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SinkKind {
    FrameQueue,
    Recorder,
}

impl SinkKind {
    /// Name given to the platform display backing this sink.
    pub fn display_name(&self) -> &'static str {
        match self {
            SinkKind::FrameQueue => "ScreenCapture",
            SinkKind::Recorder => "ScreenRecorder",
        }
    }
}

struct BoundDisplay {
    display: Box<dyn VirtualDisplay>,
    attached: bool,
}

/// The single authorized mirroring handle of a session.
///
/// Each sink kind gets its own platform display so sinks can be attached,
/// swapped and released without disturbing each other.
pub struct DisplayMirror {
    projection: Box<dyn Projection>,
    geometry: Geometry,
    displays: HashMap<SinkKind, BoundDisplay>,
    stopped: bool,
}

impl DisplayMirror {
    /// Project `grant` and bind the initial sinks (zero, one or two).
    pub fn create(
        platform: &mut dyn MirrorPlatform,
        grant: AuthorizationGrant,
        geometry: Geometry,
        sinks: Vec<(SinkKind, Surface)>,
    ) -> Result<Self> {
        if !grant.is_affirmative() {
            return Err(CaptureError::AuthorizationInvalid);
        }
        if geometry.is_empty() {
            return Err(CaptureError::MirrorUnavailable(format!(
                "empty display geometry {geometry}"
            )));
        }

        let projection = platform.project(&grant)?;
        // The grant is spent from here on.
        drop(grant);

        let mut mirror = Self {
            projection,
            geometry,
            displays: HashMap::new(),
            stopped: false,
        };

        for (kind, surface) in sinks {
            if let Err(err) = mirror.rebind_sink(kind, surface) {
                mirror.stop();
                return Err(err);
            }
        }

        log::info!(geometry:display = geometry; "Display mirror created");
        Ok(mirror)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_revoked(&self) -> bool {
        !self.stopped && self.projection.is_revoked()
    }

    /// True while at least one sink is receiving frames.
    pub fn is_streaming(&self) -> bool {
        self.displays.values().any(|bound| bound.attached)
    }

    pub fn has_sink(&self, kind: SinkKind) -> bool {
        self.displays.get(&kind).is_some_and(|bound| bound.attached)
    }

    /// Attached sinks, in a stable order.
    pub fn bound_sinks(&self) -> Vec<SinkKind> {
        let mut kinds: Vec<SinkKind> = self
            .displays
            .iter()
            .filter(|(_, bound)| bound.attached)
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    /// Point `kind` at `surface`. An existing display for that kind is reused so
    /// other sinks keep streaming; otherwise a display is created.
    pub fn rebind_sink(&mut self, kind: SinkKind, surface: Surface) -> Result<()> {
        if self.stopped {
            return Err(CaptureError::MirrorUnavailable("mirror already stopped".to_string()));
        }

        if let Some(bound) = self.displays.get_mut(&kind) {
            bound.display.set_surface(Some(surface));
            bound.attached = true;
            log::debug!(sink:? = kind; "Rebound mirror sink");
            return Ok(());
        }

        let display = self
            .projection
            .create_display(kind.display_name(), self.geometry, surface)?;
        self.displays.insert(
            kind,
            BoundDisplay {
                display,
                attached: true,
            },
        );
        log::debug!(sink:? = kind; "Created mirror sink display");
        Ok(())
    }

    /// Stop feeding `kind` but keep its display for a later rebind.
    pub fn detach_sink(&mut self, kind: SinkKind) {
        if let Some(bound) = self.displays.get_mut(&kind) {
            if bound.attached {
                bound.display.set_surface(None);
                bound.attached = false;
            }
        }
    }

    /// Release the display behind `kind`.
    pub fn release_sink(&mut self, kind: SinkKind) {
        if let Some(mut bound) = self.displays.remove(&kind) {
            bound.display.set_surface(None);
            bound.display.release();
            log::debug!(sink:? = kind; "Released mirror sink display");
        }
    }

    /// Release every display, then stop the projection. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }

        let mut kinds: Vec<SinkKind> = self.displays.keys().copied().collect();
        kinds.sort();
        for kind in kinds {
            self.release_sink(kind);
        }

        self.projection.stop();
        self.stopped = true;
        log::info!("Display mirror stopped");
    }
}

impl Drop for DisplayMirror {
    fn drop(&mut self) {
        self.stop();
    }
}
