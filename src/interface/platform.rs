//! Seams between the session manager and the OS: mirroring, encoding, and the
//! foreground-presence requirement. Backends implement these traits and register
//! themselves through [`BackendMetadata`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;
use crate::error::PlatformError;
use crate::resource::screen::{Geometry, RawBuffer};

// ============================================================================
// Authorization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    Granted,
    Denied,
    Cancelled,
}

/// Result of one user-consent round. Not `Clone`: a grant is consumed by exactly
/// one `CaptureSessionManager::open`, and a new session needs a new consent round.
pub struct AuthorizationGrant {
    token: String,
    status: ConsentStatus,
    geometry: Geometry,
}

impl AuthorizationGrant {
    pub fn new(token: impl Into<String>, status: ConsentStatus, geometry: Geometry) -> Self {
        Self {
            token: token.into(),
            status,
            geometry,
        }
    }

    pub fn granted(token: impl Into<String>, geometry: Geometry) -> Self {
        Self::new(token, ConsentStatus::Granted, geometry)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn status(&self) -> ConsentStatus {
        self.status
    }

    /// Geometry the consent flow observed for the physical display.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn is_affirmative(&self) -> bool {
        self.status == ConsentStatus::Granted && !self.token.trim().is_empty()
    }
}

impl fmt::Debug for AuthorizationGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationGrant")
            .field("token", &"<redacted>")
            .field("status", &self.status)
            .field("geometry", &self.geometry)
            .finish()
    }
}

// ============================================================================
// Surfaces
// ============================================================================

/// A destination the mirror writes frames into.
///
/// `post` runs on the platform's producer thread. Implementations must return
/// promptly and never block on the consumer.
pub trait SurfaceSink: Send + Sync {
    fn post(&self, buffer: &RawBuffer);
}

pub type Surface = Arc<dyn SurfaceSink>;

// ============================================================================
// Mirroring
// ============================================================================

pub trait MirrorPlatform: Send {
    /// Turn an affirmative grant into a live projection.
    fn project(&mut self, grant: &AuthorizationGrant) -> Result<Box<dyn Projection>, PlatformError>;

    /// Physical geometry of the display this platform mirrors, if it knows it.
    fn primary_geometry(&self) -> Option<Geometry> {
        None
    }
}

/// The OS mirroring capability behind a `DisplayMirror`.
pub trait Projection: Send {
    fn create_display(
        &mut self,
        name: &str,
        geometry: Geometry,
        surface: Surface,
    ) -> Result<Box<dyn VirtualDisplay>, PlatformError>;

    /// Stop the projection. Displays created from it stop producing.
    fn stop(&mut self);

    /// True once the user or the OS has withdrawn the authorization.
    fn is_revoked(&self) -> bool {
        false
    }
}

pub trait VirtualDisplay: Send {
    /// Point the display at another surface, or at none.
    fn set_surface(&mut self, surface: Option<Surface>);
    fn release(&mut self);
}

// ============================================================================
// Encoding
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderSettings {
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Bits per second.
    pub bit_rate: u64,
}

pub trait EncoderFactory: Send {
    /// File extension of the container this factory's encoders produce.
    fn container_extension(&self) -> &'static str;

    fn create(&mut self, settings: &EncoderSettings) -> Result<Box<dyn Encoder>, PlatformError>;
}

/// A video encoder fed through an input surface. Encoders are single-use:
/// after `stop` only `release` may be called.
pub trait Encoder: Send {
    /// Allocate encoder resources and hand out the input surface.
    fn prepare(&mut self) -> Result<Surface, PlatformError>;
    fn start(&mut self) -> Result<(), PlatformError>;
    /// Stop encoding and finalize the container.
    fn stop(&mut self) -> Result<(), PlatformError>;
    fn release(&mut self);
}

// ============================================================================
// Foreground presence
// ============================================================================

/// Host hook that keeps the process eligible for capture (e.g. a foreground
/// notification). Calls are best-effort notifications.
pub trait ForegroundPresence: Send {
    fn session_active(&self);
    fn session_idle(&self);
}

// ============================================================================
// Backend registry
// ============================================================================

pub struct Backend {
    pub platform: Box<dyn MirrorPlatform>,
    pub encoders: Box<dyn EncoderFactory>,
}

pub struct BackendMetadata {
    pub id: &'static str,
    pub name: &'static str,
    pub factory: fn(&CaptureConfig) -> Result<Backend, PlatformError>,
}

inventory::collect!(BackendMetadata);
