pub mod config;
pub mod error;
pub mod interface;
pub mod manager;
pub mod resource;

pub use config::CaptureConfig;
pub use error::{CaptureError, PlatformError, Result};
pub use interface::platform::{AuthorizationGrant, ConsentStatus, ForegroundPresence};
pub use manager::{CaptureSessionManager, SessionHandle, SessionState, SessionStatus};
pub use resource::recorder::{RecorderState, RecordingArtifact};
pub use resource::screen::{Frame, Geometry, PixelFormat};
