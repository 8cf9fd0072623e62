use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_BACKEND: &str = "loopback";
pub const DEFAULT_FRAME_RATE: u32 = 30;
/// Bits per second per pixel of output resolution.
pub const DEFAULT_BITRATE_FACTOR: u32 = 5;
pub const DEFAULT_BUFFER_DEPTH: usize = 2;
pub const DEFAULT_FILE_PREFIX: &str = "ScreenRecord";
pub const MOVIES_DIR_NAME: &str = "Movies";

const MAX_FRAME_RATE: u32 = 120;
const MAX_BUFFER_DEPTH: usize = 8;

// ============================================================================
// Capture Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Registered backend id, see `manager::inventory::list_backends`.
    pub backend: String,
    pub frame_rate: u32,
    pub bitrate_factor: u32,
    /// Depth of the frame buffer ring behind the capture sink.
    pub buffer_depth: usize,
    pub file_prefix: String,
    /// Recording directory. `None` resolves to the platform movies cache dir.
    pub output_dir: Option<PathBuf>,
    pub monitor_index: usize,
    pub ffmpeg_path: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            frame_rate: DEFAULT_FRAME_RATE,
            bitrate_factor: DEFAULT_BITRATE_FACTOR,
            buffer_depth: DEFAULT_BUFFER_DEPTH,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            output_dir: None,
            monitor_index: 0,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl CaptureConfig {
    /// Clamp values that would make the pipelines misbehave.
    pub fn normalized(mut self) -> Self {
        self.frame_rate = self.frame_rate.clamp(1, MAX_FRAME_RATE);
        self.bitrate_factor = self.bitrate_factor.max(1);
        self.buffer_depth = self.buffer_depth.clamp(1, MAX_BUFFER_DEPTH);
        if self.backend.trim().is_empty() {
            self.backend = DEFAULT_BACKEND.to_string();
        }
        self
    }

    /// Directory recordings are written to.
    pub fn movies_dir(&self) -> PathBuf {
        if let Some(dir) = &self.output_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(env!("CARGO_PKG_NAME"))
            .join(MOVIES_DIR_NAME)
    }
}

// ============================================================================
// Persistence
// ============================================================================

pub fn load_config(path: &Path) -> Result<CaptureConfig> {
    if !path.exists() {
        return Ok(CaptureConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| CaptureError::Config(format!("Failed to read config '{path:?}': {e}")))?;

    let config = serde_json::from_str::<CaptureConfig>(&raw)
        .map_err(|e| CaptureError::Config(format!("Failed to parse config '{path:?}': {e}")))?;

    Ok(config.normalized())
}

pub fn save_config(path: &Path, config: &CaptureConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| CaptureError::Config(format!("Failed to serialize config: {e}")))?;

    // Write to temp then rename.
    let tmp = path.with_extension("json.tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(json.as_bytes())?;
        f.flush()?;
    }
    std::fs::rename(&tmp, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, CaptureConfig::default());
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.buffer_depth, 2);
    }

    #[test]
    fn test_partial_file_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(&path, r#"{ "frameRate": 0, "bufferDepth": 64, "filePrefix": "Clip" }"#)
            .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.frame_rate, 1);
        assert_eq!(config.buffer_depth, 8);
        assert_eq!(config.file_prefix, "Clip");
        assert_eq!(config.backend, DEFAULT_BACKEND);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capture.json");
        let config = CaptureConfig {
            output_dir: Some(dir.path().to_path_buf()),
            monitor_index: 1,
            ..CaptureConfig::default()
        };

        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_garbage_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_config(&path), Err(CaptureError::Config(_))));
    }

    #[test]
    fn test_movies_dir_prefers_explicit_dir() {
        let config = CaptureConfig {
            output_dir: Some(PathBuf::from("/tmp/clips")),
            ..CaptureConfig::default()
        };
        assert_eq!(config.movies_dir(), PathBuf::from("/tmp/clips"));
        assert!(CaptureConfig::default().movies_dir().ends_with(MOVIES_DIR_NAME));
    }
}
