use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S%3f";

/// `<prefix>_<YYYYMMDD_HHmmssSSS>.<ext>` under a fixed directory.
/// Collisions are not checked; millisecond resolution is relied on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNaming {
    dir: PathBuf,
    prefix: String,
    extension: String,
}

impl OutputNaming {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_path(&self) -> PathBuf {
        self.path_at(Local::now())
    }

    pub fn path_at(&self, at: DateTime<Local>) -> PathBuf {
        self.dir.join(file_name(&self.prefix, at, &self.extension))
    }
}

pub fn file_name(prefix: &str, at: DateTime<Local>, extension: &str) -> String {
    let stamp = at.format(TIMESTAMP_FORMAT);
    if prefix.is_empty() {
        format!("{stamp}.{extension}")
    } else {
        format!("{prefix}_{stamp}.{extension}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 20, 9, 5, 7)
            .single()
            .unwrap()
            + chrono::Duration::milliseconds(42)
    }

    #[test]
    fn test_file_name_with_prefix() {
        assert_eq!(file_name("ScreenRecord", instant(), "mp4"), "ScreenRecord_20240320_090507042.mp4");
    }

    #[test]
    fn test_file_name_without_prefix() {
        assert_eq!(file_name("", instant(), "rgba"), "20240320_090507042.rgba");
    }

    #[test]
    fn test_path_is_under_dir() {
        let naming = OutputNaming::new("/cache/Movies", "Clip", "mp4");
        let path = naming.path_at(instant());
        assert_eq!(path, PathBuf::from("/cache/Movies/Clip_20240320_090507042.mp4"));
    }
}
