//! Recording encoder backed by an `ffmpeg` child process.
//!
//! Frames posted to the input surface are packed and pushed through a bounded
//! channel to a writer thread feeding ffmpeg's stdin as `rawvideo` RGBA.
//! Closing stdin makes ffmpeg finalize the container.

use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::PlatformError;
use crate::interface::platform::{Encoder, EncoderFactory, EncoderSettings, Surface, SurfaceSink};
use crate::resource::screen::RawBuffer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegCommandBuilder {
    width: u32,
    height: u32,
    framerate: u32,
    video_codec: String,
    bitrate: u64,
    preset: String,
    output_path: String,
}

impl FfmpegCommandBuilder {
    pub fn new(output_path: String) -> Self {
        Self {
            width: 0,
            height: 0,
            framerate: 30,
            video_codec: "libx264".to_string(),
            bitrate: 0,
            preset: "veryfast".to_string(),
            output_path,
        }
    }

    pub fn from_settings(settings: &EncoderSettings) -> Self {
        Self::new(settings.output.to_string_lossy().to_string())
            .with_input_size(settings.width, settings.height)
            .with_framerate(settings.frame_rate)
            .with_bitrate(settings.bit_rate)
    }

    pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_video_codec(mut self, codec: String) -> Self {
        self.video_codec = codec;
        self
    }

    pub fn build(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(), "error".to_string(),
            "-f".to_string(), "rawvideo".to_string(),
            "-pix_fmt".to_string(), "rgba".to_string(),
            "-s".to_string(), format!("{}x{}", self.width, self.height),
            "-framerate".to_string(), self.framerate.to_string(),
            "-i".to_string(), "-".to_string(),
            "-c:v".to_string(), self.video_codec.clone(),
            "-b:v".to_string(), self.bitrate.to_string(),
            "-pix_fmt".to_string(), "yuv420p".to_string(),
            "-preset".to_string(), self.preset.clone(),
            "-movflags".to_string(), "+faststart".to_string(),
            "-y".to_string(),
            self.output_path.clone(),
        ]
    }
}

// ============================================================================
// Encoder
// ============================================================================

pub struct FfmpegEncoderFactory {
    ffmpeg_path: String,
}

impl FfmpegEncoderFactory {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn container_extension(&self) -> &'static str {
        "mp4"
    }

    fn create(&mut self, settings: &EncoderSettings) -> Result<Box<dyn Encoder>, PlatformError> {
        Ok(Box::new(FfmpegEncoder {
            ffmpeg_path: self.ffmpeg_path.clone(),
            settings: settings.clone(),
            surface: None,
            child: None,
            writer: None,
        }))
    }
}

struct FfmpegSurface {
    width: u32,
    height: u32,
    tx: Mutex<Option<flume::Sender<Vec<u8>>>>,
    recording: AtomicBool,
}

impl SurfaceSink for FfmpegSurface {
    fn post(&self, buffer: &RawBuffer) {
        if !self.recording.load(Ordering::Acquire)
            || buffer.width != self.width
            || buffer.height != self.height
        {
            return;
        }
        let Ok(tx) = self.tx.lock() else {
            return;
        };
        if let Some(tx) = tx.as_ref() {
            // A full channel means ffmpeg is behind; drop the frame.
            let _ = tx.try_send(buffer.to_packed());
        }
    }
}

struct FfmpegEncoder {
    ffmpeg_path: String,
    settings: EncoderSettings,
    surface: Option<Arc<FfmpegSurface>>,
    child: Option<Child>,
    writer: Option<JoinHandle<std::io::Result<()>>>,
}

impl FfmpegEncoder {
    fn close_input(&mut self) -> Result<(), PlatformError> {
        if let Some(surface) = self.surface.as_ref() {
            surface.recording.store(false, Ordering::Release);
            if let Ok(mut tx) = surface.tx.lock() {
                tx.take();
            }
        }
        match self.writer.take() {
            Some(writer) => match writer.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(PlatformError::failed("write frames", e.to_string())),
                Err(_) => Err(PlatformError::failed("write frames", "writer thread panicked")),
            },
            None => Ok(()),
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn prepare(&mut self) -> Result<Surface, PlatformError> {
        let args = FfmpegCommandBuilder::from_settings(&self.settings).build();
        log::debug!(args:? = args; "Spawning ffmpeg encoder");

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PlatformError::failed("spawn ffmpeg", e.to_string()))?;

        let Some(mut stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PlatformError::failed("spawn ffmpeg", "stdin not captured"));
        };

        let (tx, rx) = flume::bounded::<Vec<u8>>(self.settings.frame_rate.max(1) as usize);
        let writer = thread::Builder::new()
            .name("ffmpeg-writer".to_string())
            .spawn(move || -> std::io::Result<()> {
                for frame in rx.iter() {
                    stdin.write_all(&frame)?;
                }
                stdin.flush()
            });
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PlatformError::failed("spawn writer", e.to_string()));
            }
        };

        let surface = Arc::new(FfmpegSurface {
            width: self.settings.width,
            height: self.settings.height,
            tx: Mutex::new(Some(tx)),
            recording: AtomicBool::new(false),
        });

        self.child = Some(child);
        self.writer = Some(writer);
        self.surface = Some(Arc::clone(&surface));
        Ok(surface)
    }

    fn start(&mut self) -> Result<(), PlatformError> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| PlatformError::failed("start", "encoder not prepared"))?;
        surface.recording.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlatformError> {
        let written = self.close_input();

        let mut child = self
            .child
            .take()
            .ok_or_else(|| PlatformError::failed("stop", "encoder not prepared"))?;
        let status = child
            .wait()
            .map_err(|e| PlatformError::failed("wait ffmpeg", e.to_string()))?;

        written?;
        if !status.success() {
            return Err(PlatformError::failed("ffmpeg exit", status.to_string()));
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Err(e) = self.close_input() {
            log::warn!(err:display = e; "ffmpeg writer failed during release");
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.surface = None;
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.release();
    }
}
