use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use projection_lib::config::load_config;
use projection_lib::manager::inventory::list_backends;
use projection_lib::{AuthorizationGrant, CaptureError, CaptureSessionManager, Geometry};

const RECORD_FOR: Duration = Duration::from_secs(2);
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(3);

struct LogPresence;

impl projection_lib::ForegroundPresence for LogPresence {
    fn session_active(&self) {
        log::info!("Foreground presence requested");
    }

    fn session_idle(&self) {
        log::info!("Foreground presence released");
    }
}

fn run() -> Result<(), CaptureError> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("projection.json"));
    let config = load_config(&config_path)?;

    for backend in list_backends() {
        log::debug!(id = backend.id, name = backend.name; "Available backend");
    }

    let mut manager = CaptureSessionManager::from_config(&config)?.with_presence(Box::new(LogPresence));
    let geometry = manager
        .primary_geometry()
        .unwrap_or(Geometry::new(1920, 1080, 96));

    // Desktop hosts have no consent dialog; the operator running this binary consents.
    let grant = AuthorizationGrant::granted("cli-operator", geometry);
    let session = manager.open(grant, geometry, true, true)?;
    println!("Session {} open at {}", session.id, session.geometry);

    manager.start_recording()?;

    let deadline = Instant::now() + FIRST_FRAME_TIMEOUT;
    let frame = loop {
        match manager.capture() {
            Ok(frame) => break Some(frame),
            Err(CaptureError::NoFrameAvailable) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(CaptureError::NoFrameAvailable) => break None,
            Err(err) => return Err(err),
        }
    };

    match frame {
        Some(frame) => {
            let path = config.movies_dir().join("frame.png");
            std::fs::create_dir_all(config.movies_dir())?;
            frame
                .as_image()
                .save(&path)
                .map_err(|e| CaptureError::Io(std::io::Error::other(e)))?;
            println!("Captured {}x{} frame -> {}", frame.width(), frame.height(), path.display());
        }
        None => println!("No frame arrived within {:?}", FIRST_FRAME_TIMEOUT),
    }

    std::thread::sleep(RECORD_FOR);
    let artifact = manager.stop_recording()?;
    println!("Recording -> {}", artifact);

    manager.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!(err:display = err; "projection failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
