use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::interface::platform::{Surface, VirtualDisplay};

use super::RawBuffer;

/// Where a pumped display pulls frames from. Runs on the pump thread.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self) -> Option<RawBuffer>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Option<RawBuffer> + Send + 'static,
{
    fn next_frame(&mut self) -> Option<RawBuffer> {
        self()
    }
}

/// Virtual display driven by a producer thread that polls a [`FrameSource`]
/// at a fixed interval and posts to whichever surface is currently bound.
pub struct PumpedDisplay {
    name: String,
    target: Arc<Mutex<Option<Surface>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PumpedDisplay {
    pub fn spawn<S: FrameSource>(
        name: &str,
        interval: Duration,
        surface: Surface,
        mut source: S,
    ) -> std::io::Result<Self> {
        let target = Arc::new(Mutex::new(Some(surface)));
        let running = Arc::new(AtomicBool::new(true));

        let target_thread = Arc::clone(&target);
        let running_thread = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name(format!("pump-{name}"))
            .spawn(move || {
                let mut next_frame = Instant::now();
                while running_thread.load(Ordering::Acquire) {
                    let surface = target_thread.lock().ok().and_then(|guard| guard.clone());
                    if let Some(surface) = surface {
                        if let Some(buffer) = source.next_frame() {
                            surface.post(&buffer);
                        }
                    }

                    next_frame += interval;
                    let now = Instant::now();
                    if next_frame > now {
                        thread::park_timeout(next_frame - now);
                    } else {
                        // Fell behind; resync instead of bursting.
                        next_frame = now;
                    }
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            target,
            running,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl VirtualDisplay for PumpedDisplay {
    fn set_surface(&mut self, surface: Option<Surface>) {
        if let Ok(mut target) = self.target.lock() {
            *target = surface;
        }
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::warn!(display = self.name.as_str(); "Pump thread panicked");
            }
        }
        self.set_surface(None);
    }
}

impl Drop for PumpedDisplay {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::platform::SurfaceSink;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SurfaceSink for Counter {
        fn post(&self, _buffer: &RawBuffer) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_pump_posts_until_released() {
        let counter = Arc::new(Counter::default());
        let source = || Some(RawBuffer::packed(1, 1, vec![0; 4]));
        let mut display =
            PumpedDisplay::spawn("test", Duration::from_millis(2), counter.clone(), source).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.0.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        display.release();

        let after_release = counter.0.load(Ordering::Relaxed);
        assert!(after_release >= 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.0.load(Ordering::Relaxed), after_release);
    }

    #[test]
    fn test_detached_pump_posts_nothing() {
        let counter = Arc::new(Counter::default());
        let source = || Some(RawBuffer::packed(1, 1, vec![0; 4]));
        let mut display =
            PumpedDisplay::spawn("idle", Duration::from_millis(1), counter.clone(), source).unwrap();
        display.set_surface(None);
        let before = counter.0.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        // At most one post can race the detach.
        assert!(counter.0.load(Ordering::Relaxed) <= before + 1);
        display.release();
    }
}
