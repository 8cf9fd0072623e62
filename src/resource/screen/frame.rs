use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CaptureError, Result};
use crate::interface::platform::{Surface, SurfaceSink};

use super::{decode_padded, Frame, Geometry, RawBuffer};

// ============================================================================
// Shared Ring
// ============================================================================

/// Fixed-depth buffer ring shared between the mirror's producer thread and the
/// single consumer.
struct SharedRing {
    depth: usize,
    /// Filled buffers, oldest first.
    queued: Mutex<VecDeque<RawBuffer>>,
    /// Released storage waiting to be refilled by the producer.
    free: Mutex<Vec<Vec<u8>>>,
    frame_ready: AtomicBool,
    closed: AtomicBool,
    frames_received: AtomicU64,
}

impl SharedRing {
    fn recycle(&self, storage: Vec<u8>) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.depth {
                free.push(storage);
            }
        }
    }

    fn take_storage(&self) -> Vec<u8> {
        self.free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_default()
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Sink surface handed to the mirror. Each `post` copies the buffer into the
/// ring, evicting the oldest entry when full, then raises `frame_ready`.
#[derive(Clone)]
pub struct FrameProducer {
    ring: Arc<SharedRing>,
}

impl SurfaceSink for FrameProducer {
    fn post(&self, buffer: &RawBuffer) {
        if self.ring.closed.load(Ordering::Acquire) {
            return;
        }

        let mut storage = self.ring.take_storage();
        storage.clear();
        storage.extend_from_slice(&buffer.data);
        let entry = RawBuffer {
            width: buffer.width,
            height: buffer.height,
            pixel_stride: buffer.pixel_stride,
            row_stride: buffer.row_stride,
            format: buffer.format,
            data: storage,
        };

        let evicted = match self.ring.queued.lock() {
            Ok(mut queued) => {
                let evicted = if queued.len() >= self.ring.depth {
                    queued.pop_front()
                } else {
                    None
                };
                queued.push_back(entry);
                evicted
            }
            Err(_) => return,
        };
        if let Some(old) = evicted {
            self.ring.recycle(old.data);
        }

        self.ring.frames_received.fetch_add(1, Ordering::Relaxed);
        // Must stay the producer's last write.
        self.ring.frame_ready.store(true, Ordering::Release);
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Consumer side of the frame queue: "latest available frame or none".
///
/// `poll` never waits. It is single-consumer; callers serialize access through
/// `&mut self`.
pub struct FrameBufferSource {
    geometry: Geometry,
    ring: Arc<SharedRing>,
}

impl FrameBufferSource {
    pub fn new(geometry: Geometry, depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            geometry,
            ring: Arc::new(SharedRing {
                depth,
                queued: Mutex::new(VecDeque::with_capacity(depth)),
                free: Mutex::new(Vec::with_capacity(depth)),
                frame_ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                frames_received: AtomicU64::new(0),
            }),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn depth(&self) -> usize {
        self.ring.depth
    }

    pub fn producer(&self) -> FrameProducer {
        FrameProducer {
            ring: Arc::clone(&self.ring),
        }
    }

    /// The producer as a mirror sink surface.
    pub fn surface(&self) -> Surface {
        Arc::new(self.producer())
    }

    pub fn frames_received(&self) -> u64 {
        self.ring.frames_received.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.ring.closed.load(Ordering::Acquire)
    }

    /// Take the newest buffer and decode it.
    ///
    /// Clears `frame_ready` on entry, so a second call without an intervening
    /// arrival returns `NoFrameAvailable`. Every acquired buffer goes back to
    /// the ring before returning, whether or not decoding succeeded.
    pub fn poll(&mut self) -> Result<Frame> {
        if self.is_closed() || !self.ring.frame_ready.swap(false, Ordering::AcqRel) {
            return Err(CaptureError::NoFrameAvailable);
        }

        let Some(buffer) = self.acquire_latest() else {
            return Err(CaptureError::NoFrameAvailable);
        };

        let frame = decode_padded(&buffer);
        self.ring.recycle(buffer.data);

        frame.ok_or_else(|| {
            log::warn!(
                row_stride = buffer.row_stride,
                pixel_stride = buffer.pixel_stride,
                width = buffer.width;
                "Discarding undecodable frame buffer"
            );
            CaptureError::NoFrameAvailable
        })
    }

    /// Pop the newest buffer and return every older one to the ring.
    fn acquire_latest(&mut self) -> Option<RawBuffer> {
        let (latest, stale) = {
            let mut queued = self.ring.queued.lock().ok()?;
            let latest = queued.pop_back()?;
            let stale: Vec<RawBuffer> = queued.drain(..).collect();
            (latest, stale)
        };
        for old in stale {
            self.ring.recycle(old.data);
        }
        Some(latest)
    }

    /// Stop accepting buffers and drop everything still queued.
    pub fn close(&mut self) {
        if self.ring.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ring.frame_ready.store(false, Ordering::Release);
        match self.ring.queued.lock() {
            Ok(mut queued) => queued.clear(),
            Err(_) => log::warn!("Frame queue lock poisoned during close; buffers left to drop"),
        }
        if let Ok(mut free) = self.ring.free.lock() {
            free.clear();
        }
    }
}

impl Drop for FrameBufferSource {
    fn drop(&mut self) {
        self.close();
    }
}
