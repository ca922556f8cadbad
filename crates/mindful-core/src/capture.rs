use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::CallError;

/// The platform's audio (and optionally video) capture session.
///
/// On iOS/Android this wraps the OS audio session; the native shell provides
/// the implementation.
pub trait CaptureDevice: Send + Sync {
    fn start(&self, video: bool) -> Result<(), CallError>;
    fn stop(&self);
}

/// Grants exclusive use of the capture device.
///
/// Only one [`CaptureLease`] exists at a time across all clones of an arbiter.
/// A call that still holds its lease blocks the next one from starting.
#[derive(Clone)]
pub struct CaptureArbiter {
    device: Arc<dyn CaptureDevice>,
    held: Arc<AtomicBool>,
}

impl CaptureArbiter {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub fn acquire(&self, video: bool) -> Result<CaptureLease, CallError> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CallError::Resource("capture device busy".into()));
        }

        if let Err(e) = self.device.start(video) {
            self.held.store(false, Ordering::Release);
            tracing::warn!("capture start failed: {e}");
            return Err(e);
        }

        tracing::info!(video, "capture session started");
        Ok(CaptureLease {
            device: self.device.clone(),
            held: self.held.clone(),
        })
    }
}

/// Scoped hold on the capture device. Dropping it stops capture.
pub struct CaptureLease {
    device: Arc<dyn CaptureDevice>,
    held: Arc<AtomicBool>,
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        self.device.stop();
        self.held.store(false, Ordering::Release);
        tracing::info!("capture session released");
    }
}
