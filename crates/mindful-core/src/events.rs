use std::sync::{Arc, PoisonError, RwLock};

use crate::errors::ErrorKind;

/// Events emitted by the core to native UI listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(ConnectionState),
    Connected { session_id: String },
    Disconnected { session_id: String },
    MuteChanged(bool),
    CameraChanged(bool),
    Error(CallErrorInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    AcquiringCredential,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// A call in this state still owns (or is about to own) the transport.
    pub fn is_live(self) -> bool {
        matches!(self, Self::AcquiringCredential | Self::Connecting | Self::Connected)
    }
}

/// A failure as the presentation layer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait CallEventListener: Send + Sync {
    fn on_event(&self, event: CallEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn CallEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: CallEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
