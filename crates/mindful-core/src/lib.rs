//! Mindful call core.
//!
//! Pure Rust crate with no platform dependencies: call token acquisition,
//! the call lifecycle controller, and the sign-in gate in front of it.
//! Consumed by native UI shells via UniFFI bindings.

pub mod auth;
pub mod capture;
pub mod config;
pub mod errors;
pub mod events;
pub mod machine;
pub mod session;
pub mod token;
pub mod transport;

#[cfg(feature = "livekit")]
pub mod livekit_transport;

#[cfg(test)]
mod testing;

pub use auth::{AuthConfig, AuthGate, AuthProvider, AuthSession, GoTrueAuth, SignUpOutcome};
pub use capture::{CaptureArbiter, CaptureDevice, CaptureLease};
pub use config::CallConfig;
pub use errors::{CallError, ErrorKind};
pub use events::{CallErrorInfo, CallEvent, CallEventListener, ConnectionState, EventEmitter};
pub use machine::{CallSession, CallStateMachine};
pub use session::{CallController, CallHandle, CallSnapshot};
pub use token::{
    Credential, CredentialSource, TokenClient, TokenClientConfig, TokenRequestState, TokenRequester,
};
pub use transport::{
    I420Frame, PcmFrame, PublishPreset, TransportConnector, TransportEvent, TransportOptions,
    TransportSession,
};

#[cfg(feature = "livekit")]
pub use livekit_transport::{LiveKitConnector, LiveKitSession};
