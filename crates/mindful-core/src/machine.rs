//! Call lifecycle state machine.
//!
//! Pure and synchronous: the controller feeds it [`Input`]s and carries out
//! the returned [`Effect`]s. Every asynchronous result carries the attempt
//! number that requested it, so results from a superseded attempt are dropped
//! here instead of racing the current one.

use crate::errors::CallError;
use crate::events::ConnectionState;
use crate::token::Credential;

/// One real-time call, identified by its session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub session_id: String,
    pub user_id: String,
    pub server_address: String,
}

impl CallSession {
    /// Session key for a call started from the breathing screen.
    pub fn generate_id() -> String {
        format!("breathing-{}", chrono::Utc::now().timestamp_millis())
    }
}

#[derive(Debug, Clone)]
pub enum Input {
    Start { session_id: String, user_id: String },
    Retry,
    EndCall,
    CredentialReady { attempt: u64, credential: Credential },
    CredentialFailed { attempt: u64, error: CallError },
    TransportConnected { attempt: u64 },
    TransportFailed { attempt: u64, error: CallError },
    TransportDisconnected { attempt: u64, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RequestCredential { attempt: u64, session_id: String, user_id: String },
    Connect { attempt: u64, credential: Credential },
    /// Abort in-flight work, disconnect the transport and release capture.
    Teardown,
    NotifyConnected,
    NotifyDisconnected,
    NotifyError(CallError),
}

pub struct CallStateMachine {
    state: ConnectionState,
    server_address: String,
    session: Option<CallSession>,
    error: Option<CallError>,
    attempt: u64,
}

impl CallStateMachine {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Idle,
            server_address: server_address.into(),
            session: None,
            error: None,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn error(&self) -> Option<&CallError> {
        self.error.as_ref()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Apply one input. Commands that are not valid in the current state are
    /// rejected with [`CallError::InvalidState`] and leave the machine as is.
    pub fn handle(&mut self, input: Input) -> Result<Vec<Effect>, CallError> {
        match input {
            Input::Start { session_id, user_id } => self.start(session_id, user_id),
            Input::Retry => self.retry(),
            Input::EndCall => Ok(self.end_call()),
            Input::CredentialReady { attempt, credential } => Ok(self.credential_ready(attempt, credential)),
            Input::CredentialFailed { attempt, error } => Ok(self.credential_failed(attempt, error)),
            Input::TransportConnected { attempt } => Ok(self.transport_connected(attempt)),
            Input::TransportFailed { attempt, error } => Ok(self.transport_failed(attempt, error)),
            Input::TransportDisconnected { attempt, reason } => Ok(self.transport_disconnected(attempt, reason)),
        }
    }

    fn start(&mut self, session_id: String, user_id: String) -> Result<Vec<Effect>, CallError> {
        if self.state != ConnectionState::Idle {
            return Err(CallError::InvalidState(format!(
                "cannot start a call while {:?}",
                self.state
            )));
        }
        if session_id.trim().is_empty() {
            return Err(CallError::InvalidInput("session id is empty".into()));
        }

        self.session = Some(CallSession {
            session_id,
            user_id,
            server_address: self.server_address.clone(),
        });
        Ok(vec![self.begin_attempt()])
    }

    fn retry(&mut self) -> Result<Vec<Effect>, CallError> {
        if self.state != ConnectionState::Failed {
            return Err(CallError::InvalidState(format!(
                "retry is only possible after a failure, state is {:?}",
                self.state
            )));
        }
        Ok(vec![Effect::Teardown, self.begin_attempt()])
    }

    fn begin_attempt(&mut self) -> Effect {
        self.attempt += 1;
        self.error = None;
        self.state = ConnectionState::AcquiringCredential;

        let (session_id, user_id) = self
            .session
            .as_ref()
            .map(|s| (s.session_id.clone(), s.user_id.clone()))
            .unwrap_or_default();
        Effect::RequestCredential {
            attempt: self.attempt,
            session_id,
            user_id,
        }
    }

    fn end_call(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.enter_disconnected()
    }

    fn enter_disconnected(&mut self) -> Vec<Effect> {
        // Anything still in flight belongs to a dead attempt from here on.
        self.attempt += 1;
        self.error = None;
        self.state = ConnectionState::Disconnected;
        vec![Effect::Teardown, Effect::NotifyDisconnected]
    }

    fn fail(&mut self, error: CallError) -> Vec<Effect> {
        self.error = Some(error.clone());
        self.state = ConnectionState::Failed;
        vec![Effect::Teardown, Effect::NotifyError(error)]
    }

    fn is_current(&self, attempt: u64, expected: ConnectionState) -> bool {
        if attempt != self.attempt || self.state != expected {
            tracing::debug!(
                attempt,
                current = self.attempt,
                state = ?self.state,
                "dropping stale lifecycle input"
            );
            return false;
        }
        true
    }

    fn credential_ready(&mut self, attempt: u64, credential: Credential) -> Vec<Effect> {
        if !self.is_current(attempt, ConnectionState::AcquiringCredential) {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Effect::Connect { attempt, credential }]
    }

    fn credential_failed(&mut self, attempt: u64, error: CallError) -> Vec<Effect> {
        if !self.is_current(attempt, ConnectionState::AcquiringCredential) {
            return Vec::new();
        }
        self.fail(error)
    }

    fn transport_connected(&mut self, attempt: u64) -> Vec<Effect> {
        if !self.is_current(attempt, ConnectionState::Connecting) {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        vec![Effect::NotifyConnected]
    }

    fn transport_failed(&mut self, attempt: u64, error: CallError) -> Vec<Effect> {
        if attempt == self.attempt && self.state == ConnectionState::Connected {
            // The SDK follows errors on a live room with a disconnect event.
            tracing::warn!("transport error while connected: {error}");
            return Vec::new();
        }
        if !self.is_current(attempt, ConnectionState::Connecting) {
            return Vec::new();
        }
        self.fail(error)
    }

    fn transport_disconnected(&mut self, attempt: u64, reason: String) -> Vec<Effect> {
        if attempt != self.attempt {
            return Vec::new();
        }
        match self.state {
            ConnectionState::Connecting => self.fail(CallError::Connection(format!(
                "disconnected before connecting: {reason}"
            ))),
            ConnectionState::Connected => {
                tracing::info!("transport disconnected: {reason}");
                self.enter_disconnected()
            }
            _ => Vec::new(),
        }
    }
}
