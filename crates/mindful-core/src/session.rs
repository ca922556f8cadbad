//! Call controller: drives the lifecycle state machine from one task.
//!
//! User commands arrive on the handle's command channel. Credential results
//! and transport events arrive on an internal channel fed by the tasks the
//! actor spawns. One actor task drains both, so transitions are applied one
//! at a time and never interleave. The UI reads the latest
//! [`CallSnapshot`] synchronously and receives [`CallEvent`]s through the
//! listener registry.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::capture::{CaptureArbiter, CaptureLease};
use crate::config::CallConfig;
use crate::errors::CallError;
use crate::events::{CallErrorInfo, CallEvent, CallEventListener, ConnectionState, EventEmitter};
use crate::machine::{CallSession, CallStateMachine, Effect, Input};
use crate::token::CredentialSource;
use crate::transport::{
    I420Frame, PcmFrame, TransportConnector, TransportEvent, TransportEvents, TransportOptions,
    TransportSession,
};

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: ConnectionState,
    pub error: Option<CallErrorInfo>,
    pub muted: bool,
    pub video_enabled: bool,
    /// Whether the camera track is published unmuted. Always false for
    /// audio-only calls.
    pub camera_enabled: bool,
    pub session: Option<CallSession>,
}

impl CallSnapshot {
    fn idle(video_enabled: bool) -> Self {
        Self {
            state: ConnectionState::Idle,
            error: None,
            muted: false,
            video_enabled,
            camera_enabled: video_enabled,
            session: None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

/// The live transport session, shared with the handle so host frames can be
/// pushed without a round trip through the actor.
#[derive(Clone, Default)]
struct MediaSlot(Arc<RwLock<Option<Arc<dyn TransportSession>>>>);

impl MediaSlot {
    fn get(&self) -> Option<Arc<dyn TransportSession>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, session: Arc<dyn TransportSession>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    fn take(&self) -> Option<Arc<dyn TransportSession>> {
        self.0.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Start { session_id: String, user_id: String, reply: Reply<()> },
    Retry { reply: Reply<()> },
    EndCall { reply: Reply<()> },
    ToggleMute { reply: Reply<bool> },
    SetCamera { enabled: bool, reply: Reply<()> },
}

enum Internal {
    Lifecycle(Input),
    TransportReady {
        attempt: u64,
        session: Arc<dyn TransportSession>,
        events: TransportEvents,
    },
}

/// Wires a call's collaborators together. Call [`CallController::spawn`] from
/// inside a tokio runtime to start the actor.
pub struct CallController {
    config: CallConfig,
    credentials: Arc<dyn CredentialSource>,
    connector: Arc<dyn TransportConnector>,
    capture: CaptureArbiter,
    emitter: EventEmitter,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        credentials: Arc<dyn CredentialSource>,
        connector: Arc<dyn TransportConnector>,
        capture: CaptureArbiter,
    ) -> Self {
        Self {
            config,
            credentials,
            connector,
            capture,
            emitter: EventEmitter::new(),
        }
    }

    /// Share an existing emitter so listeners outlive individual calls.
    #[must_use]
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn spawn(self) -> CallHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle(self.config.video_enabled));
        let media = MediaSlot::default();
        let camera_enabled = self.config.video_enabled;

        let actor = CallActor {
            machine: CallStateMachine::new(self.config.server_address.clone()),
            config: self.config,
            credentials: self.credentials,
            connector: self.connector,
            capture: self.capture,
            emitter: self.emitter.clone(),
            snapshot_tx,
            internal_tx,
            muted: false,
            camera_enabled,
            transport: media.clone(),
            lease: None,
            tasks: Vec::new(),
        };
        let task = tokio::spawn(actor.run(command_rx, internal_rx));

        CallHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            emitter: self.emitter,
            media,
            task,
        }
    }
}

/// Control surface for one call. Dropping it ends the call and releases
/// capture; [`CallHandle::shutdown`] does the same and waits for it.
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    emitter: EventEmitter,
    media: MediaSlot,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub async fn start(&self, session_id: impl Into<String>, user_id: impl Into<String>) -> Result<(), CallError> {
        let (session_id, user_id) = (session_id.into(), user_id.into());
        self.request(|reply| Command::Start { session_id, user_id, reply }).await
    }

    pub async fn retry(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Retry { reply }).await
    }

    /// Hang up. Ending an already disconnected call does nothing.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Flip the local mute flag; returns the new value.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Publish or hold back the camera track of a video call.
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetCamera { enabled, reply }).await
    }

    /// Forward one microphone buffer from the host. Returns `false` when no
    /// transport session is open yet and the frame was dropped.
    pub async fn push_audio_frame(&self, frame: PcmFrame) -> Result<bool, CallError> {
        frame.validate()?;
        let Some(session) = self.media.get() else {
            return Ok(false);
        };
        session.push_audio_frame(frame).await?;
        Ok(true)
    }

    /// Forward one camera frame from the host. Same contract as
    /// [`CallHandle::push_audio_frame`].
    pub fn push_video_frame(&self, frame: I420Frame) -> Result<bool, CallError> {
        if !self.snapshot.borrow().video_enabled {
            return Err(CallError::InvalidState("call was started without video".into()));
        }
        frame.validate()?;
        let Some(session) = self.media.get() else {
            return Ok(false);
        };
        session.push_video_frame(frame)?;
        Ok(true)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn error_message(&self) -> Option<String> {
        self.snapshot.borrow().error_message().map(str::to_string)
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.emitter.add_listener(listener);
    }

    /// Stop the controller, tearing down any live call first.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            tracing::warn!("call controller task ended abnormally: {e}");
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| CallError::InvalidState("call controller stopped".into()))?;
        rx.await
            .map_err(|_| CallError::InvalidState("call controller stopped".into()))?
    }
}

struct CallActor {
    machine: CallStateMachine,
    config: CallConfig,
    credentials: Arc<dyn CredentialSource>,
    connector: Arc<dyn TransportConnector>,
    capture: CaptureArbiter,
    emitter: EventEmitter,
    snapshot_tx: watch::Sender<CallSnapshot>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    muted: bool,
    camera_enabled: bool,
    transport: MediaSlot,
    lease: Option<CaptureLease>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(message) = internal.recv() => self.on_internal(message).await,
            }
        }

        self.teardown().await;
        tracing::info!("call controller stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { session_id, user_id, reply } => {
                let result = if self.capture.is_held() && self.lease.is_none() {
                    Err(CallError::Resource("a previous call still holds the capture device".into()))
                } else {
                    tracing::info!(%session_id, %user_id, "starting call");
                    self.apply(Input::Start { session_id, user_id }).await
                };
                let _ = reply.send(result);
            }
            Command::Retry { reply } => {
                tracing::info!("retrying call");
                let _ = reply.send(self.apply(Input::Retry).await);
            }
            Command::EndCall { reply } => {
                tracing::info!("ending call");
                let _ = reply.send(self.apply(Input::EndCall).await);
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute().await);
            }
            Command::SetCamera { enabled, reply } => {
                let _ = reply.send(self.set_camera(enabled).await);
            }
        }
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Lifecycle(input) => {
                if let Err(e) = self.apply(input).await {
                    tracing::warn!("lifecycle input rejected: {e}");
                }
            }
            Internal::TransportReady { attempt, session, events } => {
                self.on_transport_ready(attempt, session, events).await;
            }
        }
    }

    /// Feed an input to the machine and carry out whatever it asks for.
    /// Effects may produce follow-up inputs, which are applied in order.
    async fn apply(&mut self, input: Input) -> Result<(), CallError> {
        let mut pending = VecDeque::from([input]);
        let mut first = true;

        while let Some(input) = pending.pop_front() {
            let before = self.machine.state();
            let effects = match self.machine.handle(input) {
                Ok(effects) => effects,
                Err(e) if first => return Err(e),
                Err(e) => {
                    tracing::warn!("follow-up input rejected: {e}");
                    continue;
                }
            };
            first = false;
            self.publish(before);

            for effect in effects {
                if let Some(next) = self.run_effect(effect).await {
                    pending.push_back(next);
                }
            }
        }
        Ok(())
    }

    async fn run_effect(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::RequestCredential { attempt, session_id, user_id } => {
                self.request_credential(attempt, session_id, user_id);
                None
            }
            Effect::Connect { attempt, credential } => {
                let lease = match self.capture.acquire(self.config.video_enabled) {
                    Ok(lease) => lease,
                    Err(error) => return Some(Input::TransportFailed { attempt, error }),
                };
                self.lease = Some(lease);
                self.connect(attempt, credential.token);
                None
            }
            Effect::Teardown => {
                self.teardown().await;
                None
            }
            Effect::NotifyConnected => {
                tracing::info!("call connected");
                self.emitter.emit(CallEvent::Connected { session_id: self.session_id() });
                None
            }
            Effect::NotifyDisconnected => {
                tracing::info!("call disconnected");
                self.emitter.emit(CallEvent::Disconnected { session_id: self.session_id() });
                None
            }
            Effect::NotifyError(error) => {
                tracing::warn!("call failed: {error}");
                self.emitter.emit(CallEvent::Error(CallErrorInfo {
                    kind: error.kind(),
                    message: error.to_string(),
                }));
                None
            }
        }
    }

    fn request_credential(&mut self, attempt: u64, session_id: String, user_id: String) {
        let credentials = self.credentials.clone();
        let tx = self.internal_tx.clone();
        let timeout = self.config.acquire_timeout();

        self.track(tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, credentials.acquire(&session_id, &user_id)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(attempt, "token request timed out after {timeout:?}");
                    Err(CallError::token_failure())
                }
            };
            let input = match result {
                Ok(credential) => Input::CredentialReady { attempt, credential },
                Err(error) => Input::CredentialFailed { attempt, error },
            };
            let _ = tx.send(Internal::Lifecycle(input));
        }));
    }

    fn connect(&mut self, attempt: u64, token: String) {
        let options = TransportOptions {
            server_address: self.config.server_address.clone(),
            token,
            audio: true,
            video: self.config.video_enabled,
            preset: self.config.preset(),
        };
        let connector = self.connector.clone();
        let tx = self.internal_tx.clone();
        let timeout = self.config.connect_timeout();

        tracing::info!(attempt, ?options, "connecting transport");
        self.track(tokio::spawn(async move {
            let message = match tokio::time::timeout(timeout, connector.connect(options)).await {
                Ok(Ok((session, events))) => Internal::TransportReady { attempt, session, events },
                Ok(Err(error)) => Internal::Lifecycle(Input::TransportFailed { attempt, error }),
                Err(_) => Internal::Lifecycle(Input::TransportFailed {
                    attempt,
                    error: CallError::Connection(format!("timed out after {timeout:?}")),
                }),
            };
            let _ = tx.send(message);
        }));
    }

    async fn on_transport_ready(
        &mut self,
        attempt: u64,
        session: Arc<dyn TransportSession>,
        mut events: TransportEvents,
    ) {
        if attempt != self.machine.attempt() || self.machine.state() != ConnectionState::Connecting {
            tracing::info!(attempt, "closing transport session from a superseded attempt");
            session.disconnect().await;
            return;
        }

        if self.muted {
            if let Err(e) = session.set_microphone_enabled(false).await {
                tracing::warn!("could not apply mute to new session: {e}");
            }
        }
        if self.config.video_enabled && !self.camera_enabled {
            if let Err(e) = session.set_camera_enabled(false).await {
                tracing::warn!("could not hold back camera on new session: {e}");
            }
        }
        self.transport.set(session);

        let tx = self.internal_tx.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let input = match event {
                    TransportEvent::Connected => Input::TransportConnected { attempt },
                    TransportEvent::Disconnected { reason } => Input::TransportDisconnected { attempt, reason },
                    TransportEvent::Error(msg) => Input::TransportFailed {
                        attempt,
                        error: CallError::Connection(msg),
                    },
                };
                if tx.send(Internal::Lifecycle(input)).is_err() {
                    return;
                }
            }
            let _ = tx.send(Internal::Lifecycle(Input::TransportDisconnected {
                attempt,
                reason: "transport event stream closed".into(),
            }));
        }));
    }

    async fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let muted = !self.muted;
        if let Some(session) = self.transport.get() {
            session.set_microphone_enabled(!muted).await?;
        }
        self.muted = muted;
        tracing::info!(muted, "microphone mute toggled");

        let before = self.machine.state();
        self.publish(before);
        self.emitter.emit(CallEvent::MuteChanged(muted));
        Ok(muted)
    }

    async fn set_camera(&mut self, enabled: bool) -> Result<(), CallError> {
        if !self.config.video_enabled {
            return Err(CallError::InvalidState("call was started without video".into()));
        }
        if let Some(session) = self.transport.get() {
            session.set_camera_enabled(enabled).await?;
        }
        self.camera_enabled = enabled;
        tracing::info!(enabled, "camera toggled");

        let before = self.machine.state();
        self.publish(before);
        self.emitter.emit(CallEvent::CameraChanged(enabled));
        Ok(())
    }

    /// Abort in-flight work, close the transport and release capture.
    async fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(session) = self.transport.take() {
            session.disconnect().await;
        }
        self.lease = None;
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn session_id(&self) -> String {
        self.machine
            .session()
            .map(|s| s.session_id.clone())
            .unwrap_or_default()
    }

    fn publish(&self, before: ConnectionState) {
        let snapshot = CallSnapshot {
            state: self.machine.state(),
            error: self.machine.error().map(|e| CallErrorInfo {
                kind: e.kind(),
                message: e.to_string(),
            }),
            muted: self.muted,
            video_enabled: self.config.video_enabled,
            camera_enabled: self.config.video_enabled && self.camera_enabled,
            session: self.machine.session().cloned(),
        };
        let state = snapshot.state;
        self.snapshot_tx.send_replace(snapshot);

        if state != before {
            tracing::debug!(from = ?before, to = ?state, "call state changed");
            self.emitter.emit(CallEvent::StateChanged(state));
        }
    }
}
