//! UniFFI bindings for mindful-core.
//!
//! Provides a MindfulClient object that wraps the sign-in gate, the token
//! requester and the call controller into a single FFI-safe interface.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use mindful_core::{
    self, AuthConfig, AuthProvider, AuthSession, CallConfig, CallController, CallHandle,
    CaptureArbiter, CaptureDevice, CallError as CoreCallError, GoTrueAuth, I420Frame, PcmFrame,
    TokenClient, TokenClientConfig, TokenRequester, TransportConnector,
    events::{
        CallErrorInfo as CoreCallErrorInfo, CallEvent as CoreCallEvent,
        ConnectionState as CoreConnectionState,
    },
};

uniffi::include_scaffolding!("mindful");

// ── Namespace functions ──────────────────────────────────────────────

/// Initialize tracing/logging. Call once from the host before using MindfulClient.
/// On Android, stderr goes to logcat for debuggable builds.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mindful_core=debug,mindful_ffi=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
    });
}

/// Fresh `breathing-<unix millis>` identifier for a new practice session.
fn new_session_id() -> String {
    mindful_core::CallSession::generate_id()
}

/// Build a [`ClientConfig`] from the process environment (`MINDFUL_*`,
/// `LIVEKIT_WS_URL` and `SUPABASE_*`), for debug builds and desktop runs.
fn client_config_from_env() -> Result<ClientConfig, MindfulError> {
    client_config_from_lookup(|key| std::env::var(key).ok())
}

fn client_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ClientConfig, MindfulError> {
    let call = CallConfig::from_lookup(&lookup)?;
    let auth = AuthConfig::from_lookup(&lookup)?;
    Ok(ClientConfig {
        backend_url: call.backend_url,
        server_address: call.server_address,
        video_enabled: call.video_enabled,
        auth_url: auth.auth_url,
        anon_key: auth.anon_key,
        acquire_timeout_secs: call.acquire_timeout_secs,
        connect_timeout_secs: call.connect_timeout_secs,
    })
}

// ── Android WebRTC initialization ────────────────────────────────────
// Called from MindfulApplication.onCreate() via System.loadLibrary +
// nativeInitWebrtc(). webrtc::InitAndroid needs the application class
// loader, which JNI_OnLoad does not have yet.

#[cfg(all(target_os = "android", feature = "livekit"))]
#[unsafe(no_mangle)]
pub extern "C" fn Java_app_mindful_MindfulApplication_nativeInitWebrtc(
    env: *mut std::ffi::c_void,
    _class: *mut std::ffi::c_void,
) {
    let env = match unsafe { jni::JNIEnv::from_raw(env as *mut jni::sys::JNIEnv) } {
        Ok(env) => env,
        Err(e) => {
            tracing::error!("nativeInitWebrtc: invalid JNIEnv: {e}");
            return;
        }
    };
    let jvm = match env.get_java_vm() {
        Ok(jvm) => jvm,
        Err(e) => {
            tracing::error!("nativeInitWebrtc: failed to get JavaVM: {e}");
            return;
        }
    };

    libwebrtc::android::initialize_android(&jvm);

    // Dropping the handle would call DestroyJavaVM.
    std::mem::forget(jvm);
    tracing::info!("WebRTC initialized for Android");
}

// ── FFI-safe type conversions ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    AcquiringCredential,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl From<CoreConnectionState> for ConnectionState {
    fn from(s: CoreConnectionState) -> Self {
        match s {
            CoreConnectionState::Idle => Self::Idle,
            CoreConnectionState::AcquiringCredential => Self::AcquiringCredential,
            CoreConnectionState::Connecting => Self::Connecting,
            CoreConnectionState::Connected => Self::Connected,
            CoreConnectionState::Disconnected => Self::Disconnected,
            CoreConnectionState::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Acquisition,
    Connection,
    Resource,
    InvalidState,
    Auth,
    Http,
}

impl From<mindful_core::ErrorKind> for ErrorKind {
    fn from(k: mindful_core::ErrorKind) -> Self {
        match k {
            mindful_core::ErrorKind::InvalidInput => Self::InvalidInput,
            mindful_core::ErrorKind::Acquisition => Self::Acquisition,
            mindful_core::ErrorKind::Connection => Self::Connection,
            mindful_core::ErrorKind::Resource => Self::Resource,
            mindful_core::ErrorKind::InvalidState => Self::InvalidState,
            mindful_core::ErrorKind::Auth => Self::Auth,
            mindful_core::ErrorKind::Http => Self::Http,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<CoreCallErrorInfo> for CallErrorInfo {
    fn from(e: CoreCallErrorInfo) -> Self {
        Self {
            kind: e.kind.into(),
            message: e.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: ConnectionState,
    pub error: Option<CallErrorInfo>,
    pub muted: bool,
    pub video_enabled: bool,
    pub camera_enabled: bool,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl From<mindful_core::CallSnapshot> for CallSnapshot {
    fn from(s: mindful_core::CallSnapshot) -> Self {
        let (session_id, user_id) = match s.session {
            Some(session) => (Some(session.session_id), Some(session.user_id)),
            None => (None, None),
        };
        Self {
            state: s.state.into(),
            error: s.error.map(CallErrorInfo::from),
            muted: s.muted,
            video_enabled: s.video_enabled,
            camera_enabled: s.camera_enabled,
            session_id,
            user_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequestState {
    pub token: Option<String>,
    pub error: Option<String>,
    pub is_loading: bool,
}

impl From<mindful_core::TokenRequestState> for TokenRequestState {
    fn from(s: mindful_core::TokenRequestState) -> Self {
        Self {
            token: s.token,
            error: s.error,
            is_loading: s.is_loading,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend_url: String,
    pub server_address: String,
    pub video_enabled: bool,
    pub auth_url: String,
    pub anon_key: String,
    pub acquire_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl ClientConfig {
    fn call_config(&self) -> CallConfig {
        CallConfig {
            backend_url: self.backend_url.clone(),
            server_address: self.server_address.clone(),
            video_enabled: self.video_enabled,
            acquire_timeout_secs: self.acquire_timeout_secs,
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

/// Sign-in state the host persists between launches (Keychain / Keystore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub user_id: String,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
}

impl From<AuthSession> for StoredSession {
    fn from(s: AuthSession) -> Self {
        Self {
            user_id: s.user_id,
            email: s.email,
            access_token: s.access_token,
            refresh_token: s.refresh_token,
            expires_at: s.expires_at,
        }
    }
}

impl From<StoredSession> for AuthSession {
    fn from(s: StoredSession) -> Self {
        Self {
            user_id: s.user_id,
            email: s.email,
            access_token: s.access_token,
            refresh_token: s.refresh_token,
            expires_at: s.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    SignedIn { user_id: String },
    ConfirmationPending { email: String },
}

impl From<mindful_core::SignUpOutcome> for SignUpOutcome {
    fn from(o: mindful_core::SignUpOutcome) -> Self {
        match o {
            mindful_core::SignUpOutcome::SignedIn(session) => Self::SignedIn {
                user_id: session.user_id,
            },
            mindful_core::SignUpOutcome::ConfirmationPending { email } => {
                Self::ConfirmationPending { email }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged { state: ConnectionState },
    Connected { session_id: String },
    Disconnected { session_id: String },
    MuteChanged { muted: bool },
    CameraChanged { enabled: bool },
    Error { error: CallErrorInfo },
}

impl From<CoreCallEvent> for CallEvent {
    fn from(e: CoreCallEvent) -> Self {
        match e {
            CoreCallEvent::StateChanged(state) => Self::StateChanged { state: state.into() },
            CoreCallEvent::Connected { session_id } => Self::Connected { session_id },
            CoreCallEvent::Disconnected { session_id } => Self::Disconnected { session_id },
            CoreCallEvent::MuteChanged(muted) => Self::MuteChanged { muted },
            CoreCallEvent::CameraChanged(enabled) => Self::CameraChanged { enabled },
            CoreCallEvent::Error(error) => Self::Error { error: error.into() },
        }
    }
}

// ── Error conversion ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MindfulError {
    #[error("Invalid input: {msg}")]
    InvalidInput { msg: String },
    #[error("{msg}")]
    Acquisition { msg: String },
    #[error("Connection error: {msg}")]
    Connection { msg: String },
    #[error("Capture unavailable: {msg}")]
    Resource { msg: String },
    #[error("Invalid state: {msg}")]
    InvalidState { msg: String },
    #[error("Auth error: {msg}")]
    Auth { msg: String },
    #[error("HTTP error: {msg}")]
    Http { msg: String },
}

impl From<CoreCallError> for MindfulError {
    fn from(e: CoreCallError) -> Self {
        tracing::error!("MindfulError: {e}");
        match e {
            CoreCallError::InvalidInput(msg) => Self::InvalidInput { msg },
            CoreCallError::Acquisition(msg) => Self::Acquisition { msg },
            CoreCallError::Connection(msg) => Self::Connection { msg },
            CoreCallError::Resource(msg) => Self::Resource { msg },
            CoreCallError::InvalidState(msg) => Self::InvalidState { msg },
            CoreCallError::Auth(msg) => Self::Auth { msg },
            CoreCallError::Http(msg) => Self::Http { msg },
        }
    }
}

// ── Callback interfaces ───────────────────────────────────────────────

pub trait CallEventListener: Send + Sync {
    fn on_event(&self, event: CallEvent);
}

/// The host's audio session (AVAudioSession / AudioRecord + focus).
pub trait CaptureDelegate: Send + Sync {
    /// Returns false when the OS refused (permission, interruption).
    fn start_capture(&self, video: bool) -> bool;
    fn stop_capture(&self);
}

// ── Bridges: FFI callback → core trait ────────────────────────────────

struct BridgeListener {
    ffi_listener: Arc<dyn CallEventListener>,
}

impl mindful_core::CallEventListener for BridgeListener {
    fn on_event(&self, event: CoreCallEvent) {
        self.ffi_listener.on_event(event.into());
    }
}

struct BridgeCapture {
    delegate: Box<dyn CaptureDelegate>,
}

impl CaptureDevice for BridgeCapture {
    fn start(&self, video: bool) -> Result<(), CoreCallError> {
        if self.delegate.start_capture(video) {
            Ok(())
        } else {
            Err(CoreCallError::Resource("host refused to start capture".into()))
        }
    }

    fn stop(&self) {
        self.delegate.stop_capture();
    }
}

#[cfg(feature = "livekit")]
fn transport() -> Arc<dyn TransportConnector> {
    Arc::new(mindful_core::LiveKitConnector)
}

#[cfg(not(feature = "livekit"))]
fn transport() -> Arc<dyn TransportConnector> {
    Arc::new(NoTransport)
}

/// Stand-in for builds without the media SDK; every connect fails.
#[cfg(not(feature = "livekit"))]
struct NoTransport;

#[cfg(not(feature = "livekit"))]
impl TransportConnector for NoTransport {
    fn connect(
        &self,
        _options: mindful_core::TransportOptions,
    ) -> futures_util::future::BoxFuture<
        'static,
        Result<(Arc<dyn mindful_core::TransportSession>, mindful_core::transport::TransportEvents), CoreCallError>,
    > {
        Box::pin(async {
            Err(CoreCallError::Connection(
                "built without the livekit transport".into(),
            ))
        })
    }
}

// ── MindfulClient: main FFI object ────────────────────────────────────

pub struct MindfulClient {
    config: CallConfig,
    auth: Arc<GoTrueAuth>,
    gate: mindful_core::AuthGate,
    token_client: Arc<TokenClient>,
    requester: TokenRequester,
    connector: Arc<dyn TransportConnector>,
    capture: CaptureArbiter,
    emitter: mindful_core::EventEmitter,
    call: StdMutex<Option<Arc<CallHandle>>>,
    rt: tokio::runtime::Runtime,
}

impl MindfulClient {
    pub fn new(config: ClientConfig, capture: Box<dyn CaptureDelegate>) -> Result<Self, MindfulError> {
        tracing::info!(backend = %config.backend_url, video = config.video_enabled, "creating MindfulClient");
        let rt = tokio::runtime::Runtime::new().map_err(|e| MindfulError::InvalidState {
            msg: format!("failed to create tokio runtime: {e}"),
        })?;

        let call_config = config.call_config();
        call_config.validate()?;

        let auth = Arc::new(GoTrueAuth::new(mindful_core::AuthConfig::new(
            config.auth_url,
            config.anon_key,
        ))?);
        let gate = mindful_core::AuthGate::new(auth.clone());
        let token_client = Arc::new(TokenClient::new(TokenClientConfig::new(
            call_config.backend_url.clone(),
        ))?);
        let requester = TokenRequester::new(token_client.clone());

        Ok(Self {
            config: call_config,
            auth,
            gate,
            token_client,
            requester,
            connector: transport(),
            capture: CaptureArbiter::new(Arc::new(BridgeCapture { delegate: capture })),
            emitter: mindful_core::EventEmitter::new(),
            call: StdMutex::new(None),
            rt,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.auth.current_session().map(|s| s.user_id)
    }

    /// The session to persist, or `None` when signed out or expired.
    pub fn current_session(&self) -> Option<StoredSession> {
        self.auth.current_session().map(StoredSession::from)
    }

    /// Reinstate a session saved by an earlier launch. An expired session is
    /// kept but does not count as signed in.
    pub fn restore_session(&self, session: StoredSession) {
        tracing::info!(user_id = %session.user_id, "restoring saved session");
        self.auth.restore_session(session.into());
    }

    /// Returns the signed-in user's id.
    pub fn sign_in(&self, email: String, password: String) -> Result<String, MindfulError> {
        let session = self.rt.block_on(self.auth.sign_in(&email, &password))?;
        Ok(session.user_id)
    }

    pub fn sign_up(&self, email: String, password: String) -> Result<SignUpOutcome, MindfulError> {
        let outcome = self.rt.block_on(self.auth.sign_up(&email, &password))?;
        Ok(outcome.into())
    }

    /// Signing out ends any live call first.
    pub fn sign_out(&self) -> Result<(), MindfulError> {
        self.end_call()?;
        self.rt.block_on(self.auth.sign_out())?;
        Ok(())
    }

    /// Fetch a token for display; the outcome is also kept in [`Self::token_state`].
    pub fn request_token(&self, session_id: String, user_id: String) -> TokenRequestState {
        if let Err(e) = self.rt.block_on(self.requester.request(&session_id, &user_id)) {
            tracing::warn!(session_id, "token request failed: {e}");
        }
        self.requester.state().into()
    }

    pub fn token_state(&self) -> TokenRequestState {
        self.requester.state().into()
    }

    pub fn start_call(&self, session_id: String, user_id: String) -> Result<(), MindfulError> {
        self.gate.require_authenticated()?;

        let handle = {
            let mut slot = self.lock_call();
            if let Some(existing) = slot.as_ref() {
                let state = existing.state();
                if state.is_live() {
                    return Err(MindfulError::InvalidState {
                        msg: format!("a call is already {state:?}"),
                    });
                }
            }
            let previous = slot.take();
            let handle = Arc::new(self.spawn_controller());
            *slot = Some(handle.clone());
            drop(slot);

            if let Some(previous) = previous {
                self.finish(previous);
            }
            handle
        };

        self.rt.block_on(handle.start(session_id, user_id))?;
        Ok(())
    }

    pub fn retry_call(&self) -> Result<(), MindfulError> {
        let handle = self.current_call().ok_or_else(|| MindfulError::InvalidState {
            msg: "no call to retry".into(),
        })?;
        self.rt.block_on(handle.retry())?;
        Ok(())
    }

    /// Hang up. Also used when the user navigates away from the call screen.
    pub fn end_call(&self) -> Result<(), MindfulError> {
        let Some(handle) = self.current_call() else {
            return Ok(());
        };
        self.rt.block_on(handle.end_call())?;
        Ok(())
    }

    pub fn toggle_mute(&self) -> Result<bool, MindfulError> {
        let handle = self.current_call().ok_or_else(|| MindfulError::InvalidState {
            msg: "no active call".into(),
        })?;
        Ok(self.rt.block_on(handle.toggle_mute())?)
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), MindfulError> {
        let handle = self.current_call().ok_or_else(|| MindfulError::InvalidState {
            msg: "no active call".into(),
        })?;
        self.rt.block_on(handle.set_camera_enabled(enabled))?;
        Ok(())
    }

    /// Feed interleaved 16-bit PCM from the host's microphone into the call.
    /// Returns false when no transport is up yet and the buffer was dropped.
    pub fn push_audio_frame(&self, samples: Vec<i16>, sample_rate: u32, channels: u32) -> Result<bool, MindfulError> {
        let Some(handle) = self.current_call() else {
            return Ok(false);
        };
        let frame = PcmFrame { samples, sample_rate, channels };
        Ok(self.rt.block_on(handle.push_audio_frame(frame))?)
    }

    /// Feed one I420 camera frame into the call. Same return contract as
    /// [`Self::push_audio_frame`].
    pub fn push_video_frame(
        &self,
        width: u32,
        height: u32,
        y: Vec<u8>,
        u: Vec<u8>,
        v: Vec<u8>,
        rotation_degrees: u32,
    ) -> Result<bool, MindfulError> {
        let Some(handle) = self.current_call() else {
            return Ok(false);
        };
        let frame = I420Frame { width, height, y, u, v, rotation_degrees };
        Ok(handle.push_video_frame(frame)?)
    }

    pub fn call_state(&self) -> CallSnapshot {
        match self.current_call() {
            Some(handle) => handle.snapshot().into(),
            None => CallSnapshot {
                state: ConnectionState::Idle,
                error: None,
                muted: false,
                video_enabled: self.config.video_enabled,
                camera_enabled: self.config.video_enabled,
                session_id: None,
                user_id: None,
            },
        }
    }

    pub fn add_listener(&self, listener: Box<dyn CallEventListener>) {
        let bridge = Arc::new(BridgeListener {
            ffi_listener: Arc::from(listener),
        });
        self.emitter.add_listener(bridge);
    }

    fn spawn_controller(&self) -> CallHandle {
        let _guard = self.rt.enter();
        CallController::new(
            self.config.clone(),
            self.token_client.clone(),
            self.connector.clone(),
            self.capture.clone(),
        )
        .with_emitter(self.emitter.clone())
        .spawn()
    }

    // The lock is never held across block_on: listeners run on runtime
    // threads and may call back into the client.
    fn current_call(&self) -> Option<Arc<CallHandle>> {
        self.lock_call().clone()
    }

    fn lock_call(&self) -> std::sync::MutexGuard<'_, Option<Arc<CallHandle>>> {
        self.call.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, handle: Arc<CallHandle>) {
        // Other holders keep the controller alive; it stops when the last one drops.
        if let Ok(handle) = Arc::try_unwrap(handle) {
            if tokio::runtime::Handle::try_current().is_ok() {
                drop(handle);
            } else {
                self.rt.block_on(handle.shutdown());
            }
        }
    }
}

impl Drop for MindfulClient {
    fn drop(&mut self) {
        let call = self.lock_call().take();
        if let Some(handle) = call {
            self.finish(handle);
        }
    }
}
