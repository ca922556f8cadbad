//! In-memory stand-ins for the network, the media SDK and the OS capture
//! session, shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::capture::CaptureDevice;
use crate::errors::CallError;
use crate::events::{CallEvent, CallEventListener};
use crate::token::{Credential, CredentialSource};
use crate::transport::{
    I420Frame, PcmFrame, TransportConnector, TransportEvent, TransportEvents, TransportOptions,
    TransportSession,
};

/// Records every event a controller emits.
#[derive(Default)]
pub(crate) struct EventCapture {
    events: Mutex<Vec<CallEvent>>,
}

impl EventCapture {
    pub(crate) fn snapshot(&self) -> Vec<CallEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl CallEventListener for EventCapture {
    fn on_event(&self, event: CallEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub(crate) struct FakeCapture {
    fail: bool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    video: Mutex<Vec<bool>>,
}

impl FakeCapture {
    pub(crate) fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn video_requests(&self) -> Vec<bool> {
        self.video.lock().unwrap().clone()
    }
}

impl CaptureDevice for FakeCapture {
    fn start(&self, video: bool) -> Result<(), CallError> {
        if self.fail {
            return Err(CallError::Resource("microphone permission denied".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.video.lock().unwrap().push(video);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out scripted results in order, then fails.
pub(crate) struct FakeCredentials {
    results: Mutex<VecDeque<Result<String, CallError>>>,
    hang: bool,
    calls: AtomicUsize,
}

impl FakeCredentials {
    pub(crate) fn new(results: Vec<Result<String, CallError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn tokens(tokens: &[&str]) -> Self {
        Self::new(tokens.iter().map(|t| Ok(t.to_string())).collect())
    }

    /// Never answers.
    pub(crate) fn hanging() -> Self {
        Self { hang: true, ..Self::new(Vec::new()) }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialSource for FakeCredentials {
    fn acquire<'a>(
        &'a self,
        session_id: &'a str,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Credential, CallError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CallError::token_failure()));
        let hang = self.hang;

        Box::pin(async move {
            if hang {
                std::future::pending::<()>().await;
            }
            next.map(|token| Credential {
                token,
                issued_for_session_id: session_id.to_string(),
                issued_for_user_id: user_id.to_string(),
            })
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeSession {
    mic_calls: Mutex<Vec<bool>>,
    camera_calls: Mutex<Vec<bool>>,
    audio_frames: Mutex<Vec<PcmFrame>>,
    video_frames: Mutex<Vec<I420Frame>>,
    disconnects: AtomicUsize,
}

impl FakeSession {
    pub(crate) fn mic_calls(&self) -> Vec<bool> {
        self.mic_calls.lock().unwrap().clone()
    }

    pub(crate) fn camera_calls(&self) -> Vec<bool> {
        self.camera_calls.lock().unwrap().clone()
    }

    pub(crate) fn audio_frames(&self) -> Vec<PcmFrame> {
        self.audio_frames.lock().unwrap().clone()
    }

    pub(crate) fn video_frames(&self) -> Vec<I420Frame> {
        self.video_frames.lock().unwrap().clone()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl TransportSession for FakeSession {
    fn set_microphone_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<(), CallError>> {
        self.mic_calls.lock().unwrap().push(enabled);
        Box::pin(async { Ok(()) })
    }

    fn set_camera_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<(), CallError>> {
        self.camera_calls.lock().unwrap().push(enabled);
        Box::pin(async { Ok(()) })
    }

    fn push_audio_frame(&self, frame: PcmFrame) -> BoxFuture<'_, Result<(), CallError>> {
        self.audio_frames.lock().unwrap().push(frame);
        Box::pin(async { Ok(()) })
    }

    fn push_video_frame(&self, frame: I420Frame) -> Result<(), CallError> {
        self.video_frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }
}

/// Records connect requests and lets tests push transport events.
#[derive(Default)]
pub(crate) struct FakeConnector {
    auto_connect: bool,
    hang: bool,
    fail_with: Option<CallError>,
    options: Mutex<Vec<TransportOptions>>,
    sessions: Mutex<Vec<(Arc<FakeSession>, mpsc::UnboundedSender<TransportEvent>)>>,
}

impl FakeConnector {
    /// Emits `Connected` as soon as a session is opened.
    pub(crate) fn auto_connect() -> Self {
        Self { auto_connect: true, ..Self::default() }
    }

    /// Never finishes connecting.
    pub(crate) fn hanging() -> Self {
        Self { hang: true, ..Self::default() }
    }

    pub(crate) fn failing(error: CallError) -> Self {
        Self { fail_with: Some(error), ..Self::default() }
    }

    pub(crate) fn connects(&self) -> usize {
        self.options.lock().unwrap().len()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub(crate) fn last_options(&self) -> Option<TransportOptions> {
        self.options.lock().unwrap().last().cloned()
    }

    pub(crate) fn session(&self, index: usize) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[index].0.clone()
    }

    pub(crate) fn emit(&self, index: usize, event: TransportEvent) {
        self.sessions.lock().unwrap()[index].1.send(event).unwrap();
    }
}

impl TransportConnector for FakeConnector {
    fn connect(
        &self,
        options: TransportOptions,
    ) -> BoxFuture<'static, Result<(Arc<dyn TransportSession>, TransportEvents), CallError>> {
        self.options.lock().unwrap().push(options);

        if let Some(error) = self.fail_with.clone() {
            return Box::pin(async move { Err(error) });
        }
        if self.hang {
            return Box::pin(std::future::pending());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_connect {
            tx.send(TransportEvent::Connected).unwrap();
        }
        let session = Arc::new(FakeSession::default());
        self.sessions.lock().unwrap().push((session.clone(), tx));

        let session: Arc<dyn TransportSession> = session;
        Box::pin(async move { Ok((session, rx)) })
    }
}
