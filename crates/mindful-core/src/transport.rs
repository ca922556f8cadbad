//! Boundary between the call controller and the real-time media SDK.
//!
//! The controller never talks to an SDK directly. It asks a
//! [`TransportConnector`] for a session, then drives that session through the
//! small [`TransportSession`] surface while consuming [`TransportEvent`]s.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::errors::CallError;

/// Lifecycle events raised by a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Error(String),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// What the transport is given when a call enters `Connecting`.
#[derive(Clone, PartialEq)]
pub struct TransportOptions {
    pub server_address: String,
    pub token: String,
    pub audio: bool,
    pub video: bool,
    pub preset: PublishPreset,
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("server_address", &self.server_address)
            .field("token", &"[REDACTED]")
            .field("audio", &self.audio)
            .field("video", &self.video)
            .field("preset", &self.preset)
            .finish()
    }
}

/// Interleaved signed 16-bit PCM from the host's microphone.
#[derive(Clone, PartialEq, Eq)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u32,
}

impl PcmFrame {
    pub fn samples_per_channel(&self) -> u32 {
        (self.samples.len() / self.channels.max(1) as usize) as u32
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(CallError::InvalidInput(
                "audio frame needs a sample rate and at least one channel".into(),
            ));
        }
        if self.samples.is_empty() || self.samples.len() % self.channels as usize != 0 {
            return Err(CallError::InvalidInput(format!(
                "{} samples do not split into {} channels",
                self.samples.len(),
                self.channels
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for PcmFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmFrame")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

/// Tightly packed planar I420 frame from the host's camera.
/// Chroma planes are half size, rounded up.
#[derive(Clone, PartialEq, Eq)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub rotation_degrees: u32,
}

impl I420Frame {
    pub fn chroma_size(&self) -> (usize, usize) {
        (self.width.div_ceil(2) as usize, self.height.div_ceil(2) as usize)
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.width == 0 || self.height == 0 {
            return Err(CallError::InvalidInput("video frame has no pixels".into()));
        }
        let luma = self.width as usize * self.height as usize;
        let (cw, ch) = self.chroma_size();
        if self.y.len() != luma || self.u.len() != cw * ch || self.v.len() != cw * ch {
            return Err(CallError::InvalidInput(format!(
                "plane sizes {}/{}/{} do not match a {}x{} I420 frame",
                self.y.len(),
                self.u.len(),
                self.v.len(),
                self.width,
                self.height
            )));
        }
        if !matches!(self.rotation_degrees, 0 | 90 | 180 | 270) {
            return Err(CallError::InvalidInput(format!(
                "unsupported rotation {}",
                self.rotation_degrees
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for I420Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I420Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rotation_degrees", &self.rotation_degrees)
            .finish_non_exhaustive()
    }
}

/// A live connection to one session.
pub trait TransportSession: Send + Sync {
    /// Stop or resume publishing the local audio track.
    fn set_microphone_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<(), CallError>>;

    /// Stop or resume publishing the local video track.
    fn set_camera_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<(), CallError>>;

    /// Feed one captured microphone frame into the published audio track.
    fn push_audio_frame(&self, frame: PcmFrame) -> BoxFuture<'_, Result<(), CallError>>;

    /// Feed one captured camera frame into the published video track.
    fn push_video_frame(&self, frame: I420Frame) -> Result<(), CallError>;

    fn disconnect(&self) -> BoxFuture<'_, ()>;
}

/// Opens transport sessions.
pub trait TransportConnector: Send + Sync {
    fn connect(
        &self,
        options: TransportOptions,
    ) -> BoxFuture<'static, Result<(Arc<dyn TransportSession>, TransportEvents), CallError>>;
}

/// Fixed publish configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPreset {
    /// Voice and breathing sessions: one low-bitrate audio track, no simulcast.
    AudioOnly,
    /// General video calls: audio plus a camera track in two simulcast tiers.
    AudioVideo,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetSettings {
    pub adaptive_stream: bool,
    pub dynacast: bool,
    pub simulcast: bool,
    pub audio_max_bitrate: u64,
    pub video: Option<VideoPreset>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoPreset {
    pub capture: VideoLayer,
    pub simulcast_layers: [VideoLayer; 2],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoLayer {
    pub width: u32,
    pub height: u32,
    pub max_bitrate: u64,
    pub max_framerate: f64,
}

const AUDIO_MAX_BITRATE: u64 = 64_000;

const CAPTURE_720: VideoLayer = VideoLayer {
    width: 1280,
    height: 720,
    max_bitrate: 1_700_000,
    max_framerate: 30.0,
};

const LAYER_180: VideoLayer = VideoLayer {
    width: 320,
    height: 180,
    max_bitrate: 160_000,
    max_framerate: 15.0,
};

const LAYER_360: VideoLayer = VideoLayer {
    width: 640,
    height: 360,
    max_bitrate: 450_000,
    max_framerate: 20.0,
};

impl PublishPreset {
    pub fn settings(self) -> PresetSettings {
        match self {
            Self::AudioOnly => PresetSettings {
                adaptive_stream: false,
                dynacast: true,
                simulcast: false,
                audio_max_bitrate: AUDIO_MAX_BITRATE,
                video: None,
            },
            Self::AudioVideo => PresetSettings {
                adaptive_stream: true,
                dynacast: true,
                simulcast: true,
                audio_max_bitrate: AUDIO_MAX_BITRATE,
                video: Some(VideoPreset {
                    capture: CAPTURE_720,
                    simulcast_layers: [LAYER_180, LAYER_360],
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_only_has_no_video_and_no_simulcast() {
        let s = PublishPreset::AudioOnly.settings();
        assert!(!s.simulcast);
        assert!(!s.adaptive_stream);
        assert!(s.dynacast);
        assert_eq!(s.audio_max_bitrate, 64_000);
        assert!(s.video.is_none());
    }

    #[test]
    fn audio_video_publishes_two_tiers_below_capture() {
        let s = PublishPreset::AudioVideo.settings();
        assert!(s.simulcast);
        let video = s.video.unwrap();
        for layer in video.simulcast_layers {
            assert!(layer.height < video.capture.height);
            assert!(layer.max_bitrate < video.capture.max_bitrate);
        }
        assert!(video.simulcast_layers[0].height < video.simulcast_layers[1].height);
    }

    fn frame(width: u32, height: u32) -> I420Frame {
        let (cw, ch) = (width.div_ceil(2) as usize, height.div_ceil(2) as usize);
        I420Frame {
            width,
            height,
            y: vec![16; (width * height) as usize],
            u: vec![128; cw * ch],
            v: vec![128; cw * ch],
            rotation_degrees: 0,
        }
    }

    #[test]
    fn pcm_frame_must_split_into_channels() {
        let stereo = PcmFrame { samples: vec![0; 960], sample_rate: 48_000, channels: 2 };
        assert!(stereo.validate().is_ok());
        assert_eq!(stereo.samples_per_channel(), 480);

        let odd = PcmFrame { samples: vec![0; 7], sample_rate: 48_000, channels: 2 };
        assert!(matches!(odd.validate(), Err(CallError::InvalidInput(_))));

        let silent = PcmFrame { samples: vec![0; 480], sample_rate: 48_000, channels: 0 };
        assert!(silent.validate().is_err());
    }

    #[test]
    fn i420_frame_checks_plane_sizes() {
        assert!(frame(1280, 720).validate().is_ok());
        // Odd dimensions round the chroma planes up.
        assert!(frame(641, 361).validate().is_ok());

        let mut short = frame(640, 360);
        short.v.pop();
        assert!(matches!(short.validate(), Err(CallError::InvalidInput(_))));

        let mut tilted = frame(640, 360);
        tilted.rotation_degrees = 45;
        assert!(tilted.validate().is_err());
    }

    #[test]
    fn frame_debug_omits_pixels() {
        let debug = format!("{:?}", frame(2, 2));
        assert!(debug.contains("width: 2"));
        assert!(!debug.contains("128"));
    }

    #[test]
    fn options_debug_redacts_token() {
        let opts = TransportOptions {
            server_address: "wss://lk.example.com".into(),
            token: "secret.jwt.value".into(),
            audio: true,
            video: false,
            preset: PublishPreset::AudioOnly,
        };
        let debug = format!("{opts:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret.jwt.value"));
    }
}
