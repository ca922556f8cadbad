//! LiveKit implementation of the transport seam.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use livekit::options::{AudioEncoding, TrackPublishOptions, VideoEncoding};
use livekit::prelude::{
    LocalAudioTrack, LocalTrack, LocalVideoTrack, Room, RoomEvent, RoomOptions,
};
use livekit::track::TrackSource as LkTrackSource;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::prelude::*;
use livekit::webrtc::video_source::native::NativeVideoSource;
use tokio::sync::mpsc;

use crate::errors::CallError;
use crate::transport::{
    I420Frame, PcmFrame, PresetSettings, TransportConnector, TransportEvent, TransportEvents,
    TransportOptions, TransportSession,
};

/// Internal audio format used by LiveKit (48kHz mono).
const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 1;
const AUDIO_QUEUE_SIZE_MS: u32 = 100;

/// Opens LiveKit rooms.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveKitConnector;

impl TransportConnector for LiveKitConnector {
    fn connect(
        &self,
        options: TransportOptions,
    ) -> BoxFuture<'static, Result<(Arc<dyn TransportSession>, TransportEvents), CallError>> {
        Box::pin(async move {
            let (session, events) = LiveKitSession::connect(options).await?;
            let session: Arc<dyn TransportSession> = Arc::new(session);
            Ok((session, events))
        })
    }
}

/// A connected LiveKit room with the local tracks we published.
///
/// Host capture frames arrive through [`TransportSession::push_audio_frame`]
/// and [`TransportSession::push_video_frame`].
pub struct LiveKitSession {
    room: Arc<Room>,
    audio_source: Option<NativeAudioSource>,
    video_source: Option<NativeVideoSource>,
}

impl LiveKitSession {
    pub async fn connect(options: TransportOptions) -> Result<(Self, TransportEvents), CallError> {
        let preset = options.preset.settings();

        let mut room_options = RoomOptions::default();
        room_options.auto_subscribe = true;
        room_options.adaptive_stream = preset.adaptive_stream;
        room_options.dynacast = preset.dynacast;

        tracing::info!(server = %options.server_address, ?preset, "connecting to LiveKit");
        let (room, room_events) = Room::connect(&options.server_address, &options.token, room_options)
            .await
            .map_err(|e| CallError::Connection(e.to_string()))?;
        let room = Arc::new(room);

        let mut session = Self {
            room,
            audio_source: None,
            video_source: None,
        };

        if let Err(e) = session.publish(&options, &preset).await {
            session.close().await;
            return Err(e);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connected);
        tokio::spawn(forward_room_events(room_events, tx));

        Ok((session, rx))
    }

    async fn publish(&mut self, options: &TransportOptions, preset: &PresetSettings) -> Result<(), CallError> {
        let local = self.room.local_participant();

        if options.audio {
            let source = NativeAudioSource::new(
                AudioSourceOptions {
                    echo_cancellation: true,
                    noise_suppression: true,
                    auto_gain_control: true,
                },
                AUDIO_SAMPLE_RATE,
                AUDIO_CHANNELS,
                AUDIO_QUEUE_SIZE_MS,
            );
            let track = LocalAudioTrack::create_audio_track("microphone", RtcAudioSource::Native(source.clone()));

            local
                .publish_track(
                    LocalTrack::Audio(track),
                    TrackPublishOptions {
                        source: LkTrackSource::Microphone,
                        audio_encoding: Some(AudioEncoding {
                            max_bitrate: preset.audio_max_bitrate,
                        }),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| CallError::Connection(format!("publish audio: {e}")))?;
            self.audio_source = Some(source);
            tracing::info!("microphone track published");
        }

        if let (true, Some(video)) = (options.video, preset.video) {
            let source = NativeVideoSource::new(
                VideoResolution {
                    width: video.capture.width,
                    height: video.capture.height,
                },
                false,
            );
            let track = LocalVideoTrack::create_video_track("camera", RtcVideoSource::Native(source.clone()));

            // The SDK derives the lower simulcast tiers from the capture
            // resolution; for 720p those are the h180/h360 layers of the preset.
            local
                .publish_track(
                    LocalTrack::Video(track),
                    TrackPublishOptions {
                        source: LkTrackSource::Camera,
                        simulcast: preset.simulcast,
                        video_encoding: Some(VideoEncoding {
                            max_bitrate: video.capture.max_bitrate,
                            max_framerate: video.capture.max_framerate,
                        }),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| CallError::Connection(format!("publish video: {e}")))?;
            self.video_source = Some(source);
            tracing::info!("camera track published");
        }

        Ok(())
    }

    fn set_source_enabled(&self, source: LkTrackSource, enabled: bool) {
        let local = self.room.local_participant();
        for (_, publication) in local.track_publications() {
            if publication.source() == source {
                if enabled {
                    publication.unmute();
                } else {
                    publication.mute();
                }
                break;
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.room.close().await {
            tracing::warn!("error closing room: {e}");
        }
    }
}

impl TransportSession for LiveKitSession {
    fn set_microphone_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(async move {
            self.set_source_enabled(LkTrackSource::Microphone, enabled);
            tracing::info!("microphone enabled: {enabled}");
            Ok(())
        })
    }

    fn set_camera_enabled(&self, enabled: bool) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(async move {
            if self.video_source.is_none() {
                return Err(CallError::InvalidState("no camera track in this call".into()));
            }
            self.set_source_enabled(LkTrackSource::Camera, enabled);
            tracing::info!("camera enabled: {enabled}");
            Ok(())
        })
    }

    fn push_audio_frame(&self, frame: PcmFrame) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(async move {
            let Some(source) = self.audio_source.as_ref() else {
                return Err(CallError::InvalidState("no microphone track in this call".into()));
            };
            let samples_per_channel = frame.samples_per_channel();
            let frame = AudioFrame {
                data: frame.samples.into(),
                sample_rate: frame.sample_rate,
                num_channels: frame.channels,
                samples_per_channel,
            };
            source
                .capture_frame(&frame)
                .await
                .map_err(|e| CallError::Connection(format!("capture audio frame: {e}")))
        })
    }

    fn push_video_frame(&self, frame: I420Frame) -> Result<(), CallError> {
        let Some(source) = self.video_source.as_ref() else {
            return Err(CallError::InvalidState("no camera track in this call".into()));
        };

        let (chroma_w, _) = frame.chroma_size();
        let mut buffer = I420Buffer::new(frame.width, frame.height);
        let (stride_y, stride_u, stride_v) = buffer.strides();
        let (y_dst, u_dst, v_dst) = buffer.data_mut();
        copy_plane(&frame.y, frame.width as usize, y_dst, stride_y as usize);
        copy_plane(&frame.u, chroma_w, u_dst, stride_u as usize);
        copy_plane(&frame.v, chroma_w, v_dst, stride_v as usize);

        let rotation = match frame.rotation_degrees {
            90 => VideoRotation::VideoRotation90,
            180 => VideoRotation::VideoRotation180,
            270 => VideoRotation::VideoRotation270,
            _ => VideoRotation::VideoRotation0,
        };
        source.capture_frame(&VideoFrame {
            rotation,
            timestamp_us: 0,
            buffer,
        });
        Ok(())
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }
}

/// Copy a packed plane row by row into a strided destination.
fn copy_plane(src: &[u8], width: usize, dst: &mut [u8], stride: usize) {
    for (row, line) in src.chunks_exact(width).enumerate() {
        let start = row * stride;
        dst[start..start + width].copy_from_slice(line);
    }
}

async fn forward_room_events(
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
    tx: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RoomEvent::Disconnected { reason } => {
                tracing::info!("room disconnected: {reason:?}");
                let _ = tx.send(TransportEvent::Disconnected {
                    reason: format!("{reason:?}"),
                });
                break;
            }
            RoomEvent::Reconnecting => tracing::info!("room reconnecting"),
            RoomEvent::Reconnected => tracing::info!("room reconnected"),
            _ => tracing::debug!("unhandled room event: {event:?}"),
        }
    }
    tracing::info!("room event loop ended");
}
