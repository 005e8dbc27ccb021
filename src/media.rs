//! Media collaborators: local capture and remote rendering
//!
//! The room never touches devices or surfaces itself. It asks a [`MediaCapture`] for local tracks
//! once before joining and hands inbound streams to a [`Renderer`].

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::peer::types::ParticipantKey;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Unspecified,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Unspecified,
        }
    }
}

/// Stops a sample writer task when the last copy of its tracks is dropped
struct Feeder(JoinHandle<()>);

impl Drop for Feeder {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Local audio/video tracks seeded into every new peer connection
#[derive(Clone, Default)]
pub struct LocalTracks {
    tracks: Vec<Arc<TrackLocalStaticSample>>,
    feeder: Option<Arc<Feeder>>,
}

impl LocalTracks {
    pub fn new(tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self {
            tracks,
            feeder: None,
        }
    }

    /// Ties `task` to these tracks; it is aborted once every clone is gone
    pub fn with_feeder(mut self, task: JoinHandle<()>) -> Self {
        self.feeder = Some(Arc::new(Feeder(task)));
        self
    }

    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tracks.iter().map(|t| (t.id().to_string(), t.kind())))
            .finish()
    }
}

/// Process-wide local media, written once when capture finishes
#[derive(Debug, Default)]
pub struct LocalMedia {
    cell: OnceCell<Option<LocalTracks>>,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the capture outcome; `None` records receive-only mode. Returns false if already set.
    pub fn set(&self, tracks: Option<LocalTracks>) -> bool {
        self.cell.set(tracks).is_ok()
    }

    /// Tracks to attach to a new connection, if capture succeeded
    pub fn tracks(&self) -> Option<&LocalTracks> {
        self.cell.get().and_then(|t| t.as_ref())
    }

    pub fn is_settled(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Runs `capture` and records the result. Failure degrades to receive-only.
    pub async fn acquire_from(&self, capture: &dyn MediaCapture) {
        match capture.acquire_local_tracks().await {
            Ok(tracks) => {
                info!(tracks = tracks.len(), "local media acquired");
                self.set(Some(tracks));
            }
            Err(e) => {
                warn!("continuing receive-only: {}", e);
                self.set(None);
            }
        }
    }
}

/// Inbound remote stream as surfaced by the peer-connection engine
#[derive(Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl RemoteStream {
    pub fn from_track(track: Arc<TrackRemote>) -> Self {
        Self {
            stream_id: track.stream_id(),
            track_id: track.id(),
            kind: track.kind().into(),
            track: Some(track),
        }
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Fails with [`Error::MediaAcquisition`](crate::Error::MediaAcquisition) when the device is
    /// missing or permission is denied
    async fn acquire_local_tracks(&self) -> Result<LocalTracks>;
}

pub trait Renderer: Send + Sync {
    fn attach_remote_stream(&self, peer: &ParticipantKey, stream: RemoteStream);

    /// Surface for `peer` is no longer backed by a connection
    fn detach_remote_stream(&self, peer: &ParticipantKey);
}

/// Renderer that only logs; used by the demo binary
#[derive(Debug, Default)]
pub struct LoggingRenderer;

impl Renderer for LoggingRenderer {
    fn attach_remote_stream(&self, peer: &ParticipantKey, stream: RemoteStream) {
        info!(%peer, ?stream, "remote stream attached");
    }

    fn detach_remote_stream(&self, peer: &ParticipantKey) {
        info!(%peer, "remote stream detached");
    }
}

/// Opus silence frame
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Capture backed by generated tracks: an Opus track fed silence and an idle VP8 track
#[derive(Debug, Default)]
pub struct SyntheticCapture {
    pub stream_id: String,
}

impl SyntheticCapture {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire_local_tracks(&self) -> Result<LocalTracks> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            self.stream_id.clone(),
        ));

        let feed = audio.clone();
        let feeder = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUDIO_FRAME);
            loop {
                ticker.tick().await;
                let sample = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE),
                    duration: AUDIO_FRAME,
                    ..Default::default()
                };
                if feed.write_sample(&sample).await.is_err() {
                    break;
                }
            }
        });

        Ok(LocalTracks::new(vec![audio, video]).with_feeder(feeder))
    }
}
