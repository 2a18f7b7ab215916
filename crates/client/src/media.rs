use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::peer;

/// A single opus frame of silence. Keeps the audio RTP stream alive when no
/// real capture device feeds the track.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// The outgoing media for a call: one audio track plus the video source
/// currently selected. Video sources are named so the far side can tell a
/// camera feed from a screen feed after a mid-call swap.
pub struct MediaSources {
    pub audio: Arc<TrackLocalStaticSample>,
    pub camera: Arc<TrackLocalStaticSample>,
}

impl MediaSources {
    pub fn new() -> Self {
        Self {
            audio: peer::new_audio_track(),
            camera: peer::new_video_track("camera"),
        }
    }

    pub fn screen_track(&self) -> Arc<TrackLocalStaticSample> {
        peer::new_video_track("screen")
    }
}

impl Default for MediaSources {
    fn default() -> Self {
        Self::new()
    }
}

/// Feed 20ms silence frames into the audio track for the lifetime of the
/// returned handle. Abort it on hangup.
pub fn spawn_audio_feeder(track: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        loop {
            ticker.tick().await;
            let sample = webrtc::media::Sample {
                data: bytes::Bytes::from_static(OPUS_SILENCE),
                duration: FRAME_INTERVAL,
                ..Default::default()
            };
            // Unbound tracks (pre-negotiation) swallow the write.
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!("Audio feeder write failed: {e}");
            }
        }
    })
}
