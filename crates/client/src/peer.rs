use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Configuration for ICE servers passed to the client.
#[derive(Clone)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// One WebRTC peer connection carrying an audio and a video track.
///
/// Built with the default codec set so the remote end can be any standard
/// endpoint. The video sender is kept around so the outgoing video source
/// can be swapped mid-call without renegotiating.
pub struct CallPeer {
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
}

/// Build an opus audio track for the outgoing stream.
pub fn new_audio_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_string(),
        "talkwire".to_string(),
    ))
}

/// Build a VP8 video track. `id` distinguishes sources ("camera", "screen")
/// so a swapped-in track is observable on the remote side.
pub fn new_video_track(id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
        id.to_string(),
        "talkwire".to_string(),
    ))
}

impl CallPeer {
    pub async fn new(
        ice_servers: Vec<IceServerConfig>,
        audio_track: Arc<TrackLocalStaticSample>,
        video_track: Arc<TrackLocalStaticSample>,
    ) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_ice_servers: Vec<RTCIceServer> = if ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                ..Default::default()
            }]
        } else {
            ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                })
                .collect()
        };

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add audio track")?;

        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;

        info!("WebRTC peer connection created");

        Ok(Self {
            peer_connection,
            video_sender,
        })
    }

    /// Create a local offer. With `ice_restart` the offer carries fresh ICE
    /// credentials, forcing a new candidate-gathering round on both sides.
    pub async fn create_offer(&self, ice_restart: bool) -> anyhow::Result<String> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .context("Failed to create offer")?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(offer.sdp)
    }

    /// Apply a remote offer and produce our answer.
    pub async fn handle_offer(&self, sdp: &str) -> anyhow::Result<String> {
        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse SDP offer")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(answer.sdp)
    }

    /// Apply the remote answer to our outstanding offer.
    pub async fn handle_answer(&self, sdp: &str) -> anyhow::Result<()> {
        let answer =
            RTCSessionDescription::answer(sdp.to_string()).context("Failed to parse SDP answer")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")?;
        Ok(())
    }

    pub async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            ..Default::default()
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        Ok(())
    }

    pub fn on_ice_candidate(
        &self,
        callback: impl Fn(String, Option<String>, Option<u16>) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            let cb = Arc::clone(&callback);
                            cb(json.candidate, json.sdp_mid, json.sdp_mline_index);
                        }
                        Err(e) => {
                            warn!("Failed to serialize ICE candidate: {e}");
                        }
                    }
                }
                Box::pin(async {})
            }));
    }

    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(RTCPeerConnectionState) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                let cb = Arc::clone(&callback);
                cb(state);
                Box::pin(async {})
            }));
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    /// Swap the outgoing video source without renegotiating. The transceiver
    /// keeps its mid and SSRC; the remote side just sees new frames.
    pub async fn replace_video_track(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> anyhow::Result<()> {
        self.video_sender
            .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .context("Failed to replace video track")?;
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!("Peer connection closed");
        Ok(())
    }
}
