use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use talkwire_protocol::{CandidatePayload, ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::media::{self, MediaSources};
use crate::peer::{CallPeer, IceServerConfig};

/// Messages the controller sends itself from callbacks and timers. Keeping
/// all mutation on the main loop avoids locking the controller state.
#[derive(Debug)]
pub enum ControlMsg {
    ConnectionState(RTCPeerConnectionState),
    /// Fired `restart_delay` after a drop was observed. Carries the call
    /// generation it was scheduled under so stale timers are ignored.
    RestartCheck { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Negotiating,
    Connected,
    Restarting,
}

/// Holds ICE candidates that arrive before the peer has a remote
/// description. Bounded; the oldest candidate is dropped on overflow since
/// late candidates supersede early ones for the same attempt.
struct CandidateBuffer {
    cap: usize,
    items: VecDeque<CandidatePayload>,
}

impl CandidateBuffer {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            items: VecDeque::new(),
        }
    }

    fn push(&mut self, candidate: CandidatePayload) {
        if self.cap == 0 {
            return;
        }
        if self.items.len() == self.cap {
            self.items.pop_front();
            debug!("Candidate buffer full, dropped oldest");
        }
        self.items.push_back(candidate);
    }

    fn drain(&mut self) -> Vec<CandidatePayload> {
        self.items.drain(..).collect()
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Drives one call at a time: lifecycle events in, peer connection state
/// out. All entry points run on the client's main loop.
pub struct CallController {
    events_out: mpsc::UnboundedSender<ClientEvent>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    ice_servers: Vec<IceServerConfig>,
    auto_accept: bool,
    restart_delay: Duration,

    phase: Phase,
    call_id: Option<Uuid>,
    remote: Option<String>,
    peer: Option<Arc<CallPeer>>,
    media: MediaSources,
    audio_feeder: Option<tokio::task::JoinHandle<()>>,
    buffer: CandidateBuffer,
    screen_sharing: bool,
    /// Set after the local attempt is abandoned (offline recipient) but
    /// before the server's start ack arrives; the ack is answered with an
    /// immediate end so the registry record doesn't dangle.
    abandoned: bool,

    /// Checked when the restart timer fires; set during teardown so an
    /// in-flight timer never restarts a call that is being torn down.
    suppress_restart: bool,
    /// Bumped on every teardown; restart timers scheduled under an older
    /// generation are stale and ignored.
    generation: u64,
}

impl CallController {
    pub fn new(
        events_out: mpsc::UnboundedSender<ClientEvent>,
        control_tx: mpsc::UnboundedSender<ControlMsg>,
        ice_servers: Vec<IceServerConfig>,
        auto_accept: bool,
        restart_delay: Duration,
        candidate_buffer: usize,
    ) -> Self {
        Self {
            events_out,
            control_tx,
            ice_servers,
            auto_accept,
            restart_delay,
            phase: Phase::Idle,
            call_id: None,
            remote: None,
            peer: None,
            media: MediaSources::new(),
            audio_feeder: None,
            buffer: CandidateBuffer::new(candidate_buffer),
            screen_sharing: false,
            abandoned: false,
            suppress_restart: false,
            generation: 0,
        }
    }

    pub fn in_call(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Start an outgoing call: fresh peer, local offer piggybacked on the
    /// start request so the callee can answer in one round trip.
    pub async fn dial(&mut self, to: &str) -> anyhow::Result<()> {
        if self.in_call() {
            anyhow::bail!("Already in a call");
        }
        info!(to, "Dialing");
        self.remote = Some(to.to_string());
        let offer = match self.start_local_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                // A failed attempt must leave no participant state behind.
                self.teardown("dial setup failed").await;
                return Err(e);
            }
        };
        self.phase = Phase::Negotiating;
        self.send(ClientEvent::CallStart {
            to: to.to_string(),
            sdp: Some(offer),
        });
        Ok(())
    }

    async fn start_local_offer(&mut self) -> anyhow::Result<String> {
        let peer = self.create_peer().await?;
        peer.create_offer(false).await
    }

    /// End the current call locally.
    pub async fn hangup(&mut self) {
        let Some(call_id) = self.call_id else {
            return;
        };
        info!(%call_id, "Hanging up");
        self.send(ClientEvent::CallEnd { call_id });
        self.teardown("local hangup").await;
    }

    /// Swap the outgoing video between camera and screen without
    /// renegotiating.
    pub async fn set_screen_share(&mut self, on: bool) -> anyhow::Result<()> {
        let Some(peer) = self.peer.clone() else {
            anyhow::bail!("No active call");
        };
        if on == self.screen_sharing {
            return Ok(());
        }
        if on {
            peer.replace_video_track(self.media.screen_track()).await?;
            info!("Screen share started");
        } else {
            peer.replace_video_track(Arc::clone(&self.media.camera))
                .await?;
            info!("Screen share stopped, camera restored");
        }
        self.screen_sharing = on;
        Ok(())
    }

    pub async fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::CallIncoming { call_id, from, sdp } => {
                self.on_incoming(call_id, from, sdp).await;
            }
            ServerEvent::CallStarted { call } => {
                if self.abandoned {
                    // The recipient-offline notice already tore us down;
                    // close out the record the ack just assigned.
                    self.abandoned = false;
                    self.send(ClientEvent::CallEnd { call_id: call.id });
                    return;
                }
                info!(call_id = %call.id, "Call registered");
                self.call_id = Some(call.id);
            }
            ServerEvent::CallAccepted { call, sdp } => {
                info!(call_id = %call.id, "Call accepted");
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                // Both participants get this broadcast; the accepting side
                // already has a remote description and must not react.
                if peer.has_remote_description().await {
                    return;
                }
                match sdp {
                    Some(sdp) => {
                        if let Err(e) = peer.handle_answer(&sdp).await {
                            warn!("Failed to apply answer: {e:#}");
                            self.hangup().await;
                            return;
                        }
                        self.flush_candidates(&peer).await;
                    }
                    // Accept without an answer: the callee expects the
                    // negotiation to run through the offer relay instead.
                    None => {
                        let Some(remote) = self.remote.clone() else {
                            return;
                        };
                        match peer.create_offer(false).await {
                            Ok(sdp) => self.send(ClientEvent::Offer { to: remote, sdp }),
                            Err(e) => {
                                warn!("Failed to re-offer after accept: {e:#}");
                                self.hangup().await;
                            }
                        }
                    }
                }
            }
            ServerEvent::CallRejected { call } => {
                if self.call_id == Some(call.id) {
                    info!(call_id = %call.id, "Call rejected");
                    self.teardown("rejected").await;
                }
            }
            ServerEvent::CallEnded { call } => {
                // Our own hangup already tore down; the echo finds us idle.
                if self.call_id == Some(call.id) {
                    info!(call_id = %call.id, "Call ended by peer");
                    self.teardown("remote end").await;
                }
            }
            ServerEvent::Offer { from, sdp } => {
                if self.remote.as_deref() != Some(from.as_str()) {
                    debug!(from, "Ignoring offer from non-participant");
                    return;
                }
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                // Mid-call offers are renegotiations (remote ICE restart).
                match peer.handle_offer(&sdp).await {
                    Ok(answer) => {
                        self.flush_candidates(&peer).await;
                        self.send(ClientEvent::Answer { to: from, sdp: answer });
                    }
                    Err(e) => warn!("Failed to handle renegotiation offer: {e:#}"),
                }
            }
            ServerEvent::Answer { from, sdp } => {
                if self.remote.as_deref() != Some(from.as_str()) {
                    debug!(from, "Ignoring answer from non-participant");
                    return;
                }
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                match peer.handle_answer(&sdp).await {
                    Ok(()) => {
                        if self.phase == Phase::Restarting {
                            info!("Restart answer applied");
                            self.phase = Phase::Negotiating;
                        }
                        self.flush_candidates(&peer).await;
                    }
                    Err(e) => warn!("Failed to apply answer: {e:#}"),
                }
            }
            ServerEvent::Candidate { from, candidate } => {
                if self.remote.as_deref() != Some(from.as_str()) {
                    debug!(from, "Ignoring candidate from non-participant");
                    return;
                }
                self.on_candidate(candidate).await;
            }
            ServerEvent::RecipientOffline { to } => {
                if self.remote.as_deref() == Some(to.as_str()) {
                    warn!(to, "Recipient offline, abandoning call attempt");
                    if let Some(call_id) = self.call_id {
                        self.send(ClientEvent::CallEnd { call_id });
                    } else {
                        // Start ack not seen yet; close the record when it
                        // arrives.
                        self.abandoned = true;
                    }
                    self.teardown("recipient offline").await;
                }
            }
            ServerEvent::PresenceUpdate {
                user_id, online, ..
            } => {
                debug!(user_id, online, "Presence update");
            }
            ServerEvent::Error { message } => {
                warn!("Server error: {message}");
            }
        }
    }

    async fn on_incoming(&mut self, call_id: Uuid, from: String, sdp: Option<String>) {
        if self.in_call() {
            info!(%call_id, from, "Busy, rejecting incoming call");
            self.send(ClientEvent::CallReject { call_id });
            return;
        }
        if !self.auto_accept {
            info!(%call_id, from, "Incoming call rejected (run with --auto-accept to take calls)");
            self.send(ClientEvent::CallReject { call_id });
            return;
        }

        info!(%call_id, from, "Accepting incoming call");
        self.remote = Some(from);
        self.call_id = Some(call_id);
        let peer = match self.create_peer().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to create peer: {e:#}");
                self.send(ClientEvent::CallReject { call_id });
                self.teardown("peer setup failed").await;
                return;
            }
        };

        let answer = match sdp {
            Some(offer) => match peer.handle_offer(&offer).await {
                Ok(answer) => {
                    self.flush_candidates(&peer).await;
                    Some(answer)
                }
                Err(e) => {
                    warn!("Failed to handle offer: {e:#}");
                    self.send(ClientEvent::CallReject { call_id });
                    self.teardown("bad offer").await;
                    return;
                }
            },
            // No piggybacked offer: accept now; the caller re-offers
            // through the relay when it sees the answerless accept.
            None => None,
        };

        self.phase = Phase::Negotiating;
        self.send(ClientEvent::CallAccept { call_id, sdp: answer });
    }

    async fn on_candidate(&mut self, candidate: CandidatePayload) {
        let peer = match &self.peer {
            Some(peer) if peer.has_remote_description().await => Arc::clone(peer),
            _ => {
                debug!(buffered = self.buffer.len() + 1, "Buffering early candidate");
                self.buffer.push(candidate);
                return;
            }
        };
        if let Err(e) = peer
            .add_ice_candidate(
                &candidate.candidate,
                candidate.sdp_mid.as_deref(),
                candidate.sdp_mline_index,
            )
            .await
        {
            warn!("Failed to add ICE candidate: {e:#}");
        }
    }

    pub async fn on_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::ConnectionState(state) => self.on_connection_state(state).await,
            ControlMsg::RestartCheck { generation } => self.on_restart_check(generation).await,
        }
    }

    async fn on_connection_state(&mut self, state: RTCPeerConnectionState) {
        info!(?state, "Peer connection state changed");
        match state {
            RTCPeerConnectionState::Connected => {
                if matches!(self.phase, Phase::Negotiating | Phase::Restarting) {
                    self.phase = Phase::Connected;
                    info!("Call media connected");
                }
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                if self.in_call() {
                    self.schedule_restart_check();
                }
            }
            _ => {}
        }
    }

    /// Defer the restart decision: transient drops often recover on their
    /// own within the delay, and a teardown may land in the meantime.
    fn schedule_restart_check(&self) {
        let generation = self.generation;
        let delay = self.restart_delay;
        let control_tx = self.control_tx.clone();
        info!(delay_ms = delay.as_millis() as u64, "Scheduling ICE restart check");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control_tx.send(ControlMsg::RestartCheck { generation });
        });
    }

    async fn on_restart_check(&mut self, generation: u64) {
        if generation != self.generation {
            debug!("Stale restart check, ignoring");
            return;
        }
        if self.suppress_restart {
            info!("Restart suppressed, call is ending");
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if !self.in_call() {
            return;
        }
        if peer.connection_state() == RTCPeerConnectionState::Connected {
            info!("Connection recovered on its own, no restart needed");
            return;
        }
        let Some(remote) = self.remote.clone() else {
            return;
        };

        info!("Connection still down, restarting ICE");
        self.phase = Phase::Restarting;
        match peer.create_offer(true).await {
            Ok(sdp) => {
                self.send(ClientEvent::Offer { to: remote, sdp });
            }
            Err(e) => {
                warn!("ICE restart offer failed: {e:#}");
                self.hangup().await;
            }
        }
    }

    async fn create_peer(&mut self) -> anyhow::Result<Arc<CallPeer>> {
        self.suppress_restart = false;

        let peer = Arc::new(
            CallPeer::new(
                self.ice_servers.clone(),
                Arc::clone(&self.media.audio),
                Arc::clone(&self.media.camera),
            )
            .await?,
        );

        // Trickle our candidates to the current remote as they gather.
        let remote = self.remote.clone().unwrap_or_default();
        let events_out = self.events_out.clone();
        peer.on_ice_candidate(move |candidate, sdp_mid, sdp_mline_index| {
            let _ = events_out.send(ClientEvent::Candidate {
                to: remote.clone(),
                candidate: CandidatePayload {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                },
            });
        });

        let control_tx = self.control_tx.clone();
        peer.on_connection_state_change(move |state| {
            let _ = control_tx.send(ControlMsg::ConnectionState(state));
        });

        // Exactly one feeder per live peer; a leftover handle from an
        // earlier attempt would keep ticking forever once detached.
        if let Some(previous) = self.audio_feeder.take() {
            previous.abort();
        }
        if let Some(stale) = self.peer.take() {
            if let Err(e) = stale.close().await {
                warn!("Error closing stale peer: {e:#}");
            }
        }
        self.audio_feeder = Some(media::spawn_audio_feeder(Arc::clone(&self.media.audio)));
        self.peer = Some(Arc::clone(&peer));
        Ok(peer)
    }

    async fn flush_candidates(&mut self, peer: &CallPeer) {
        let buffered = self.buffer.drain();
        if buffered.is_empty() {
            return;
        }
        info!(count = buffered.len(), "Flushing buffered candidates");
        for candidate in buffered {
            if let Err(e) = peer
                .add_ice_candidate(
                    &candidate.candidate,
                    candidate.sdp_mid.as_deref(),
                    candidate.sdp_mline_index,
                )
                .await
            {
                warn!("Failed to add buffered candidate: {e:#}");
            }
        }
    }

    async fn teardown(&mut self, reason: &str) {
        info!(reason, "Tearing down call");
        self.suppress_restart = true;
        self.generation += 1;

        if let Some(feeder) = self.audio_feeder.take() {
            feeder.abort();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("Error closing peer: {e:#}");
            }
        }
        self.buffer.clear();
        self.call_id = None;
        self.remote = None;
        self.screen_sharing = false;
        self.phase = Phase::Idle;
    }

    fn send(&self, event: ClientEvent) {
        if self.events_out.send(event).is_err() {
            warn!("Signaling channel closed, event dropped");
        }
    }
}
