use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::call::CallRecord;

/// ICE candidate as exchanged between peers (the browser `RTCIceCandidateInit`
/// shape). Forwarded verbatim by the server, never inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Signaling events sent by an edge client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Start a call to `to`, optionally carrying the initial SDP offer so
    /// the callee can answer without a separate offer round.
    CallStart {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<String>,
    },
    /// Accept an incoming call (recipient only), optionally carrying the
    /// SDP answer for the initiator.
    CallAccept {
        call_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<String>,
    },
    /// Reject an incoming call (recipient only).
    CallReject { call_id: Uuid },
    /// End a call (either participant).
    CallEnd { call_id: Uuid },
    /// Raw SDP offer relayed to `to` (renegotiation / ICE restart).
    Offer { to: String, sdp: String },
    /// Raw SDP answer relayed to `to`.
    Answer { to: String, sdp: String },
    /// ICE candidate relayed to `to`.
    Candidate { to: String, candidate: CandidatePayload },
}

/// Signaling events sent by the server to an edge client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// A call is ringing for this user.
    CallIncoming {
        call_id: Uuid,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<String>,
    },
    /// Acknowledgment to the initiator carrying the assigned call id.
    CallStarted { call: CallRecord },
    /// Broadcast to both participants when the recipient accepts.
    CallAccepted {
        call: CallRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<String>,
    },
    /// Broadcast to both participants when the recipient rejects.
    CallRejected { call: CallRecord },
    /// Broadcast to both participants when the call ends (participant
    /// request or disconnect cascade).
    CallEnded { call: CallRecord },
    /// Relayed SDP offer from `from`.
    Offer { from: String, sdp: String },
    /// Relayed SDP answer from `from`.
    Answer { from: String, sdp: String },
    /// Relayed ICE candidate from `from`.
    Candidate { from: String, candidate: CandidatePayload },
    /// The message could not be forwarded: `to` has no live connection.
    /// The sender must treat this as a negotiation failure.
    RecipientOffline { to: String },
    /// Broadcast whenever a user's first connection arrives or last
    /// connection drops.
    PresenceUpdate {
        user_id: String,
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen_at: Option<u64>,
    },
    /// Surfaced authorization / not-found / malformed-payload failure.
    Error { message: String },
}

/// ICE server entry handed to edge clients for peer connection setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}
