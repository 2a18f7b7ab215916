use talkwire_protocol::{CallStatus, ClientEvent, ServerEvent, now_ms};

use crate::presence::{ConnectionTx, PresenceDirectory};
use crate::registry::CallRegistry;

/// Server-side call session coordinator.
///
/// Validates lifecycle transitions against the registry, relays negotiation
/// payloads verbatim, and cascades termination when a participant's last
/// connection drops. Business errors are surfaced to the originating
/// connection as explicit error events, never dropped.
#[derive(Clone)]
pub struct Coordinator {
    presence: PresenceDirectory,
    registry: CallRegistry,
}

impl Coordinator {
    pub fn new(presence: PresenceDirectory, registry: CallRegistry) -> Self {
        Self { presence, registry }
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.registry
    }

    /// Dispatch one signaling event from `user_id`'s connection.
    /// `reply` is that connection's own sender, used for acks and errors.
    pub async fn handle_event(&self, user_id: &str, event: ClientEvent, reply: &ConnectionTx) {
        match event {
            ClientEvent::CallStart { to, sdp } => {
                self.handle_call_start(user_id, &to, sdp, reply).await;
            }
            ClientEvent::CallAccept { call_id, sdp } => {
                match self
                    .registry
                    .update_status(call_id, CallStatus::Accepted, user_id)
                    .await
                {
                    Ok(call) => {
                        let event = ServerEvent::CallAccepted { call: call.clone(), sdp };
                        self.notify_participants(&call.from_id, &call.to_id, event)
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(%call_id, %user_id, "call-accept refused: {e}");
                        self.send_error(reply, &e.to_string());
                    }
                }
            }
            ClientEvent::CallReject { call_id } => {
                match self
                    .registry
                    .update_status(call_id, CallStatus::Rejected, user_id)
                    .await
                {
                    Ok(call) => {
                        let event = ServerEvent::CallRejected { call: call.clone() };
                        self.notify_participants(&call.from_id, &call.to_id, event)
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(%call_id, %user_id, "call-reject refused: {e}");
                        self.send_error(reply, &e.to_string());
                    }
                }
            }
            ClientEvent::CallEnd { call_id } => {
                match self
                    .registry
                    .update_status(call_id, CallStatus::Ended, user_id)
                    .await
                {
                    Ok(call) => {
                        let event = ServerEvent::CallEnded { call: call.clone() };
                        self.notify_participants(&call.from_id, &call.to_id, event)
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(%call_id, %user_id, "call-end refused: {e}");
                        self.send_error(reply, &e.to_string());
                    }
                }
            }
            // Raw negotiation payloads: forwarded verbatim with the sender
            // identity attached, no inspection, no ordering guarantees.
            ClientEvent::Offer { to, sdp } => {
                let forwarded = ServerEvent::Offer {
                    from: user_id.to_string(),
                    sdp,
                };
                self.relay(user_id, &to, forwarded, reply).await;
            }
            ClientEvent::Answer { to, sdp } => {
                let forwarded = ServerEvent::Answer {
                    from: user_id.to_string(),
                    sdp,
                };
                self.relay(user_id, &to, forwarded, reply).await;
            }
            ClientEvent::Candidate { to, candidate } => {
                let forwarded = ServerEvent::Candidate {
                    from: user_id.to_string(),
                    candidate,
                };
                self.relay(user_id, &to, forwarded, reply).await;
            }
        }
    }

    async fn handle_call_start(
        &self,
        from_id: &str,
        to_id: &str,
        sdp: Option<String>,
        reply: &ConnectionTx,
    ) {
        let call = match self.registry.start_call(from_id, to_id).await {
            Ok(call) => call,
            Err(e) => {
                tracing::info!(%from_id, %to_id, "call-start refused: {e}");
                self.send_error(reply, &e.to_string());
                return;
            }
        };

        let incoming = ServerEvent::CallIncoming {
            call_id: call.id,
            from: from_id.to_string(),
            sdp,
        };
        if !self.forward(to_id, incoming).await {
            // The caller must treat this as a failed attempt and end it.
            let _ = reply.send(ServerEvent::RecipientOffline {
                to: to_id.to_string(),
            });
        }

        // Ack with the assigned call id so the caller can end/track it.
        let _ = reply.send(ServerEvent::CallStarted { call });
    }

    /// A user's last connection dropped: end their active call (attributed
    /// to the disconnecting user) and tell everyone they went offline.
    /// Best-effort — failures here must not block connection cleanup.
    pub async fn handle_disconnect(&self, user_id: &str) {
        if let Some(active) = self.registry.find_active(user_id).await {
            tracing::info!(call_id = %active.id, %user_id, "Ending active call on disconnect");
            match self
                .registry
                .update_status(active.id, CallStatus::Ended, user_id)
                .await
            {
                Ok(call) => {
                    let event = ServerEvent::CallEnded { call: call.clone() };
                    self.notify_participants(&call.from_id, &call.to_id, event)
                        .await;
                }
                Err(e) => {
                    tracing::error!(call_id = %active.id, %user_id, "Failed to end call on disconnect: {e}");
                }
            }
        }

        self.presence
            .broadcast(ServerEvent::PresenceUpdate {
                user_id: user_id.to_string(),
                online: false,
                last_seen_at: Some(now_ms()),
            })
            .await;
    }

    /// A user's first connection arrived.
    pub async fn handle_connect(&self, user_id: &str) {
        self.presence
            .broadcast(ServerEvent::PresenceUpdate {
                user_id: user_id.to_string(),
                online: true,
                last_seen_at: None,
            })
            .await;
    }

    /// Forward to a target with a liveness check; on an offline target,
    /// report `recipient-offline` back to the sender instead of forwarding.
    async fn relay(&self, from_id: &str, to_id: &str, event: ServerEvent, reply: &ConnectionTx) {
        if !self.forward(to_id, event).await {
            tracing::debug!(%from_id, %to_id, "Relay target offline");
            let _ = reply.send(ServerEvent::RecipientOffline {
                to: to_id.to_string(),
            });
        }
    }

    /// Deliver an event to every live connection of `to_id`.
    /// Returns false when the user has no live connection.
    async fn forward(&self, to_id: &str, event: ServerEvent) -> bool {
        let routes = self.presence.route_to(to_id).await;
        if routes.is_empty() {
            return false;
        }
        for tx in routes {
            let _ = tx.send(event.clone());
        }
        true
    }

    /// Lifecycle broadcasts go to both participants; one of them being
    /// offline is expected (that is how disconnect cascades look).
    async fn notify_participants(&self, from_id: &str, to_id: &str, event: ServerEvent) {
        self.forward(from_id, event.clone()).await;
        if to_id != from_id {
            self.forward(to_id, event).await;
        }
    }

    fn send_error(&self, reply: &ConnectionTx, message: &str) {
        let _ = reply.send(ServerEvent::Error {
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkwire_protocol::CandidatePayload;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use uuid::Uuid;

    struct Edge {
        user: String,
        tx: ConnectionTx,
        rx: UnboundedReceiver<ServerEvent>,
    }

    async fn connect(coordinator: &Coordinator, presence: &PresenceDirectory, user: &str) -> Edge {
        let (tx, rx) = mpsc::unbounded_channel();
        let first = presence.register(user, Uuid::new_v4(), tx.clone()).await;
        if first {
            coordinator.handle_connect(user).await;
        }
        Edge {
            user: user.to_string(),
            tx,
            rx,
        }
    }

    fn setup() -> (Coordinator, PresenceDirectory) {
        let presence = PresenceDirectory::new();
        let registry = CallRegistry::new();
        (Coordinator::new(presence.clone(), registry), presence)
    }

    /// Drain until the next non-presence event (tests connect users in
    /// sequence, so presence fanout interleaves with call traffic).
    async fn next_call_event(edge: &mut Edge) -> ServerEvent {
        loop {
            match edge.rx.recv().await.expect("channel open") {
                ServerEvent::PresenceUpdate { .. } => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn full_accept_flow() {
        let (coordinator, presence) = setup();
        let mut alice = connect(&coordinator, &presence, "alice").await;
        let mut bob = connect(&coordinator, &presence, "bob").await;

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::CallStart {
                    to: "bob".to_string(),
                    sdp: Some("v=0 offer".to_string()),
                },
                &alice.tx,
            )
            .await;

        let call_id = match next_call_event(&mut bob).await {
            ServerEvent::CallIncoming { call_id, from, sdp } => {
                assert_eq!(from, "alice");
                assert_eq!(sdp.as_deref(), Some("v=0 offer"));
                call_id
            }
            other => panic!("expected call-incoming, got {other:?}"),
        };

        match next_call_event(&mut alice).await {
            ServerEvent::CallStarted { call } => {
                assert_eq!(call.id, call_id);
                assert_eq!(call.status, CallStatus::Pending);
            }
            other => panic!("expected call-started ack, got {other:?}"),
        }

        coordinator
            .handle_event(
                &bob.user,
                ClientEvent::CallAccept {
                    call_id,
                    sdp: Some("v=0 answer".to_string()),
                },
                &bob.tx,
            )
            .await;

        for edge in [&mut alice, &mut bob] {
            match next_call_event(edge).await {
                ServerEvent::CallAccepted { call, sdp } => {
                    assert_eq!(call.id, call_id);
                    assert_eq!(call.status, CallStatus::Accepted);
                    assert_eq!(sdp.as_deref(), Some("v=0 answer"));
                }
                other => panic!("expected call-accepted, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn second_call_start_while_busy_is_refused() {
        let (coordinator, presence) = setup();
        let mut alice = connect(&coordinator, &presence, "alice").await;
        let mut bob = connect(&coordinator, &presence, "bob").await;
        let _carol = connect(&coordinator, &presence, "carol").await;

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::CallStart {
                    to: "bob".to_string(),
                    sdp: None,
                },
                &alice.tx,
            )
            .await;
        assert!(matches!(
            next_call_event(&mut bob).await,
            ServerEvent::CallIncoming { .. }
        ));
        assert!(matches!(
            next_call_event(&mut alice).await,
            ServerEvent::CallStarted { .. }
        ));

        // a second attempt from the same initiator must not disturb the first
        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::CallStart {
                    to: "carol".to_string(),
                    sdp: None,
                },
                &alice.tx,
            )
            .await;
        assert!(matches!(
            next_call_event(&mut alice).await,
            ServerEvent::Error { .. }
        ));
        assert!(coordinator.registry().find_active("alice").await.is_some());
    }

    #[tokio::test]
    async fn accept_by_initiator_is_forbidden() {
        let (coordinator, presence) = setup();
        let mut alice = connect(&coordinator, &presence, "alice").await;
        let mut bob = connect(&coordinator, &presence, "bob").await;

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::CallStart {
                    to: "bob".to_string(),
                    sdp: None,
                },
                &alice.tx,
            )
            .await;
        let call_id = match next_call_event(&mut bob).await {
            ServerEvent::CallIncoming { call_id, .. } => call_id,
            other => panic!("expected call-incoming, got {other:?}"),
        };
        assert!(matches!(
            next_call_event(&mut alice).await,
            ServerEvent::CallStarted { .. }
        ));

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::CallAccept { call_id, sdp: None },
                &alice.tx,
            )
            .await;
        match next_call_event(&mut alice).await {
            ServerEvent::Error { message } => {
                assert!(message.contains("recipient"), "got: {message}");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_call_id_yields_not_found_error() {
        let (coordinator, presence) = setup();
        let mut alice = connect(&coordinator, &presence, "alice").await;

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::CallEnd {
                    call_id: Uuid::new_v4(),
                },
                &alice.tx,
            )
            .await;
        match next_call_event(&mut alice).await {
            ServerEvent::Error { message } => assert!(message.contains("not found")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offer_to_offline_user_reports_recipient_offline() {
        let (coordinator, presence) = setup();
        let mut alice = connect(&coordinator, &presence, "alice").await;

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::Offer {
                    to: "bob".to_string(),
                    sdp: "v=0".to_string(),
                },
                &alice.tx,
            )
            .await;
        match next_call_event(&mut alice).await {
            ServerEvent::RecipientOffline { to } => assert_eq!(to, "bob"),
            other => panic!("expected recipient-offline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn candidate_is_forwarded_verbatim() {
        let (coordinator, presence) = setup();
        let alice = connect(&coordinator, &presence, "alice").await;
        let mut bob = connect(&coordinator, &presence, "bob").await;

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::Candidate {
                    to: "bob".to_string(),
                    candidate: CandidatePayload {
                        candidate: "candidate:1 1 UDP 1 10.0.0.1 5000 typ host".to_string(),
                        sdp_mid: Some("0".to_string()),
                        sdp_mline_index: Some(0),
                    },
                },
                &alice.tx,
            )
            .await;

        match next_call_event(&mut bob).await {
            ServerEvent::Candidate { from, candidate } => {
                assert_eq!(from, "alice");
                assert!(candidate.candidate.starts_with("candidate:1"));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn candidate_to_multiple_connections_of_same_user() {
        let (coordinator, presence) = setup();
        let alice = connect(&coordinator, &presence, "alice").await;
        let mut bob_a = connect(&coordinator, &presence, "bob").await;
        let mut bob_b = connect(&coordinator, &presence, "bob").await;

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::Answer {
                    to: "bob".to_string(),
                    sdp: "v=0".to_string(),
                },
                &alice.tx,
            )
            .await;

        assert!(matches!(
            next_call_event(&mut bob_a).await,
            ServerEvent::Answer { .. }
        ));
        assert!(matches!(
            next_call_event(&mut bob_b).await,
            ServerEvent::Answer { .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_cascades_exactly_one_call_ended() {
        let (coordinator, presence) = setup();
        let mut alice = connect(&coordinator, &presence, "alice").await;
        let mut bob = connect(&coordinator, &presence, "bob").await;

        coordinator
            .handle_event(
                &alice.user,
                ClientEvent::CallStart {
                    to: "bob".to_string(),
                    sdp: None,
                },
                &alice.tx,
            )
            .await;
        let call_id = match next_call_event(&mut bob).await {
            ServerEvent::CallIncoming { call_id, .. } => call_id,
            other => panic!("expected call-incoming, got {other:?}"),
        };
        assert!(matches!(
            next_call_event(&mut alice).await,
            ServerEvent::CallStarted { .. }
        ));

        // bob's last connection drops
        coordinator.handle_disconnect("bob").await;

        match next_call_event(&mut alice).await {
            ServerEvent::CallEnded { call } => {
                assert_eq!(call.id, call_id);
                assert_eq!(call.status, CallStatus::Ended);
                assert!(call.ended_at.is_some());
            }
            other => panic!("expected call-ended, got {other:?}"),
        }
        // followed by the offline presence broadcast, and nothing else
        match alice.rx.try_recv() {
            Ok(ServerEvent::PresenceUpdate { user_id, online, .. }) => {
                assert_eq!(user_id, "bob");
                assert!(!online);
            }
            other => panic!("expected presence-update, got {other:?}"),
        }
        assert!(alice.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_without_active_call_only_updates_presence() {
        let (coordinator, presence) = setup();
        let mut alice = connect(&coordinator, &presence, "alice").await;
        // drain alice's own online broadcast from connect
        let _ = alice.rx.recv().await.unwrap();

        coordinator.handle_disconnect("bob").await;
        match alice.rx.recv().await.unwrap() {
            ServerEvent::PresenceUpdate {
                user_id,
                online,
                last_seen_at,
            } => {
                assert_eq!(user_id, "bob");
                assert!(!online);
                assert!(last_seen_at.is_some());
            }
            other => panic!("expected presence-update, got {other:?}"),
        }
    }
}
