use std::collections::HashMap;
use std::sync::Arc;

use talkwire_protocol::ServerEvent;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Sender half of one live signaling connection. Events pushed here are
/// serialized and written to the WebSocket by the connection task.
pub type ConnectionTx = UnboundedSender<ServerEvent>;

/// Maps user ids to their live signaling connections.
///
/// A user may hold several connections at once (multiple tabs/devices); a
/// message routed to a user goes to all of them, with no ordering guarantee
/// across connections. A user is online while the set is non-empty.
#[derive(Clone, Default)]
pub struct PresenceDirectory {
    inner: Arc<RwLock<HashMap<String, HashMap<Uuid, ConnectionTx>>>>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the user's live set.
    /// Returns true when this is the user's first connection (came online).
    pub async fn register(&self, user_id: &str, conn_id: Uuid, tx: ConnectionTx) -> bool {
        let mut map = self.inner.write().await;
        let conns = map.entry(user_id.to_string()).or_default();
        let first = conns.is_empty();
        conns.insert(conn_id, tx);
        tracing::debug!(%user_id, %conn_id, first, "Connection registered");
        first
    }

    /// Remove a connection from the user's live set.
    /// Returns true when the user is now fully offline.
    pub async fn unregister(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        let Some(conns) = map.get_mut(user_id) else {
            return false;
        };
        conns.remove(&conn_id);
        let offline = conns.is_empty();
        if offline {
            map.remove(user_id);
        }
        tracing::debug!(%user_id, %conn_id, offline, "Connection unregistered");
        offline
    }

    /// Senders for every live connection of `user_id`. Empty means offline;
    /// callers must surface that to the message's originator rather than
    /// dropping silently.
    pub async fn route_to(&self, user_id: &str) -> Vec<ConnectionTx> {
        let map = self.inner.read().await;
        map.get(user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let map = self.inner.read().await;
        map.get(user_id).is_some_and(|c| !c.is_empty())
    }

    /// Send an event to every live connection of every user (presence fanout).
    pub async fn broadcast(&self, event: ServerEvent) {
        let map = self.inner.read().await;
        for conns in map.values() {
            for tx in conns.values() {
                // A closed receiver just means that connection is going away.
                let _ = tx.send(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn() -> (ConnectionTx, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn first_registration_reports_online() {
        let presence = PresenceDirectory::new();
        let (tx, _rx) = conn();
        assert!(presence.register("alice", Uuid::new_v4(), tx).await);

        let (tx2, _rx2) = conn();
        assert!(!presence.register("alice", Uuid::new_v4(), tx2).await);
    }

    #[tokio::test]
    async fn last_unregister_reports_offline() {
        let presence = PresenceDirectory::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let (tx1, _rx1) = conn();
        let (tx2, _rx2) = conn();
        presence.register("alice", c1, tx1).await;
        presence.register("alice", c2, tx2).await;

        assert!(!presence.unregister("alice", c1).await);
        assert!(presence.unregister("alice", c2).await);
        assert!(!presence.is_online("alice").await);
    }

    #[tokio::test]
    async fn unregister_unknown_user_is_not_offline_transition() {
        let presence = PresenceDirectory::new();
        assert!(!presence.unregister("ghost", Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn route_to_reaches_every_connection() {
        let presence = PresenceDirectory::new();
        let (tx1, mut rx1) = conn();
        let (tx2, mut rx2) = conn();
        presence.register("bob", Uuid::new_v4(), tx1).await;
        presence.register("bob", Uuid::new_v4(), tx2).await;

        let routes = presence.route_to("bob").await;
        assert_eq!(routes.len(), 2);
        for tx in routes {
            tx.send(ServerEvent::RecipientOffline {
                to: "x".to_string(),
            })
            .unwrap();
        }
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn route_to_offline_user_is_empty() {
        let presence = PresenceDirectory::new();
        assert!(presence.route_to("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_users() {
        let presence = PresenceDirectory::new();
        let (tx1, mut rx1) = conn();
        let (tx2, mut rx2) = conn();
        presence.register("alice", Uuid::new_v4(), tx1).await;
        presence.register("bob", Uuid::new_v4(), tx2).await;

        presence
            .broadcast(ServerEvent::PresenceUpdate {
                user_id: "carol".to_string(),
                online: true,
                last_seen_at: None,
            })
            .await;

        assert!(matches!(
            rx1.recv().await,
            Some(ServerEvent::PresenceUpdate { .. })
        ));
        assert!(matches!(
            rx2.recv().await,
            Some(ServerEvent::PresenceUpdate { .. })
        ));
    }
}
