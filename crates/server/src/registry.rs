use std::collections::HashMap;
use std::sync::Arc;

use talkwire_protocol::{CallError, CallRecord, CallStatus};
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory store of call attempts; the single source of truth for
/// "is this user currently in a call". Records are never deleted — terminal
/// records stay as history.
#[derive(Clone, Default)]
pub struct CallRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    records: HashMap<Uuid, CallRecord>,
    /// Creation order, used for "most recently started" lookups.
    order: Vec<Uuid>,
}

impl RegistryInner {
    /// Most recently started record involving `user_id` that is still
    /// pending or accepted.
    fn find_active(&self, user_id: &str) -> Option<&CallRecord> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.records.get(id))
            .find(|r| r.involves(user_id) && r.status.is_active())
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending record for a call from `from_id` to `to_id`.
    ///
    /// The busy lookup and the insert happen under one write guard, so two
    /// users dialing each other at the same instant resolve deterministically:
    /// whichever start is serialized second sees the other's pending record
    /// (the active lookup covers both roles) and fails with `Busy`. The
    /// original behavior here was a check-then-create race; serializing it
    /// was the deliberate fix.
    pub async fn start_call(&self, from_id: &str, to_id: &str) -> Result<CallRecord, CallError> {
        let mut inner = self.inner.write().await;
        if inner.find_active(from_id).is_some() {
            return Err(CallError::Busy);
        }
        let record = CallRecord::new(from_id, to_id);
        inner.order.push(record.id);
        inner.records.insert(record.id, record.clone());
        tracing::info!(call_id = %record.id, %from_id, %to_id, "Call record created");
        Ok(record)
    }

    /// Apply a status transition requested by `actor`. Authorization rules
    /// live on `CallRecord::transition`.
    pub async fn update_status(
        &self,
        call_id: Uuid,
        status: CallStatus,
        actor: &str,
    ) -> Result<CallRecord, CallError> {
        let mut inner = self.inner.write().await;
        let record = inner.records.get_mut(&call_id).ok_or(CallError::NotFound)?;
        record.transition(status, actor)?;
        tracing::info!(%call_id, ?status, %actor, "Call status updated");
        Ok(record.clone())
    }

    /// Most recently started pending/accepted call involving `user_id`.
    pub async fn find_active(&self, user_id: &str) -> Option<CallRecord> {
        let inner = self.inner.read().await;
        inner.find_active(user_id).cloned()
    }

    pub async fn get(&self, call_id: Uuid) -> Option<CallRecord> {
        let inner = self.inner.read().await;
        inner.records.get(&call_id).cloned()
    }

    /// Call history for a user, most recent first.
    pub async fn calls_for_user(&self, user_id: &str) -> Vec<CallRecord> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id))
            .filter(|r| r.involves(user_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_call_creates_pending_record() {
        let registry = CallRegistry::new();
        let call = registry.start_call("alice", "bob").await.unwrap();
        assert_eq!(call.status, CallStatus::Pending);
        assert_eq!(call.from_id, "alice");
        assert_eq!(call.to_id, "bob");
        assert!(registry.get(call.id).await.is_some());
    }

    #[tokio::test]
    async fn busy_initiator_is_refused() {
        let registry = CallRegistry::new();
        registry.start_call("alice", "bob").await.unwrap();
        let err = registry.start_call("alice", "carol").await.unwrap_err();
        assert_eq!(err, CallError::Busy);
    }

    #[tokio::test]
    async fn mutual_dial_refuses_the_second_start() {
        let registry = CallRegistry::new();
        let first = registry.start_call("alice", "bob").await.unwrap();
        // bob's simultaneous dial back is serialized after alice's create and
        // sees her pending record (he is its recipient)
        let err = registry.start_call("bob", "alice").await.unwrap_err();
        assert_eq!(err, CallError::Busy);
        assert_eq!(registry.find_active("bob").await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn recipient_busy_with_accepted_call_cannot_dial_out() {
        let registry = CallRegistry::new();
        let call = registry.start_call("alice", "bob").await.unwrap();
        registry
            .update_status(call.id, CallStatus::Accepted, "bob")
            .await
            .unwrap();
        assert_eq!(
            registry.start_call("bob", "carol").await.unwrap_err(),
            CallError::Busy
        );
    }

    #[tokio::test]
    async fn terminal_call_frees_participants() {
        let registry = CallRegistry::new();
        let call = registry.start_call("alice", "bob").await.unwrap();
        registry
            .update_status(call.id, CallStatus::Rejected, "bob")
            .await
            .unwrap();
        assert!(registry.find_active("alice").await.is_none());
        // both are free to call again
        registry.start_call("alice", "bob").await.unwrap();
    }

    #[tokio::test]
    async fn update_unknown_call_is_not_found() {
        let registry = CallRegistry::new();
        let err = registry
            .update_status(Uuid::new_v4(), CallStatus::Accepted, "bob")
            .await
            .unwrap_err();
        assert_eq!(err, CallError::NotFound);
    }

    #[tokio::test]
    async fn wrong_actor_accept_is_forbidden_and_leaves_record_intact() {
        let registry = CallRegistry::new();
        let call = registry.start_call("alice", "bob").await.unwrap();
        let err = registry
            .update_status(call.id, CallStatus::Accepted, "alice")
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Forbidden);
        assert_eq!(registry.get(call.id).await.unwrap().status, CallStatus::Pending);
    }

    #[tokio::test]
    async fn find_active_prefers_most_recent() {
        let registry = CallRegistry::new();
        let old = registry.start_call("alice", "bob").await.unwrap();
        registry
            .update_status(old.id, CallStatus::Ended, "alice")
            .await
            .unwrap();
        let newer = registry.start_call("alice", "bob").await.unwrap();
        assert_eq!(registry.find_active("alice").await.unwrap().id, newer.id);
        assert_eq!(registry.find_active("bob").await.unwrap().id, newer.id);
    }

    #[tokio::test]
    async fn history_is_retained_most_recent_first() {
        let registry = CallRegistry::new();
        let first = registry.start_call("alice", "bob").await.unwrap();
        registry
            .update_status(first.id, CallStatus::Ended, "bob")
            .await
            .unwrap();
        let second = registry.start_call("bob", "alice").await.unwrap();

        let history = registry.calls_for_user("alice").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);
        // terminal records are inert but never deleted
        assert_eq!(history[1].status, CallStatus::Ended);
    }
}
