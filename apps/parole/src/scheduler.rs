use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::protocol::{Frame, Timeout};
use crate::queue::ReplayQueue;
use crate::session::SessionSlot;
use crate::storage::TimeoutStore;

/// Arms one detached delivery task per accepted expiry. There is no
/// cancellation: once armed, the fire procedure always runs at its deadline,
/// and only its outcome depends on the connection state sampled at that
/// moment. Re-scheduling an identity key that already has an armed task is
/// allowed and yields two independent tasks racing for the same record.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn TimeoutStore>,
    slot: SessionSlot,
    queue: Arc<ReplayQueue>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TimeoutStore>, slot: SessionSlot, queue: Arc<ReplayQueue>) -> Self {
        Self { store, slot, queue }
    }

    pub async fn schedule(&self, timeout: Timeout) {
        // Durability is best-effort: a failed write keeps the in-memory
        // delivery armed for this process lifetime.
        if let Err(err) = self.store.put(&timeout).await {
            error!(
                key = %timeout.storage_key(),
                error = %err,
                "unable to persist timeout; delivery is armed in memory only"
            );
        }

        let delay = timeout.delivery_delay();
        debug!(
            key = %timeout.storage_key(),
            kind = ?timeout.kind,
            delay_ms = delay.as_millis() as u64,
            "armed delivery task"
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(timeout).await;
        });
    }

    /// Runs when a delivery task's deadline elapses. Disconnected: the entry
    /// goes to the replay queue and the durable record stays put, so a
    /// restart can still recover it. Connected: the record is deleted first,
    /// then the expiry is pushed.
    pub(crate) async fn fire(&self, timeout: Timeout) {
        if !self.slot.has_session() {
            warn!(
                key = %timeout.storage_key(),
                "controller is disconnected; queued expiry for replay"
            );
            self.queue.enqueue(timeout).await;
            return;
        }

        let key = timeout.storage_key();
        match self.store.get(&key).await {
            // A racing duplicate timer for the same key may have beaten us
            // to the record.
            Ok(None) => warn!(%key, "timeout record already gone"),
            Ok(Some(_)) => {}
            Err(err) => error!(%key, error = %err, "unable to look up timeout record"),
        }
        if let Err(err) = self.store.delete(&key).await {
            error!(%key, error = %err, "unable to delete timeout record");
        }

        self.slot.send(&Frame::apply(&timeout)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PunishmentKind;
    use crate::storage::testing::MemoryStore;
    use std::time::Duration;

    fn expiry(user: &str, issued_at: i64, expires_at: i64) -> Timeout {
        Timeout {
            kind: PunishmentKind::Mute,
            guild_id: "g1".to_string(),
            user_id: user.to_string(),
            moderator_id: Some("m1".to_string()),
            issued_at,
            expires_at,
            reason: None,
        }
    }

    fn scheduler() -> (Scheduler, Arc<MemoryStore>, Arc<ReplayQueue>) {
        let store = Arc::new(MemoryStore::default());
        let queue = Arc::new(ReplayQueue::default());
        let scheduler = Scheduler::new(store.clone(), SessionSlot::default(), queue.clone());
        (scheduler, store, queue)
    }

    #[test_deadline::deadline]
    async fn disconnected_fire_queues_and_keeps_the_record() {
        let (scheduler, store, queue) = scheduler();
        let timeout = expiry("u1", 1000, 1050);

        scheduler.schedule(timeout.clone()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(queue.snapshot().await, vec![timeout.clone()]);
        assert_eq!(
            store.get(&timeout.storage_key()).await.unwrap(),
            Some(timeout)
        );
    }

    #[test_deadline::deadline]
    async fn negative_expiry_delta_fires_immediately() {
        let (scheduler, _store, queue) = scheduler();
        let timeout = expiry("u1", 5000, 1000);

        scheduler.schedule(timeout.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.snapshot().await, vec![timeout]);
    }

    #[test_deadline::deadline]
    async fn delivery_waits_for_the_full_delay() {
        let (scheduler, store, queue) = scheduler();
        let timeout = expiry("u1", 1000, 1400);

        scheduler.schedule(timeout.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Not due yet: record persisted, nothing queued.
        assert!(queue.snapshot().await.is_empty());
        assert!(store.get(&timeout.storage_key()).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(queue.snapshot().await, vec![timeout]);
    }

    #[test_deadline::deadline]
    async fn store_write_failure_does_not_stop_delivery() {
        let (scheduler, store, queue) = scheduler();
        store.fail_writes();
        let timeout = expiry("u1", 0, 0);

        // Durability is best-effort: the delivery task is armed even though
        // the record never made it to the store.
        scheduler.schedule(timeout.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(queue.snapshot().await, vec![timeout]);
    }

    #[test_deadline::deadline]
    async fn duplicate_keys_arm_independent_tasks() {
        let (scheduler, _store, queue) = scheduler();

        scheduler.schedule(expiry("u1", 0, 0)).await;
        scheduler.schedule(expiry("u1", 0, 0)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Both tasks ran their fire procedure; nothing coalesces them.
        assert_eq!(queue.snapshot().await.len(), 2);
    }
}
