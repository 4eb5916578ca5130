use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::Mutex;

use crate::protocol::Timeout;

/// FIFO of expiries that matured while no controller was connected.
/// Unbounded: the expected cardinality of simultaneously pending punishments
/// is small, so process memory is the only cap.
#[derive(Default)]
pub struct ReplayQueue {
    entries: Mutex<VecDeque<Timeout>>,
}

impl ReplayQueue {
    pub async fn enqueue(&self, timeout: Timeout) {
        self.entries.lock().await.push_back(timeout);
    }

    /// Seeds the queue, used when recovering the previous run's snapshot.
    pub async fn extend(&self, entries: Vec<Timeout>) {
        self.entries.lock().await.extend(entries);
    }

    /// Copy of the current contents, oldest first.
    pub async fn snapshot(&self) -> Vec<Timeout> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Feeds every queued entry to `sink`, oldest first, then clears the
    /// queue, all under one hold of the lock. An enqueue racing this call
    /// either made it into the batch being drained or waits for the lock and
    /// lands in the emptied queue for the next drain; entries are never lost
    /// and never drained twice. Returns the number of entries delivered.
    pub async fn drain_if_nonempty<F, Fut>(&self, mut sink: F) -> usize
    where
        F: FnMut(Timeout) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut entries = self.entries.lock().await;
        let drained = entries.len();
        while let Some(next) = entries.pop_front() {
            sink(next).await;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PunishmentKind;
    use std::sync::Arc;

    fn expiry(user: &str) -> Timeout {
        Timeout {
            kind: PunishmentKind::Ban,
            guild_id: "g1".to_string(),
            user_id: user.to_string(),
            moderator_id: None,
            issued_at: 0,
            expires_at: 0,
            reason: None,
        }
    }

    #[test_deadline::deadline]
    async fn drains_in_enqueue_order_and_clears() {
        let queue = ReplayQueue::default();
        for user in ["u1", "u2", "u3"] {
            queue.enqueue(expiry(user)).await;
        }

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let drained = queue
            .drain_if_nonempty(|timeout| {
                let delivered = delivered.clone();
                async move { delivered.lock().await.push(timeout.user_id) }
            })
            .await;

        assert_eq!(drained, 3);
        assert_eq!(*delivered.lock().await, vec!["u1", "u2", "u3"]);
        assert!(queue.snapshot().await.is_empty());
    }

    #[test_deadline::deadline]
    async fn draining_an_empty_queue_is_a_noop() {
        let queue = ReplayQueue::default();
        let drained = queue
            .drain_if_nonempty(|_| async { panic!("sink must not run") })
            .await;
        assert_eq!(drained, 0);
    }

    #[test_deadline::deadline]
    async fn concurrent_enqueues_and_drains_lose_nothing() {
        let queue = Arc::new(ReplayQueue::default());
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let mut producers = Vec::new();
        for worker in 0..4 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for n in 0..25 {
                    queue.enqueue(expiry(&format!("{worker}-{n}"))).await;
                    tokio::task::yield_now().await;
                }
            }));
        }

        let drainer = {
            let queue = queue.clone();
            let delivered = delivered.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let delivered = delivered.clone();
                    queue
                        .drain_if_nonempty(|timeout| {
                            let delivered = delivered.clone();
                            async move { delivered.lock().await.push(timeout.user_id) }
                        })
                        .await;
                    tokio::task::yield_now().await;
                }
            })
        };

        for producer in producers {
            producer.await.unwrap();
        }
        drainer.await.unwrap();

        // Whatever the drains missed is still queued; nothing vanished and
        // nothing was delivered twice.
        let leftover = queue
            .drain_if_nonempty(|timeout| {
                let delivered = delivered.clone();
                async move { delivered.lock().await.push(timeout.user_id) }
            })
            .await;

        let mut seen = delivered.lock().await.clone();
        assert_eq!(seen.len(), 100);
        assert!(leftover <= 100);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 100, "an entry was delivered twice");
    }
}
