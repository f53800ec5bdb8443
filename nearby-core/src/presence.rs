//! Presence registry: per-identity liveness timers driving Found/Lost.
//!
//! One mutex owns the entry map; expiry timers are spawned one-shot sleeps
//! that re-enter through that same mutex, so observations and timer fires
//! against the same identity are serialized. A fire that lost the race to an
//! observation or a stop finds a bumped epoch or a missing entry and does
//! nothing; cancellation is by handle abort plus that epoch check, never a
//! flag inside the callback.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::NearbyEvent;
use crate::identity::MessageId;

/// Default liveness window before an unrenewed identity is reported lost.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(10);

/// Outcome of an observation, reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting of this appearance; a Found event was emitted.
    Found,
    /// Liveness extended; nothing emitted.
    Renewed,
}

struct PresenceEntry {
    payload: Option<Vec<u8>>,
    last_seen: Instant,
    epoch: u64,
    timer: JoinHandle<()>,
}

struct Inner {
    entries: HashMap<MessageId, PresenceEntry>,
    next_epoch: u64,
}

/// Tracks which identities are currently present.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<NearbyEvent>,
    ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(ttl: Duration, events: mpsc::UnboundedSender<NearbyEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                next_epoch: 0,
            })),
            events,
            ttl,
        }
    }

    /// Record a sighting of `id`. The first sighting of an appearance emits
    /// Found exactly once and arms the expiry timer; every later sighting
    /// rearms the timer and emits nothing. A `None` payload never clears a
    /// payload recorded earlier.
    pub async fn observe(&self, id: MessageId, payload: Option<Vec<u8>>) -> Observation {
        let mut inner = self.inner.lock().await;
        let epoch = inner.next_epoch;
        inner.next_epoch += 1;
        if let Some(entry) = inner.entries.get_mut(&id) {
            // Cancel before touching state: a fire that already passed the
            // sleep finds a newer epoch and backs off.
            entry.timer.abort();
            entry.epoch = epoch;
            entry.last_seen = Instant::now();
            if payload.is_some() {
                entry.payload = payload;
            }
            entry.timer = self.arm(id, epoch);
            return Observation::Renewed;
        }
        let timer = self.arm(id, epoch);
        inner.entries.insert(
            id,
            PresenceEntry {
                payload: payload.clone(),
                last_seen: Instant::now(),
                epoch,
                timer,
            },
        );
        debug!(%id, "presence found");
        let _ = self.events.send(NearbyEvent::Found { id, payload });
        Observation::Found
    }

    fn arm(&self, id: MessageId, epoch: u64) -> JoinHandle<()> {
        let inner: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let events = self.events.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = inner.upgrade() else { return };
            let mut inner = inner.lock().await;
            let expired = inner
                .entries
                .get(&id)
                .map(|entry| entry.epoch == epoch)
                .unwrap_or(false);
            if expired {
                if let Some(entry) = inner.entries.remove(&id) {
                    debug!(%id, "presence lost");
                    let _ = events.send(NearbyEvent::Lost {
                        id,
                        payload: entry.payload,
                    });
                }
            }
        })
    }

    /// Clear every entry and cancel every timer without emitting Lost. Used
    /// when the session itself ends rather than each peer.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        for (_, entry) in inner.entries.drain() {
            entry.timer.abort();
        }
    }

    pub async fn contains(&self, id: MessageId) -> bool {
        self.inner.lock().await.entries.contains_key(&id)
    }

    pub async fn ids(&self) -> BTreeSet<MessageId> {
        self.inner.lock().await.entries.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// How long ago `id` was last observed.
    pub async fn idle_for(&self, id: MessageId) -> Option<Duration> {
        self.inner
            .lock()
            .await
            .entries
            .get(&id)
            .map(|entry| entry.last_seen.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const TTL: Duration = Duration::from_millis(100);

    fn registry() -> (PresenceRegistry, mpsc::UnboundedReceiver<NearbyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PresenceRegistry::new(TTL, tx), rx)
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<NearbyEvent>,
        within: Duration,
    ) -> Option<NearbyEvent> {
        timeout(within, rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn found_then_lost_after_ttl() {
        let (registry, mut rx) = registry();
        let id = MessageId::random();

        let obs = registry.observe(id, Some(b"x".to_vec())).await;
        assert_eq!(obs, Observation::Found);
        assert!(matches!(
            next_event(&mut rx, Duration::from_millis(50)).await,
            Some(NearbyEvent::Found { .. })
        ));

        let lost = next_event(&mut rx, TTL * 4).await;
        match lost {
            Some(NearbyEvent::Lost { id: lost_id, payload }) => {
                assert_eq!(lost_id, id);
                assert_eq!(payload, Some(b"x".to_vec()));
            }
            other => panic!("expected Lost, got {other:?}"),
        }
        assert_eq!(registry.len().await, 0);

        // Idempotent: a second wait produces nothing further.
        assert!(next_event(&mut rx, TTL * 2).await.is_none());
    }

    #[tokio::test]
    async fn back_to_back_observations_emit_one_found() {
        let (registry, mut rx) = registry();
        let id = MessageId::random();

        assert_eq!(registry.observe(id, None).await, Observation::Found);
        assert_eq!(registry.observe(id, None).await, Observation::Renewed);
        assert_eq!(registry.observe(id, None).await, Observation::Renewed);

        assert!(matches!(
            next_event(&mut rx, Duration::from_millis(50)).await,
            Some(NearbyEvent::Found { .. })
        ));
        // No second Found before the TTL runs out.
        match next_event(&mut rx, TTL * 3).await {
            Some(NearbyEvent::Lost { .. }) | None => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn renewal_prevents_loss() {
        let (registry, mut rx) = registry();
        let id = MessageId::random();

        registry.observe(id, None).await;
        let _ = next_event(&mut rx, Duration::from_millis(50)).await; // Found

        // Keep renewing at intervals well under the TTL.
        for _ in 0..8 {
            tokio::time::sleep(TTL / 3).await;
            assert_eq!(registry.observe(id, None).await, Observation::Renewed);
        }
        assert!(
            next_event(&mut rx, Duration::from_millis(20)).await.is_none(),
            "no Lost while renewals keep arriving"
        );
        assert!(registry.contains(id).await);
    }

    #[tokio::test]
    async fn renewal_keeps_last_known_payload() {
        let (registry, mut rx) = registry();
        let id = MessageId::random();

        registry.observe(id, Some(b"first".to_vec())).await;
        registry.observe(id, None).await; // sighting without data
        registry.observe(id, Some(b"second".to_vec())).await;
        let _ = next_event(&mut rx, Duration::from_millis(50)).await; // Found

        match next_event(&mut rx, TTL * 4).await {
            Some(NearbyEvent::Lost { payload, .. }) => {
                assert_eq!(payload, Some(b"second".to_vec()));
            }
            other => panic!("expected Lost, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_clears_without_lost_events() {
        let (registry, mut rx) = registry();
        let a = MessageId::random();
        let b = MessageId::random();

        registry.observe(a, None).await;
        registry.observe(b, None).await;
        let _ = next_event(&mut rx, Duration::from_millis(50)).await;
        let _ = next_event(&mut rx, Duration::from_millis(50)).await;

        registry.stop().await;
        assert_eq!(registry.len().await, 0);
        assert!(
            next_event(&mut rx, TTL * 3).await.is_none(),
            "stop must suppress Lost"
        );
    }

    #[tokio::test]
    async fn reusable_after_stop() {
        let (registry, mut rx) = registry();
        let id = MessageId::random();

        registry.observe(id, None).await;
        registry.stop().await;

        assert_eq!(registry.observe(id, None).await, Observation::Found);
        let _ = next_event(&mut rx, Duration::from_millis(50)).await; // first Found
        assert!(matches!(
            next_event(&mut rx, Duration::from_millis(50)).await,
            Some(NearbyEvent::Found { .. })
        ));
    }

    #[tokio::test]
    async fn distinct_identities_expire_independently() {
        let (registry, mut rx) = registry();
        let a = MessageId::random();
        let b = MessageId::random();

        registry.observe(a, Some(vec![b'a'])).await;
        registry.observe(b, Some(vec![b'b'])).await;
        let _ = next_event(&mut rx, Duration::from_millis(50)).await;
        let _ = next_event(&mut rx, Duration::from_millis(50)).await;

        // Keep `b` alive while `a` ages out.
        let deadline = Instant::now() + TTL * 3;
        let mut lost_a = None;
        while Instant::now() < deadline {
            registry.observe(b, None).await;
            if let Some(event) = next_event(&mut rx, TTL / 4).await {
                lost_a = Some(event);
                break;
            }
        }
        match lost_a {
            Some(NearbyEvent::Lost { id, payload }) => {
                assert_eq!(id, a);
                assert_eq!(payload, Some(vec![b'a']));
            }
            other => panic!("expected Lost for a, got {other:?}"),
        }
        assert!(registry.contains(b).await);
        assert!(!registry.contains(a).await);
    }
}
