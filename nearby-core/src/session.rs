//! Session controller: publish/subscribe state machines over a [`Radio`].
//!
//! Publish and subscribe are independent state machines (`Idle <-> Active`)
//! that may be active simultaneously. Each has its own serialization domain:
//! one mutex through which externally arriving transport events and timer
//! callbacks are funneled as tasks, so nothing races on the same identity's
//! state. Lock order, where nesting is unavoidable, is session domain before
//! registry; the paging and registry maps are never locked together.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::{PagingServer, PullStatus, Reassembler};
use crate::config::Config;
use crate::error::NearbyError;
use crate::events::NearbyEvent;
use crate::identity::{MessageId, PeerId};
use crate::presence::PresenceRegistry;
use crate::protocol::Message;
use crate::radio::{Radio, Sighting};
use crate::wire::{self, EnvelopeEncodeError};

/// Snapshot of session state. Reads atomics and the registry only; never
/// waits on an in-flight transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub publishing: bool,
    pub subscribing: bool,
    pub known: BTreeSet<MessageId>,
}

struct PublishState {
    current: Option<MessageId>,
    paging: PagingServer,
    expiry: Option<JoinHandle<()>>,
    epoch: u64,
}

struct SubscribeState {
    scan: Option<JoinHandle<()>>,
    reassembler: Reassembler,
    pulls: HashMap<MessageId, JoinHandle<()>>,
    expiry: Option<JoinHandle<()>>,
    epoch: u64,
}

struct Shared<R: Radio> {
    radio: R,
    events: mpsc::UnboundedSender<NearbyEvent>,
    registry: PresenceRegistry,
    publish: Mutex<PublishState>,
    subscribe: Mutex<SubscribeState>,
    publishing: AtomicBool,
    subscribing: AtomicBool,
}

/// Process-wide session instance with an explicit lifecycle: construct once,
/// share by cloned handle, [`shutdown`](NearbySession::shutdown) to tear
/// down. Not a global.
pub struct NearbySession<R: Radio> {
    shared: Arc<Shared<R>>,
}

impl<R: Radio> Clone for NearbySession<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Serving side of the pull protocol, for transport hosts: answers remote
/// peers' chunk reads out of the session's paging server and tracks the
/// negotiated transfer unit.
pub struct PullHandle<R: Radio> {
    shared: Arc<Shared<R>>,
}

impl<R: Radio> Clone for PullHandle<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: Radio> PullHandle<R> {
    /// Serve one chunk of a published payload.
    pub async fn pull(
        &self,
        peer: PeerId,
        id: MessageId,
        offset: usize,
    ) -> Result<(Vec<u8>, PullStatus), NearbyError> {
        let mut st = self.shared.publish.lock().await;
        st.paging.pull(id, peer, offset)
    }

    /// A pulling peer's connection went away; retire its cursors.
    pub async fn peer_disconnected(&self, peer: PeerId) {
        let mut st = self.shared.publish.lock().await;
        st.paging.disconnect(peer);
    }

    /// Transfer-unit renegotiation; applies to the next pull.
    pub async fn set_chunk_size(&self, chunk_size: usize) {
        let mut st = self.shared.publish.lock().await;
        st.paging.set_chunk_size(chunk_size);
    }
}

impl<R: Radio> NearbySession<R> {
    /// Build a session over `radio`. The returned receiver carries every
    /// Found/Lost/Expired event the session ever emits.
    pub fn new(radio: R, config: Config) -> (Self, mpsc::UnboundedReceiver<NearbyEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = PresenceRegistry::new(config.presence_ttl, events_tx.clone());
        let shared = Arc::new(Shared {
            radio,
            events: events_tx,
            registry,
            publish: Mutex::new(PublishState {
                current: None,
                paging: PagingServer::new(config.chunk_size),
                expiry: None,
                epoch: 0,
            }),
            subscribe: Mutex::new(SubscribeState {
                scan: None,
                reassembler: Reassembler::new(),
                pulls: HashMap::new(),
                expiry: None,
                epoch: 0,
            }),
            publishing: AtomicBool::new(false),
            subscribing: AtomicBool::new(false),
        });
        (Self { shared }, events_rx)
    }

    pub fn pull_handle(&self) -> PullHandle<R> {
        PullHandle {
            shared: self.shared.clone(),
        }
    }

    /// Publish `message`, replacing any active publication (stop-then-start,
    /// never a second concurrent advertisement). With a TTL the publication
    /// expires on its own, emitting `PublishExpired` before stopping. A
    /// transport failure leaves the state machine Idle.
    pub async fn start_publish(
        &self,
        message: Message,
        ttl: Option<Duration>,
    ) -> Result<(), NearbyError> {
        let envelope = wire::encode_message(&message).map_err(|e| match e {
            EnvelopeEncodeError::TooLarge { size, limit } => {
                NearbyError::PayloadTooLarge { size, limit }
            }
            other => NearbyError::TransportUnavailable(other.to_string()),
        })?;

        let mut st = self.shared.publish.lock().await;
        if let Some(old) = st.current.take() {
            debug!(%old, "replacing active publication");
            cancel_timer(&mut st.expiry);
            st.paging.remove_payload(old);
            self.shared.radio.stop_broadcast().await;
            self.shared.publishing.store(false, Ordering::SeqCst);
        }
        st.epoch = st.epoch.wrapping_add(1);

        let id = message.id;
        if !st.paging.add_payload(id, envelope.clone()) {
            // Same identity republished; refresh the served bytes.
            st.paging.remove_payload(id);
            st.paging.add_payload(id, envelope.clone());
        }
        if let Err(e) = self.shared.radio.start_broadcast(id, envelope).await {
            st.paging.remove_payload(id);
            return Err(e.into());
        }
        st.current = Some(id);
        self.shared.publishing.store(true, Ordering::SeqCst);
        if let Some(ttl) = ttl {
            st.expiry = Some(self.spawn_publish_expiry(ttl, st.epoch));
        }
        info!(%id, ttl = ?ttl, "publish started");
        Ok(())
    }

    /// Stop publishing. Idempotent.
    pub async fn stop_publish(&self) {
        let mut st = self.shared.publish.lock().await;
        st.epoch = st.epoch.wrapping_add(1);
        cancel_timer(&mut st.expiry);
        let Some(id) = st.current.take() else {
            return;
        };
        st.paging.remove_payload(id);
        self.shared.radio.stop_broadcast().await;
        self.shared.publishing.store(false, Ordering::SeqCst);
        info!(%id, "publish stopped");
    }

    /// Start scanning. A second call while already subscribed is treated as
    /// an unsubscribe (toggle semantics). With a TTL the scan expires on its
    /// own, emitting `SubscribeExpired` before stopping. A transport failure
    /// leaves the state machine Idle.
    pub async fn start_subscribe(&self, ttl: Option<Duration>) -> Result<(), NearbyError> {
        let mut st = self.shared.subscribe.lock().await;
        if st.scan.is_some() {
            Self::subscribe_stop_locked(&self.shared, &mut st).await;
            info!("subscribe toggled off");
            return Ok(());
        }
        st.epoch = st.epoch.wrapping_add(1);
        let rx = self.shared.radio.start_scan().await?;
        st.scan = Some(self.spawn_scan_loop(rx));
        self.shared.subscribing.store(true, Ordering::SeqCst);
        if let Some(ttl) = ttl {
            st.expiry = Some(self.spawn_subscribe_expiry(ttl, st.epoch));
        }
        info!(ttl = ?ttl, "subscribe started");
        Ok(())
    }

    /// Stop scanning. Idempotent. Partial transfers are discarded and the
    /// registry is cleared without per-entry Lost events: the session itself
    /// is ending, not each peer.
    pub async fn stop_subscribe(&self) {
        let mut st = self.shared.subscribe.lock().await;
        if st.scan.is_none() {
            return;
        }
        Self::subscribe_stop_locked(&self.shared, &mut st).await;
        info!("subscribe stopped");
    }

    /// Tear down both session types.
    pub async fn shutdown(&self) {
        self.stop_publish().await;
        self.stop_subscribe().await;
    }

    pub async fn status(&self) -> Status {
        Status {
            publishing: self.shared.publishing.load(Ordering::SeqCst),
            subscribing: self.shared.subscribing.load(Ordering::SeqCst),
            known: self.shared.registry.ids().await,
        }
    }

    async fn subscribe_stop_locked(shared: &Arc<Shared<R>>, st: &mut SubscribeState) {
        st.epoch = st.epoch.wrapping_add(1);
        cancel_timer(&mut st.expiry);
        if let Some(scan) = st.scan.take() {
            scan.abort();
        }
        for (_, task) in st.pulls.drain() {
            task.abort();
        }
        st.reassembler.clear();
        shared.radio.stop_scan().await;
        shared.subscribing.store(false, Ordering::SeqCst);
        shared.registry.stop().await;
    }

    fn spawn_publish_expiry(&self, ttl: Duration, epoch: u64) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut st = shared.publish.lock().await;
            if st.epoch != epoch {
                return; // canceled or superseded while we slept
            }
            let Some(id) = st.current.take() else {
                return;
            };
            // This very task owns the handle in the slot; drop it without
            // aborting ourselves mid-sequence.
            st.expiry.take();
            let _ = shared.events.send(NearbyEvent::PublishExpired);
            st.paging.remove_payload(id);
            shared.radio.stop_broadcast().await;
            shared.publishing.store(false, Ordering::SeqCst);
            info!(%id, "publish expired");
        })
    }

    fn spawn_subscribe_expiry(&self, ttl: Duration, epoch: u64) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut st = shared.subscribe.lock().await;
            if st.epoch != epoch || st.scan.is_none() {
                return;
            }
            st.expiry.take();
            let _ = shared.events.send(NearbyEvent::SubscribeExpired);
            Self::subscribe_stop_locked(&shared, &mut st).await;
            info!("subscribe expired");
        })
    }

    fn spawn_scan_loop(&self, mut rx: mpsc::UnboundedReceiver<Sighting>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(sighting) = rx.recv().await {
                Self::handle_sighting(&shared, sighting).await;
            }
            debug!("scan stream ended");
        })
    }

    async fn handle_sighting(shared: &Arc<Shared<R>>, sighting: Sighting) {
        if !shared.subscribing.load(Ordering::SeqCst) {
            return;
        }
        let Sighting { peer, id, envelope } = sighting;

        if let Some(envelope) = envelope {
            // Inline payload: decode and observe directly.
            match wire::decode_message(&envelope) {
                Ok((message, _)) => {
                    shared.registry.observe(id, Some(message.payload)).await;
                }
                Err(e) => {
                    warn!(%id, error = %e, "discarding undecodable inline envelope");
                }
            }
            return;
        }

        if shared.registry.contains(id).await {
            // Known identity: the sighting only renews liveness.
            shared.registry.observe(id, None).await;
            return;
        }

        let mut st = shared.subscribe.lock().await;
        if st.scan.is_none() {
            return; // stopped while this sighting was in flight
        }
        if st.reassembler.in_flight(id) || st.pulls.contains_key(&id) {
            return; // one transfer per identity, never a presence entry too
        }
        if shared.registry.contains(id).await {
            // A transfer for this identity completed while we waited on the
            // lock; this sighting is a renewal after all.
            drop(st);
            shared.registry.observe(id, None).await;
            return;
        }
        let task = Self::spawn_pull(shared, peer, id);
        st.pulls.insert(id, task);
    }

    /// Drive one transfer: pull chunks sequentially from `peer`, feeding the
    /// reassembler, until the end-of-data sentinel or a transport failure.
    fn spawn_pull(shared: &Arc<Shared<R>>, peer: PeerId, id: MessageId) -> JoinHandle<()> {
        let shared = shared.clone();
        tokio::spawn(async move {
            debug!(%id, %peer, "pull transfer started");
            let mut offset = 0usize;
            loop {
                match shared.radio.pull_chunk(peer, id, offset).await {
                    Ok((bytes, PullStatus::Ok)) => {
                        offset += bytes.len();
                        let mut st = shared.subscribe.lock().await;
                        st.reassembler.on_chunk(id, &bytes, PullStatus::Ok);
                    }
                    Ok((bytes, PullStatus::EndOfData)) => {
                        // Hold the subscribe lock until the registry entry
                        // exists, so a concurrent sighting can never start a
                        // second transfer for this identity.
                        let mut st = shared.subscribe.lock().await;
                        let buffer = st.reassembler.on_chunk(id, &bytes, PullStatus::EndOfData);
                        if let Some(buffer) = buffer {
                            Self::finalize_transfer(&shared, id, buffer).await;
                        }
                        st.pulls.remove(&id);
                        return;
                    }
                    Err(e) => {
                        // Absorbed locally: a half-received message must
                        // never be surfaced as present.
                        let mut st = shared.subscribe.lock().await;
                        st.reassembler.abandon(id);
                        st.pulls.remove(&id);
                        debug!(%id, %peer, error = %e, "{}", NearbyError::TransferAbandoned(id));
                        return;
                    }
                }
            }
        })
    }

    async fn finalize_transfer(shared: &Arc<Shared<R>>, id: MessageId, buffer: Vec<u8>) {
        match wire::decode_message(&buffer) {
            Ok((message, _)) => {
                debug!(%id, len = message.payload.len(), "transfer complete");
                shared.registry.observe(id, Some(message.payload)).await;
            }
            Err(e) => {
                warn!(%id, error = %e, "discarding transfer with undecodable envelope");
            }
        }
    }
}

fn cancel_timer(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}
