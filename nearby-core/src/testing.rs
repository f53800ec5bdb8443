//! In-memory radio for exercising sessions without sockets.
//!
//! A [`LoopbackMedium`] connects any number of [`LoopbackRadio`]s: adverts
//! are re-delivered to every scanning station on a fixed cadence (so
//! liveness renewal is exercised end-to-end), and pulls are answered by the
//! publishing session's [`PullHandle`] registered with the medium, the same
//! wiring a real host does through its attribute server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::chunk::PullStatus;
use crate::identity::{MessageId, PeerId};
use crate::radio::{Radio, RadioError, Sighting};
use crate::session::PullHandle;

struct Advert {
    id: MessageId,
    envelope: Vec<u8>,
}

struct Station {
    advert: Option<Advert>,
    scan_tx: Option<mpsc::UnboundedSender<Sighting>>,
    handle: Option<PullHandle<LoopbackRadio>>,
}

struct MediumInner {
    stations: HashMap<PeerId, Station>,
}

/// Shared in-memory broadcast medium.
#[derive(Clone, Default)]
pub struct LoopbackMedium {
    inner: Arc<Mutex<MediumInner>>,
}

impl Default for MediumInner {
    fn default() -> Self {
        Self {
            stations: HashMap::new(),
        }
    }
}

impl LoopbackMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new radio. `inline_limit` is the largest envelope the
    /// advertisement itself carries (0 forces every payload through the pull
    /// path); `advert_interval` is the re-broadcast cadence.
    pub async fn radio(&self, inline_limit: usize, advert_interval: Duration) -> LoopbackRadio {
        let peer = PeerId::random();
        self.inner.lock().await.stations.insert(
            peer,
            Station {
                advert: None,
                scan_tx: None,
                handle: None,
            },
        );
        LoopbackRadio {
            peer,
            inline_limit,
            advert_interval,
            medium: self.clone(),
            beacon: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the pull-serving side of a session, keyed by the radio that
    /// publishes through it.
    pub async fn register_puller(&self, peer: PeerId, handle: PullHandle<LoopbackRadio>) {
        if let Some(station) = self.inner.lock().await.stations.get_mut(&peer) {
            station.handle = Some(handle);
        }
    }

    async fn deliver_once(&self, from: PeerId, inline_limit: usize) {
        let inner = self.inner.lock().await;
        let Some(station) = inner.stations.get(&from) else {
            return;
        };
        let Some(advert) = &station.advert else {
            return;
        };
        let envelope = (advert.envelope.len() <= inline_limit).then(|| advert.envelope.clone());
        for (peer, other) in &inner.stations {
            if *peer == from {
                continue;
            }
            if let Some(tx) = &other.scan_tx {
                let _ = tx.send(Sighting {
                    peer: from,
                    id: advert.id,
                    envelope: envelope.clone(),
                });
            }
        }
    }
}

/// One station on a [`LoopbackMedium`].
#[derive(Clone)]
pub struct LoopbackRadio {
    peer: PeerId,
    inline_limit: usize,
    advert_interval: Duration,
    medium: LoopbackMedium,
    beacon: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LoopbackRadio {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

#[async_trait]
impl Radio for LoopbackRadio {
    async fn start_broadcast(&self, id: MessageId, envelope: Vec<u8>) -> Result<(), RadioError> {
        {
            let mut inner = self.medium.inner.lock().await;
            let station = inner
                .stations
                .get_mut(&self.peer)
                .ok_or(RadioError::Unavailable)?;
            station.advert = Some(Advert { id, envelope });
        }
        let mut beacon = self.beacon.lock().await;
        if let Some(old) = beacon.take() {
            old.abort();
        }
        let medium = self.medium.clone();
        let from = self.peer;
        let inline_limit = self.inline_limit;
        let interval = self.advert_interval;
        *beacon = Some(tokio::spawn(async move {
            loop {
                medium.deliver_once(from, inline_limit).await;
                tokio::time::sleep(interval).await;
            }
        }));
        Ok(())
    }

    async fn stop_broadcast(&self) {
        if let Some(beacon) = self.beacon.lock().await.take() {
            beacon.abort();
        }
        if let Some(station) = self.medium.inner.lock().await.stations.get_mut(&self.peer) {
            station.advert = None;
        }
    }

    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Sighting>, RadioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.medium.inner.lock().await;
        let station = inner
            .stations
            .get_mut(&self.peer)
            .ok_or(RadioError::Unavailable)?;
        if station.scan_tx.is_some() {
            return Err(RadioError::AlreadyStarted);
        }
        station.scan_tx = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) {
        if let Some(station) = self.medium.inner.lock().await.stations.get_mut(&self.peer) {
            station.scan_tx = None;
        }
    }

    async fn pull_chunk(
        &self,
        peer: PeerId,
        id: MessageId,
        offset: usize,
    ) -> Result<(Vec<u8>, PullStatus), RadioError> {
        let handle = {
            let inner = self.medium.inner.lock().await;
            inner.stations.get(&peer).and_then(|s| s.handle.clone())
        };
        let Some(handle) = handle else {
            return Err(RadioError::Unavailable);
        };
        handle
            .pull(self.peer, id, offset)
            .await
            .map_err(|e| RadioError::Io(e.to_string()))
    }
}
