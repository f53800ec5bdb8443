//! LAN radio: UDP advertisement broadcast/scan plus a TCP pull transport.
//!
//! Advertisements go out as periodic datagrams to the configured destination
//! (a multicast group, or a unicast address for point-to-point setups).
//! Payloads too large to ride inline are pulled over TCP: the scanner's
//! session drives `pull_chunk` against the advertising node, whose `serve`
//! loop answers from its session's paging server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use nearby_core::chunk::PullStatus;
use nearby_core::identity::{MessageId, PeerId, ServiceId};
use nearby_core::radio::{Radio, RadioError, Sighting};
use nearby_core::session::PullHandle;
use nearby_core::PROTOCOL_VERSION;

use crate::config::LanConfig;
use crate::frame::{self, Frame, LEN_SIZE, MAX_FRAME_LEN};

/// Worst-case frame bytes around one chunk (length prefix, enum tag, vector
/// length, status).
const FRAME_OVERHEAD: usize = 32;

/// Chunk size that keeps one pull response inside the transfer unit.
pub fn chunk_size_for(transfer_unit: usize) -> usize {
    transfer_unit.saturating_sub(FRAME_OVERHEAD).max(1)
}

struct LanState {
    beacon: Option<JoinHandle<()>>,
    scan: Option<JoinHandle<()>>,
    /// Pull address per advertising node, learned from its adverts.
    peers: HashMap<PeerId, SocketAddr>,
}

type ConnSlot = Arc<Mutex<Option<TcpStream>>>;

struct LanInner {
    node: PeerId,
    service: ServiceId,
    cfg: LanConfig,
    state: Mutex<LanState>,
    /// One reusable pull connection per peer, so pulls to different peers
    /// never serialize on each other.
    conns: Mutex<HashMap<PeerId, ConnSlot>>,
}

#[derive(Clone)]
pub struct LanRadio {
    inner: Arc<LanInner>,
}

impl LanRadio {
    pub fn new(service: ServiceId, cfg: LanConfig) -> Self {
        Self {
            inner: Arc::new(LanInner {
                node: PeerId::random(),
                service,
                cfg,
                state: Mutex::new(LanState {
                    beacon: None,
                    scan: None,
                    peers: HashMap::new(),
                }),
                conns: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn node(&self) -> PeerId {
        self.inner.node
    }

    fn advert_dest(&self) -> Result<SocketAddr, RadioError> {
        format!(
            "{}:{}",
            self.inner.cfg.advert_addr, self.inner.cfg.advert_port
        )
        .parse()
        .map_err(|e: std::net::AddrParseError| RadioError::Io(e.to_string()))
    }
}

#[async_trait]
impl Radio for LanRadio {
    async fn start_broadcast(&self, id: MessageId, envelope: Vec<u8>) -> Result<(), RadioError> {
        let mut state = self.inner.state.lock().await;
        if state.beacon.is_some() {
            return Err(RadioError::AlreadyStarted);
        }
        let dest = self.advert_dest()?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| RadioError::Io(e.to_string()))?;
        let total_len = envelope.len() as u64;
        let inline = envelope.len() <= self.inner.cfg.inline_limit;
        let advert = Frame::Advert {
            protocol_version: PROTOCOL_VERSION,
            node: self.inner.node,
            service: self.inner.service,
            id,
            total_len,
            envelope: inline.then_some(envelope),
            pull_port: self.inner.cfg.pull_port,
        };
        let datagram =
            frame::encode_frame(&advert).map_err(|e| RadioError::Io(e.to_string()))?;
        let interval = Duration::from_millis(self.inner.cfg.beacon_interval_ms.max(10));
        state.beacon = Some(tokio::spawn(async move {
            loop {
                let _ = socket.send_to(&datagram, dest).await;
                tokio::time::sleep(interval).await;
            }
        }));
        Ok(())
    }

    async fn stop_broadcast(&self) {
        if let Some(beacon) = self.inner.state.lock().await.beacon.take() {
            beacon.abort();
        }
    }

    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Sighting>, RadioError> {
        let mut state = self.inner.state.lock().await;
        if state.scan.is_some() {
            return Err(RadioError::AlreadyStarted);
        }
        let socket =
            make_advert_socket(&self.inner.cfg).map_err(|e| RadioError::Io(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        state.scan = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let Ok((decoded, _)) = frame::decode_frame(&buf[..n]) else {
                    continue;
                };
                let Frame::Advert {
                    protocol_version,
                    node,
                    service,
                    id,
                    envelope,
                    pull_port,
                    ..
                } = decoded
                else {
                    continue;
                };
                if protocol_version != PROTOCOL_VERSION
                    || service != inner.service
                    || node == inner.node
                {
                    continue;
                }
                {
                    let mut st = inner.state.lock().await;
                    st.peers.insert(node, SocketAddr::new(from.ip(), pull_port));
                }
                if tx
                    .send(Sighting {
                        peer: node,
                        id,
                        envelope,
                    })
                    .is_err()
                {
                    break; // receiver gone: the session stopped
                }
            }
            debug!("scan loop ended");
        }));
        Ok(rx)
    }

    async fn stop_scan(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(scan) = state.scan.take() {
            scan.abort();
        }
        state.peers.clear();
        drop(state);
        self.inner.conns.lock().await.clear();
    }

    async fn pull_chunk(
        &self,
        peer: PeerId,
        id: MessageId,
        offset: usize,
    ) -> Result<(Vec<u8>, PullStatus), RadioError> {
        let addr = {
            let state = self.inner.state.lock().await;
            state.peers.get(&peer).copied()
        };
        let Some(addr) = addr else {
            return Err(RadioError::Unavailable);
        };
        let slot = {
            let mut conns = self.inner.conns.lock().await;
            conns
                .entry(peer)
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };
        let mut conn = slot.lock().await;
        if conn.is_none() {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| RadioError::Io(e.to_string()))?;
            *conn = Some(stream);
        }
        let request = Frame::PullRequest {
            protocol_version: PROTOCOL_VERSION,
            node: self.inner.node,
            id,
            offset: offset as u64,
        };
        let request =
            frame::encode_frame(&request).map_err(|e| RadioError::Io(e.to_string()))?;
        let exchanged = match conn.as_mut() {
            Some(stream) => exchange(stream, &request).await,
            None => return Err(RadioError::Unavailable),
        };
        match exchanged {
            Ok(Frame::PullResponse { bytes, status }) => {
                if status == PullStatus::EndOfData {
                    // Transfer done; the server drops our cursor on close.
                    *conn = None;
                }
                Ok((bytes, status))
            }
            Ok(Frame::PullDenied { .. }) => {
                *conn = None;
                Err(RadioError::Io("pull denied".to_string()))
            }
            Ok(_) => {
                *conn = None;
                Err(RadioError::Io("unexpected frame".to_string()))
            }
            Err(e) => {
                *conn = None;
                Err(RadioError::Io(e.to_string()))
            }
        }
    }
}

async fn exchange(stream: &mut TcpStream, request: &[u8]) -> std::io::Result<Frame> {
    stream.write_all(request).await?;
    stream.flush().await?;
    read_frame(stream).await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
    let mut len_buf = [0u8; LEN_SIZE];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    frame::decode_body(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn make_advert_socket(cfg: &LanConfig) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", cfg.advert_port))?;
    if let Ok(group) = cfg.advert_addr.parse::<std::net::Ipv4Addr>() {
        if group.is_multicast() {
            std_sock.join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)?;
            std_sock.set_multicast_ttl_v4(1)?;
        }
    }
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Accept pull connections and answer them from the session's paging server.
/// One task per connection; a closed connection retires the peer's cursors.
pub async fn serve<R: Radio>(listener: TcpListener, handle: PullHandle<R>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "pull connection accepted");
                let handle = handle.clone();
                tokio::spawn(async move {
                    handle_pull_conn(stream, handle).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn handle_pull_conn<R: Radio>(mut stream: TcpStream, handle: PullHandle<R>) {
    let mut node = None;
    loop {
        let request = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let Frame::PullRequest {
            protocol_version,
            node: n,
            id,
            offset,
        } = request
        else {
            break;
        };
        if protocol_version != PROTOCOL_VERSION {
            break;
        }
        node = Some(n);
        let reply = match handle.pull(n, id, offset as usize).await {
            Ok((bytes, status)) => Frame::PullResponse { bytes, status },
            Err(e) => {
                debug!(%id, error = %e, "pull refused");
                Frame::PullDenied { id }
            }
        };
        let Ok(bytes) = frame::encode_frame(&reply) else {
            break;
        };
        if stream.write_all(&bytes).await.is_err() {
            break;
        }
        if stream.flush().await.is_err() {
            break;
        }
    }
    if let Some(node) = node {
        handle.peer_disconnected(node).await;
    }
}
