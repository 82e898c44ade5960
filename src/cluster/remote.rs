//! Remote dispatch between cluster members.
//!
//! Wire protocol: every message is a protobuf encoded [`RemoteMessage`]
//! preceded by its length as a big-endian `u32`:
//!
//! ```text
//! [4-byte length] [RemoteMessage]
//! ```
//!
//! Delivery is best effort. Records queued for a peer that cannot be reached
//! are dropped; the writer reconnects once the peer's backoff has passed.

use super::registry::Registry;
use crate::core::{ClusterConfig, Result, StrataError};
use crate::metrics::RemoteMessage;
use bytes::{BufMut, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Sends records to the process owning their worker instance.
#[async_trait::async_trait]
pub trait RemoteSender: Send + Sync {
    async fn send(&self, address: SocketAddr, message: RemoteMessage) -> Result<()>;
}

/// Length-prefixed frame of one message.
pub fn encode_frame(message: &RemoteMessage) -> Result<BytesMut> {
    let len = message.encoded_len();
    if len > MAX_FRAME_LEN {
        return Err(StrataError::remote(format!(
            "Message too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + len);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(len as u32);
    message.encode(&mut buf)?;
    Ok(buf)
}

/// Read one frame. `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<RemoteMessage>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(StrataError::remote(format!(
            "Message too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_LEN
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(RemoteMessage::decode(buf.as_slice())?))
}

/// Write side of one peer: a bounded frame queue and the time until which
/// the peer is considered down.
struct PeerLink {
    frames: mpsc::Sender<BytesMut>,
    down_until: Mutex<Option<Instant>>,
}

impl PeerLink {
    fn is_down(&self) -> bool {
        let mut down_until = self.down_until.lock();
        match *down_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *down_until = None;
                false
            },
            None => false,
        }
    }

    fn mark_down(&self, backoff: Duration) {
        *self.down_until.lock() = Some(Instant::now() + backoff);
    }
}

/// [`RemoteSender`] with one queue and one writer task per peer.
///
/// `send` only enqueues, so a slow or unreachable peer never blocks the
/// caller. A peer whose connect failed is skipped for `reconnect_backoff`,
/// and records sent to it meanwhile fail fast.
pub struct TcpRemoteSender {
    links: DashMap<SocketAddr, Arc<PeerLink>>,
    connect_timeout: Duration,
    reconnect_backoff: Duration,
    queue_capacity: usize,
}

impl TcpRemoteSender {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            links: DashMap::new(),
            connect_timeout: config.connect_timeout,
            reconnect_backoff: config.reconnect_backoff,
            queue_capacity: config.send_queue_capacity.max(1),
        }
    }

    fn link(&self, address: SocketAddr) -> Arc<PeerLink> {
        let entry = self.links.entry(address).or_insert_with(|| {
            let (frames, queue) = mpsc::channel(self.queue_capacity);
            let link = Arc::new(PeerLink {
                frames,
                down_until: Mutex::new(None),
            });
            tokio::spawn(write_loop(
                address,
                queue,
                Arc::clone(&link),
                self.connect_timeout,
                self.reconnect_backoff,
            ));
            link
        });
        Arc::clone(entry.value())
    }
}

#[async_trait::async_trait]
impl RemoteSender for TcpRemoteSender {
    async fn send(&self, address: SocketAddr, message: RemoteMessage) -> Result<()> {
        let frame = encode_frame(&message)?;
        let link = self.link(address);
        if link.is_down() {
            return Err(StrataError::network(format!("peer {} is down", address)));
        }
        link.frames.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => {
                StrataError::network(format!("send queue to {} is full", address))
            },
            TrySendError::Closed(_) => {
                StrataError::remote(format!("writer for {} has stopped", address))
            },
        })
    }
}

async fn connect(address: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| StrataError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })?
        .map_err(|e| StrataError::network(format!("Failed to connect to {}: {}", address, e)))?;
    stream.set_nodelay(true)?;
    debug!(peer = %address, "Connected");
    Ok(stream)
}

/// Drain one peer's queue onto its connection until every sender is gone.
async fn write_loop(
    address: SocketAddr,
    mut frames: mpsc::Receiver<BytesMut>,
    link: Arc<PeerLink>,
    connect_timeout: Duration,
    reconnect_backoff: Duration,
) {
    let mut stream: Option<TcpStream> = None;
    let mut dropped = 0u64;

    while let Some(frame) = frames.recv().await {
        if link.is_down() {
            dropped += 1;
            continue;
        }
        if stream.is_none() {
            match connect(address, connect_timeout).await {
                Ok(connected) => stream = Some(connected),
                Err(e) => {
                    link.mark_down(reconnect_backoff);
                    dropped += 1;
                    warn!(
                        peer = %address,
                        backoff_ms = u64::try_from(reconnect_backoff.as_millis()).unwrap_or(u64::MAX),
                        "Peer unreachable, dropping records: {}",
                        e
                    );
                    continue;
                },
            }
        }
        let Some(connection) = stream.as_mut() else {
            continue;
        };
        let written = async {
            connection.write_all(&frame).await?;
            connection.flush().await
        }
        .await;
        if let Err(e) = written {
            stream = None;
            dropped += 1;
            warn!(peer = %address, "Failed to send, reconnecting on next record: {}", e);
        }
    }

    debug!(peer = %address, dropped, "Peer writer stopped");
}

/// Accepts records forwarded by other members and hands them to local workers.
pub struct RemoteServer {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl RemoteServer {
    pub async fn bind(address: SocketAddr, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| StrataError::network(format!("Failed to bind {}: {}", address, e)))?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown is signalled.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(address = %self.local_addr()?, "Remote dispatch server listening");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&self.registry);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, registry, shutdown).await {
                                warn!(peer = %peer, "Remote connection closed: {}", e);
                            }
                        });
                    },
                    Err(e) => warn!("Failed to accept remote connection: {}", e),
                }
            }
        }
        info!("Remote dispatch server stopped");
        Ok(())
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    debug!(peer = %peer, "Remote peer connected");
    loop {
        let message = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
            frame = read_frame(&mut stream) => match frame? {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        let role = message.role.clone();
        if let Err(e) = deliver(&registry, message).await {
            warn!(peer = %peer, role = %role, category = e.category(), "Dropping remote record: {}", e);
        }
    }
}

async fn deliver(registry: &Registry, message: RemoteMessage) -> Result<()> {
    let index = usize::try_from(message.instance)
        .map_err(|_| StrataError::remote(format!("instance {} out of range", message.instance)))?;
    let handle = registry.local_instance(&message.role, index)?;
    let record = message
        .record
        .ok_or_else(|| StrataError::remote(format!("message for {} carries no record", message.role)))?;
    let metric = handle.worker().define().deserialize(&record)?;
    handle.submit(metric).await
}
