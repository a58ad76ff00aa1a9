/**
 * mux/server.rs
 *
 * Server-side half of the session multiplexer: one ephemeral UDP
 * socket per flow ID forwards to the local service at `127.0.0.1:PORT`,
 * and a reader task per socket forwards service replies back over the
 * peer channel.
 */

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::mux::frame::{self, Frame};

const DATAGRAM_BUF: usize = 4096;
const IO_TIMEOUT: Duration = Duration::from_millis(200);

struct Entry {
    socket: Arc<UdpSocket>,
    last_activity: Instant,
}

/// `ServerSockets` from §3: flow ID -> exclusively-owned ephemeral
/// socket, plus its last-activity timestamp.
pub struct ServerTable {
    inner: parking_lot::Mutex<HashMap<u8, Entry>>,
}

impl ServerTable {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, id: u8) -> Option<Arc<UdpSocket>> {
        self.inner.lock().get(&id).map(|e| e.socket.clone())
    }

    pub fn touch(&self, id: u8, now: Instant) {
        if let Some(entry) = self.inner.lock().get_mut(&id) {
            entry.last_activity = now;
        }
    }

    /// Insert a freshly bound socket for `id` if one isn't already
    /// registered. Returns `true` if this call did the inserting — the
    /// caller should spawn exactly one reader task in that case.
    pub fn insert_if_absent(&self, id: u8, socket: Arc<UdpSocket>, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains_key(&id) {
            false
        } else {
            inner.insert(id, Entry { socket, last_activity: now });
            true
        }
    }

    /// Remove and return the socket so the caller can drop it — the
    /// map entry is only ever removed once, so the socket closes exactly once.
    pub fn remove(&self, id: u8) -> Option<Arc<UdpSocket>> {
        self.inner.lock().remove(&id).map(|e| e.socket)
    }

    pub fn evict_idle(&self, now: Instant, threshold: Duration) -> Vec<(u8, Arc<UdpSocket>)> {
        let mut inner = self.inner.lock();
        let stale: Vec<u8> = inner
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_activity) > threshold)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| inner.remove(&id).map(|e| (id, e.socket)))
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for ServerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader task for one ephemeral socket: forwards whatever the local
/// service sends back over the peer channel as a data frame. Exits
/// when the socket is removed from the table (closed by eviction or
/// `DISCONNECT`) or on shutdown.
fn spawn_ephemeral_reader(
    socket: Arc<UdpSocket>,
    id: u8,
    endpoint: Arc<Endpoint>,
    table: Arc<ServerTable>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; DATAGRAM_BUF];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(IO_TIMEOUT, socket.recv_from(&mut buf)) => {
                    match result {
                        Ok(Ok((len, _from))) => {
                            table.touch(id, Instant::now());
                            let data_frame = frame::encode_data(id, &buf[..len]);
                            if let Err(e) = endpoint.send(&data_frame).await {
                                warn!(error = %e, flow = id, "failed to forward service reply over peer channel");
                            }
                        }
                        Ok(Err(_)) => return,
                        Err(_) => {
                            if table.lookup(id).is_none() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });
}

/// For every datagram from the peer, apply the server-side state
/// transitions in §4.3.
pub async fn run_peer_receiver(
    local_service_port: u16,
    endpoint: Arc<Endpoint>,
    table: Arc<ServerTable>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let endpoint_for_closure = endpoint.clone();
        let table = table.clone();
        let cancel_for_closure = cancel.clone();
        endpoint
            .recv(
                move |bytes, _from| {
                    handle_peer_datagram(bytes, local_service_port, endpoint_for_closure, table, cancel_for_closure);
                },
                IO_TIMEOUT,
            )
            .await;
    }
}

fn handle_peer_datagram(
    bytes: &[u8],
    local_service_port: u16,
    endpoint: Arc<Endpoint>,
    table: Arc<ServerTable>,
    cancel: CancellationToken,
) {
    match frame::classify(bytes) {
        Some(Frame::Connect(id)) => {
            tokio::spawn(async move {
                if table.lookup(id).is_none() {
                    match UdpSocket::bind("0.0.0.0:0").await {
                        Ok(socket) => {
                            let socket = Arc::new(socket);
                            if table.insert_if_absent(id, socket.clone(), Instant::now()) {
                                info!(flow = id, "opened ephemeral socket for new flow");
                                spawn_ephemeral_reader(socket, id, endpoint.clone(), table.clone(), cancel);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, flow = id, "failed to bind ephemeral socket");
                            return;
                        }
                    }
                }
                if let Err(e) = endpoint.send(&frame::encode_connect_ack(id)).await {
                    warn!(error = %e, flow = id, "failed to send CONNECT_ACK");
                }
            });
        }
        Some(Frame::Disconnect(id)) => {
            if let Some(socket) = table.remove(id) {
                info!(flow = id, "closing ephemeral socket on DISCONNECT");
                drop(socket);
            }
        }
        Some(Frame::Heartbeat) => {}
        Some(Frame::Data(id, payload)) => {
            let payload = payload.to_vec();
            tokio::spawn(async move {
                match table.lookup(id) {
                    Some(socket) => {
                        table.touch(id, Instant::now());
                        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, local_service_port));
                        if let Err(e) = socket.send_to(&payload, dest).await {
                            warn!(error = %e, flow = id, "failed to forward to local service");
                        }
                    }
                    None => debug!(flow = id, "orphan data frame for unknown flow, dropping"),
                }
            });
        }
        Some(Frame::ConnectAck(_)) => {
            debug!("malformed frame for server role, dropping");
        }
        None => debug!("unclassifiable datagram, dropping"),
    }
}

pub async fn run_janitor(
    table: Arc<ServerTable>,
    sweep_period: Duration,
    idle_threshold: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let evicted = table.evict_idle(Instant::now(), idle_threshold);
                for (id, socket) in evicted {
                    info!(flow = id, "evicting idle server flow");
                    drop(socket);
                }
            }
        }
    }
}
