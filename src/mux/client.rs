/**
 * mux/client.rs
 *
 * Client-side half of the session multiplexer: a local UDP listener
 * fans local application datagrams out over the peer channel, and a
 * peer receiver fans peer datagrams back in to the right local app.
 */

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
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

struct Inner {
    addr_index: HashMap<SocketAddr, u8>,
    pending: HashMap<u8, (SocketAddr, Instant)>,
    live: HashMap<u8, (SocketAddr, Instant)>,
    next_id: u16,
}

/// The three client-side flow directories (§3), serialized behind one
/// lock. Nothing here awaits or performs I/O while holding it.
pub struct ClientTable {
    inner: parking_lot::Mutex<Inner>,
}

pub enum Lookup {
    Existing(u8),
    New(u8),
}

impl ClientTable {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                addr_index: HashMap::new(),
                pending: HashMap::new(),
                live: HashMap::new(),
                next_id: frame::MIN_FLOW_ID as u16,
            }),
        }
    }

    /// Look up (or allocate) the flow ID for a local app address. The
    /// caller must send `CONNECT <id>` whenever `Lookup::New` comes back.
    pub fn flow_for_local(&self, addr: SocketAddr, now: Instant) -> Result<Lookup> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.addr_index.get(&addr) {
            if let Some(entry) = inner.live.get_mut(&id) {
                entry.1 = now;
            }
            return Ok(Lookup::Existing(id));
        }

        if inner.next_id > 255 {
            anyhow::bail!("FLOW_ID_EXHAUSTED");
        }
        let id = inner.next_id as u8;
        inner.next_id += 1;
        inner.addr_index.insert(addr, id);
        inner.pending.insert(id, (addr, now));
        Ok(Lookup::New(id))
    }

    /// `CONNECT_ACK <id>` arrived: promote pending -> live.
    pub fn confirm(&self, id: u8, now: Instant) {
        let mut inner = self.inner.lock();
        if let Some((addr, _)) = inner.pending.remove(&id) {
            inner.live.insert(id, (addr, now));
        }
    }

    /// A data frame for `id` arrived from the peer: resolve the local
    /// app address and refresh its activity timestamp.
    pub fn touch_live(&self, id: u8, now: Instant) -> Option<SocketAddr> {
        let mut inner = self.inner.lock();
        inner.live.get_mut(&id).map(|entry| {
            entry.1 = now;
            entry.0
        })
    }

    /// Evict entries idle past `threshold`. Returns the evicted flow
    /// IDs so the caller can emit `DISCONNECT` notifications outside
    /// the lock.
    pub fn evict_idle(&self, now: Instant, threshold: Duration) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let mut evicted = Vec::new();

        let stale: Vec<u8> = inner
            .pending
            .iter()
            .filter(|(_, (_, ts))| now.duration_since(*ts) > threshold)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some((addr, _)) = inner.pending.remove(&id) {
                inner.addr_index.remove(&addr);
                evicted.push(id);
            }
        }

        let stale: Vec<u8> = inner
            .live
            .iter()
            .filter(|(_, (_, ts))| now.duration_since(*ts) > threshold)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some((addr, _)) = inner.live.remove(&id) {
                inner.addr_index.remove(&addr);
                evicted.push(id);
            }
        }

        evicted
    }

    #[cfg(test)]
    fn live_len(&self) -> usize {
        self.inner.lock().live.len()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

/// For every datagram from a local app, allocate/refresh its flow and
/// forward it over the peer channel as a data frame.
pub async fn run_local_listener(
    local: Arc<UdpSocket>,
    endpoint: Arc<Endpoint>,
    table: Arc<ClientTable>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; DATAGRAM_BUF];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(IO_TIMEOUT, local.recv_from(&mut buf)) => {
                let (len, from) = match result {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        debug!(error = %e, "local listener recv error");
                        continue;
                    }
                    Err(_) => continue,
                };

                let now = Instant::now();
                let id = match table.flow_for_local(from, now) {
                    Ok(Lookup::Existing(id)) => id,
                    Ok(Lookup::New(id)) => {
                        info!(flow = id, %from, "new local flow");
                        if let Err(e) = endpoint.send(&frame::encode_connect(id)).await {
                            warn!(error = %e, flow = id, "failed to send CONNECT");
                        }
                        id
                    }
                    Err(e) => {
                        warn!(error = %e, "flow allocation failed, dropping datagram");
                        continue;
                    }
                };

                let data_frame = frame::encode_data(id, &buf[..len]);
                if let Err(e) = endpoint.send(&data_frame).await {
                    warn!(error = %e, flow = id, "failed to forward local datagram over peer channel");
                }
            }
        }
    }
}

/// For every datagram from the peer, apply the client-side state
/// transitions in §4.3 and forward data frames to the local app.
pub async fn run_peer_receiver(
    local: Arc<UdpSocket>,
    endpoint: Arc<Endpoint>,
    table: Arc<ClientTable>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        endpoint
            .recv(
                |bytes, _from| {
                    let now = Instant::now();
                    match frame::classify(bytes) {
                        Some(Frame::ConnectAck(id)) => {
                            table.confirm(id, now);
                            info!(flow = id, "flow confirmed live");
                        }
                        Some(Frame::Heartbeat) => {}
                        Some(Frame::Data(id, payload)) => {
                            if let Some(addr) = table.touch_live(id, now) {
                                let local = local.clone();
                                let payload = payload.to_vec();
                                tokio::spawn(async move {
                                    if let Err(e) = local.send_to(&payload, addr).await {
                                        warn!(error = %e, flow = id, "failed to deliver to local app");
                                    }
                                });
                            } else {
                                debug!(flow = id, "orphan data frame for unknown flow, dropping");
                            }
                        }
                        Some(Frame::Connect(_)) | Some(Frame::Disconnect(_)) => {
                            debug!("malformed frame for client role, dropping");
                        }
                        None => debug!("unclassifiable datagram, dropping"),
                    }
                },
                IO_TIMEOUT,
            )
            .await;
    }
}

/// Periodic eviction sweep: remove idle pending/live flows and notify
/// the peer with repeated `DISCONNECT` frames (datagram loss tolerance).
pub async fn run_janitor(
    endpoint: Arc<Endpoint>,
    table: Arc<ClientTable>,
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
                for id in evicted {
                    info!(flow = id, "evicting idle flow");
                    for _ in 0..5 {
                        if let Err(e) = endpoint.send(&frame::encode_disconnect(id)).await {
                            warn!(error = %e, flow = id, "failed to send DISCONNECT during eviction");
                        }
                    }
                }
            }
        }
    }
}

/// Heartbeat task: sends `HEARTBEAT ` to the peer every second.
pub async fn run_heartbeat(endpoint: Arc<Endpoint>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = endpoint.send(&frame::encode_heartbeat()).await {
                    warn!(error = %e, "heartbeat send failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocates_increasing_ids_starting_at_two() {
        let table = ClientTable::new();
        let a: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let now = Instant::now();

        let id_a = match table.flow_for_local(a, now).unwrap() {
            Lookup::New(id) => id,
            Lookup::Existing(_) => panic!("expected new flow"),
        };
        let id_b = match table.flow_for_local(b, now).unwrap() {
            Lookup::New(id) => id,
            Lookup::Existing(_) => panic!("expected new flow"),
        };

        assert_eq!(id_a, 2);
        assert_eq!(id_b, 3);
        assert_eq!(table.pending_len(), 2);
    }

    #[test]
    fn repeated_lookup_from_same_addr_is_stable() {
        let table = ClientTable::new();
        let a: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let now = Instant::now();

        let first = match table.flow_for_local(a, now).unwrap() {
            Lookup::New(id) => id,
            _ => panic!(),
        };
        let second = match table.flow_for_local(a, now).unwrap() {
            Lookup::Existing(id) => id,
            _ => panic!("expected existing flow on second lookup"),
        };
        assert_eq!(first, second);
    }

    #[test]
    fn confirm_moves_pending_to_live() {
        let table = ClientTable::new();
        let a: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let now = Instant::now();
        let id = match table.flow_for_local(a, now).unwrap() {
            Lookup::New(id) => id,
            _ => panic!(),
        };
        assert_eq!(table.pending_len(), 1);
        table.confirm(id, now);
        assert_eq!(table.pending_len(), 0);
        assert_eq!(table.live_len(), 1);
    }

    #[test]
    fn eviction_removes_idle_entries_and_addr_index() {
        let table = ClientTable::new();
        let a: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let old = Instant::now() - Duration::from_secs(60);
        {
            let mut inner = table.inner.lock();
            inner.addr_index.insert(a, 2);
            inner.live.insert(2, (a, old));
        }

        let evicted = table.evict_idle(Instant::now(), Duration::from_secs(30));
        assert_eq!(evicted, vec![2]);
        assert_eq!(table.live_len(), 0);

        // same address now allocates a fresh ID.
        let new_id = match table.flow_for_local(a, Instant::now()).unwrap() {
            Lookup::New(id) => id,
            Lookup::Existing(_) => panic!("expected fresh allocation after eviction"),
        };
        assert_eq!(new_id, 3);
    }

    #[test]
    fn flow_id_exhaustion_is_an_error() {
        let table = ClientTable::new();
        {
            let mut inner = table.inner.lock();
            inner.next_id = 256;
        }
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(table.flow_for_local(addr, Instant::now()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_evicts_after_idle_threshold_with_simulated_time() {
        let table = ClientTable::new();
        let a: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        table.flow_for_local(a, Instant::now()).unwrap();

        // Under a paused clock, `tokio::time::advance` moves both the
        // virtual ticker and `Instant::now()` together, so the eviction
        // boundary can be pinned down exactly without a real 30s sleep.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(table.evict_idle(Instant::now(), Duration::from_secs(30)).len(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.evict_idle(Instant::now(), Duration::from_secs(30)).len(), 1);
    }

    proptest! {
        #[test]
        fn next_flow_id_is_strictly_increasing(addr_count in 1usize..40) {
            let table = ClientTable::new();
            let now = Instant::now();
            let mut last_id: Option<u8> = None;

            for i in 0..addr_count {
                let addr: SocketAddr = format!("127.0.0.1:{}", 50000 + i).parse().unwrap();
                let id = match table.flow_for_local(addr, now).unwrap() {
                    Lookup::New(id) => id,
                    Lookup::Existing(id) => id,
                };
                if let Some(prev) = last_id {
                    prop_assert!(id > prev);
                }
                last_id = Some(id);
            }
        }

        #[test]
        fn addr_index_is_injective_for_live_flows(addr_count in 1usize..40) {
            let table = ClientTable::new();
            let now = Instant::now();
            let mut seen_ids = std::collections::HashSet::new();

            for i in 0..addr_count {
                let addr: SocketAddr = format!("127.0.0.1:{}", 50000 + i).parse().unwrap();
                if let Lookup::New(id) = table.flow_for_local(addr, now).unwrap() {
                    table.confirm(id, now);
                    prop_assert!(seen_ids.insert(id), "flow id {} reused across distinct addresses", id);
                }
            }
        }
    }
}
