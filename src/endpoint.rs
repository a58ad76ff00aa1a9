/**
 * endpoint.rs
 *
 * Owns the single UDP socket for a session: keeps its NAT mapping
 * alive, runs the punch state machine against symmetric-NAT timing
 * races, and exposes the transmit/receive surface the mux pipelines
 * build on once the peer channel is open.
 */

use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stun;

const PUNCH_SEND_INTERVAL: Duration = Duration::from_millis(200);
const PUNCH_SEND_ITERATIONS: u32 = 180;
const PUNCH_OVERALL_DEADLINE: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const DATAGRAM_BUF: usize = 4096;

/// A one-shot signal that, once set, stays set forever (§3 invariant:
/// `peer_confirmed` is monotonic).
struct ConfirmSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ConfirmSignal {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

pub struct Endpoint {
    socket: Arc<UdpSocket>,
    node_id: String,
    stun_server: SocketAddr,
    peer: parking_lot::RwLock<Option<SocketAddr>>,
    peer_confirmed: ConfirmSignal,
    keepalive_active: AtomicBool,
    cancel: CancellationToken,
}

impl Endpoint {
    /// Bind a fresh UDP socket and start the keepalive + receiver
    /// background tasks immediately, per §4.2.
    pub async fn new(stun_server: SocketAddr, node_id: String, cancel: CancellationToken) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let endpoint = Arc::new(Self {
            socket: Arc::new(socket),
            node_id,
            stun_server,
            peer: parking_lot::RwLock::new(None),
            peer_confirmed: ConfirmSignal::new(),
            keepalive_active: AtomicBool::new(true),
            cancel,
        });

        endpoint.clone().spawn_keepalive();
        endpoint.clone().spawn_receiver();

        Ok(endpoint)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn probe_reflexive(&self) -> Result<stun::ReflexiveAddr> {
        stun::probe(&self.socket, self.stun_server).await
    }

    /// Assign the peer endpoint. Per the invariant in §3, callers must
    /// only do this once per session.
    pub fn set_peer(&self, addr: SocketAddr) {
        let mut guard = self.peer.write();
        debug_assert!(guard.is_none(), "peer assigned more than once");
        *guard = Some(addr);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    pub fn peer_confirmed(&self) -> bool {
        self.peer_confirmed.is_set()
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Transmit to the configured peer.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let peer = self.peer().ok_or_else(|| anyhow!("PEER_UNSET"))?;
        self.socket.send_to(bytes, peer).await?;
        Ok(())
    }

    /// Receive at most one datagram within `timeout`, invoking
    /// `handler` on success. Timeouts and transport errors never
    /// propagate — the caller's loop simply re-enters.
    pub async fn recv<F: FnOnce(&[u8], SocketAddr)>(&self, handler: F, timeout: Duration) {
        let mut buf = [0u8; DATAGRAM_BUF];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => handler(&buf[..len], from),
            Ok(Err(e)) => {
                // e.g. ConnectionReset from an ICMP port-unreachable; recoverable.
                debug!(error = %e, "transient recv error on endpoint socket");
            }
            Err(_) => {}
        }
    }

    fn spawn_keepalive(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !self.keepalive_active.load(Ordering::SeqCst) {
                            return;
                        }
                        let request = stun::keepalive_request();
                        if let Err(e) = self.socket.send_to(&request, self.stun_server).await {
                            warn!(error = %e, "NAT-mapping keepalive send failed");
                        }
                    }
                }
            }
        });
    }

    fn spawn_receiver(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = [0u8; DATAGRAM_BUF];
            loop {
                if self.peer_confirmed.is_set() {
                    return;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    result = tokio::time::timeout(Duration::from_millis(300), self.socket.recv_from(&mut buf)) => {
                        let (len, from) = match result {
                            Ok(Ok(pair)) => pair,
                            Ok(Err(e)) => {
                                debug!(error = %e, "transient recv error while waiting for punch");
                                continue;
                            }
                            Err(_) => continue,
                        };

                        if self.peer() != Some(from) {
                            continue;
                        }

                        let text = String::from_utf8_lossy(&buf[..len]);
                        if text.contains("PUNCH") {
                            info!(%from, "received punch from peer");
                            let ack = format!("ACK from {}", self.node_id);
                            if let Err(e) = self.socket.send_to(ack.as_bytes(), from).await {
                                warn!(error = %e, "failed to reply to punch with ack");
                            }
                            self.peer_confirmed.set();
                        } else if text.contains("ACK") {
                            info!(%from, "received ack from peer");
                            self.peer_confirmed.set();
                        }
                    }
                }
            }
        });
    }

    fn stop_keepalive(&self) {
        self.keepalive_active.store(false, Ordering::SeqCst);
    }

    /// Drive the punch state machine: IDLE -> WAITING_SYNC -> SENDING
    /// -> (DONE | FAILED). Requires `peer` to already be set.
    pub async fn punch(&self) -> bool {
        if self.peer().is_none() {
            warn!("punch() called before peer assignment");
            return false;
        }

        let start = Instant::now();

        let wait = duration_until_next_decasecond();
        info!(wait_secs = wait.as_secs_f64(), "waiting for synchronization point");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.peer_confirmed.wait() => {
                self.stop_keepalive();
                return true;
            }
        }

        let payload = format!("PUNCH from {}", self.node_id).into_bytes();
        let send_loop = async {
            for i in 0..PUNCH_SEND_ITERATIONS {
                if self.peer_confirmed.is_set() {
                    return;
                }
                debug!(iteration = i, "sending punch datagram");
                let _ = self.send(&payload).await;
                tokio::time::sleep(PUNCH_SEND_INTERVAL).await;
            }
        };

        let remaining = PUNCH_OVERALL_DEADLINE.saturating_sub(start.elapsed());
        let confirmed = tokio::select! {
            _ = send_loop => self.peer_confirmed.is_set(),
            _ = self.peer_confirmed.wait() => true,
            _ = tokio::time::sleep(remaining) => false,
        };

        if confirmed {
            self.stop_keepalive();
            info!("punch succeeded");
        } else {
            warn!("punch failed: no peer confirmation within deadline");
        }
        confirmed
    }
}

/// Next wall-clock instant whose seconds-since-epoch is a multiple of
/// 10 — the synchronization point both sides align their burst to.
fn duration_until_next_decasecond() -> Duration {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = now.as_secs();
    let next_boundary = (secs / 10 + 1) * 10;
    Duration::from_secs(next_boundary - secs).saturating_sub(Duration::from_nanos(now.subsec_nanos() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decasecond_wait_is_bounded() {
        let wait = duration_until_next_decasecond();
        assert!(wait <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn confirm_signal_wakes_waiters() {
        let signal = Arc::new(ConfirmSignal::new());
        assert!(!signal.is_set());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.wait().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should complete")
            .unwrap();
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn send_without_peer_fails() {
        let cancel = CancellationToken::new();
        let endpoint = Endpoint::new("127.0.0.1:3478".parse().unwrap(), "node".to_string(), cancel)
            .await
            .unwrap();
        let err = endpoint.send(b"hi").await.unwrap_err();
        assert!(err.to_string().contains("PEER_UNSET"));
    }
}
