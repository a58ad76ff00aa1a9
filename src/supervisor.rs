/**
 * supervisor.rs
 *
 * Wires the bootstrap pipeline (NAT probe -> signaling rendezvous ->
 * punch) and, once the peer channel is open, starts the steady-state
 * worker tasks for the configured mode. Owns the shared cancellation
 * token and joins every spawned task on shutdown.
 */

use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, Mode};
use crate::endpoint::Endpoint;
use crate::mux::{self, ClientTable, ServerTable};
use crate::signaling::{SignalingPort, WebSocketSignaling};

const PEER_POLL_ROUNDS: u32 = 20;
const PEER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const PEER_BLOB_FRESHNESS: Duration = Duration::from_secs(20);

pub struct Supervisor {
    config: Config,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let cancel = self.cancel.clone();
        spawn_shutdown_listener(cancel.clone());

        let endpoint = Endpoint::new(self.config.stun_server, self.config.id.clone(), cancel.clone())
            .await
            .context("failed to bind tunnel socket")?;

        let reflexive = endpoint
            .probe_reflexive()
            .await
            .context("STUN_UNREACHABLE")?;
        info!(
            nat_class = ?reflexive.nat_class,
            public_ip = %reflexive.public_ip,
            public_port = reflexive.public_port,
            "NAT probe complete"
        );

        let mut signaling = WebSocketSignaling::connect(&self.config.signaling_url)
            .await
            .context("failed to connect to signaling server")?;

        publish_self(&mut signaling, &self.config.id, reflexive.public_ip, reflexive.public_port)
            .await
            .context("failed to publish reflexive address")?;

        let peer_addr = poll_peer(&mut signaling, &self.config.peer)
            .await
            .context("failed to discover peer endpoint")?;
        info!(%peer_addr, "peer endpoint resolved");
        endpoint.set_peer(peer_addr);

        if !endpoint.punch().await {
            anyhow::bail!("punch failed: no peer confirmation within deadline");
        }
        info!("peer channel established");

        let mut tasks = JoinSet::new();
        match self.config.mode {
            Mode::Client => start_client(&mut tasks, endpoint.clone(), self.config.port, cancel.clone()).await?,
            Mode::Server => start_server(&mut tasks, endpoint.clone(), self.config.port, cancel.clone()),
        }
        tasks.spawn(mux::client::run_heartbeat(endpoint.clone(), mux::HEARTBEAT_PERIOD, cancel.clone()));

        cancel.cancelled().await;
        info!("shutdown signal received, draining tasks");
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn start_client(
    tasks: &mut JoinSet<()>,
    endpoint: Arc<Endpoint>,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let local = Arc::new(
        UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind local listener on port {port}"))?,
    );
    let table = Arc::new(ClientTable::new());

    tasks.spawn(mux::client::run_local_listener(
        local.clone(),
        endpoint.clone(),
        table.clone(),
        cancel.clone(),
    ));
    tasks.spawn(mux::client::run_peer_receiver(local, endpoint.clone(), table.clone(), cancel.clone()));
    tasks.spawn(mux::client::run_janitor(
        endpoint,
        table,
        mux::JANITOR_SWEEP_PERIOD,
        mux::IDLE_EVICTION_THRESHOLD,
        cancel,
    ));
    Ok(())
}

fn start_server(tasks: &mut JoinSet<()>, endpoint: Arc<Endpoint>, port: u16, cancel: CancellationToken) {
    let table = Arc::new(ServerTable::new());

    tasks.spawn(mux::server::run_peer_receiver(port, endpoint, table.clone(), cancel.clone()));
    tasks.spawn(mux::server::run_janitor(
        table,
        mux::JANITOR_SWEEP_PERIOD,
        mux::IDLE_EVICTION_THRESHOLD,
        cancel,
    ));
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt signal");
            cancel.cancel();
        }
    });
}

async fn publish_self(
    signaling: &mut WebSocketSignaling,
    id: &str,
    public_ip: IpAddr,
    public_port: u16,
) -> Result<()> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let blob = format!("{public_ip}:{public_port}:{now}");
    signaling.upload(id, &blob).await
}

async fn poll_peer(signaling: &mut WebSocketSignaling, peer_id: &str) -> Result<SocketAddr> {
    for round in 0..PEER_POLL_ROUNDS {
        match signaling.download(peer_id).await {
            Ok(blob) => match parse_peer_blob(&blob) {
                Ok(addr) => return Ok(addr),
                Err(e) => warn!(round, error = %e, "peer blob stale or malformed, retrying"),
            },
            Err(e) => warn!(round, error = %e, "peer blob not yet available, retrying"),
        }
        tokio::time::sleep(PEER_POLL_INTERVAL).await;
    }
    Err(anyhow!("peer endpoint did not appear within the poll budget"))
}

fn parse_peer_blob(blob: &str) -> Result<SocketAddr> {
    let parts: Vec<&str> = blob.splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(anyhow!("malformed peer blob: {blob}"));
    }
    let ip: IpAddr = parts[0].parse().context("invalid ip in peer blob")?;
    let port: u16 = parts[1].parse().context("invalid port in peer blob")?;
    let ts: u64 = parts[2].parse().context("invalid timestamp in peer blob")?;

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    if now.saturating_sub(ts) > PEER_BLOB_FRESHNESS.as_secs() {
        return Err(anyhow!("peer blob stale (age {}s)", now.saturating_sub(ts)));
    }

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fresh_peer_blob() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let blob = format!("203.0.113.9:51000:{now}");
        let addr = parse_peer_blob(&blob).unwrap();
        assert_eq!(addr, "203.0.113.9:51000".parse().unwrap());
    }

    #[test]
    fn rejects_stale_peer_blob() {
        let old = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() - 100;
        let blob = format!("203.0.113.9:51000:{old}");
        assert!(parse_peer_blob(&blob).is_err());
    }

    #[test]
    fn rejects_malformed_peer_blob() {
        assert!(parse_peer_blob("not-a-blob").is_err());
    }
}
