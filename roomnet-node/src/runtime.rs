use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::info;

use roomnet_core::bridge::{Bridge, BridgeConfig};
use roomnet_core::control::NodeConfig;
use roomnet_core::registry::MembershipRegistry;
use roomnet_core::transport::Transport;
use roomnet_core::tun;

use crate::udp::UdpTransport;

pub async fn run_node(cfg: NodeConfig, mut stop: watch::Receiver<bool>) -> Result<()> {
    info!(
        "node config: self={} subnet={}/{} mtu={} listen={}:{} peers={}",
        cfg.self_id,
        cfg.address,
        cfg.netmask,
        cfg.mtu,
        cfg.listen_addr,
        cfg.listen_port,
        cfg.peers.len()
    );

    let bind_addr: SocketAddr = format!("{}:{}", cfg.listen_addr, cfg.listen_port)
        .parse()
        .with_context(|| "listen_addr/listen_port is not a valid socket address")?;

    let transport = UdpTransport::bind(cfg.self_id, bind_addr, &cfg.tuning)
        .await
        .with_context(|| format!("failed to bind UDP transport to {bind_addr}"))?;

    let registry = Arc::new(MembershipRegistry::new(
        cfg.self_id,
        transport.clone() as Arc<dyn Transport>,
    ));

    let tun = tun::create_tun(&cfg.tun_name, cfg.mtu)
        .context("failed to open TUN device (root/Administrator required)")?;

    let mut bridge = Bridge::new(
        tun,
        transport.clone(),
        registry,
        BridgeConfig {
            address: cfg.address,
            netmask: cfg.netmask,
            mtu: cfg.mtu,
            poll: cfg.poll.to_tuning(),
        },
    );

    bridge
        .start_on(Handle::current())
        .context("failed to start bridge")?;

    // Seed the room from the static roster.
    for peer in &cfg.peers {
        transport.add_endpoint(peer.id, peer.endpoint);
        bridge.subnet().map_peer(peer.address, peer.id);
        bridge.add_peer(peer.id);
    }

    info!(
        "node up: device '{}' with {} peers",
        bridge.device_name(),
        cfg.peers.len()
    );

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("stop requested");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
        }
    }

    let stats = bridge.stats();
    info!(
        "shutting down: tun_rx={} tun_tx={} sent={} received={} dropped(no_route={} malformed={} stranger={})",
        stats.tun_rx_packets,
        stats.tun_tx_packets,
        stats.frames_sent,
        stats.frames_received,
        stats.dropped_no_route,
        stats.dropped_malformed,
        stats.dropped_unknown_sender
    );
    bridge.stop();

    Ok(())
}
