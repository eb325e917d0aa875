//! wnet-sim: a Winenet mesh over a simulated lossy medium.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use winenet::AgencyUid;
use winenet_core::config::WinenetConfig;
use winenet_sim::{Consumer, Mesh, Producer, Report, SimNode, TrafficShape, TrafficStats};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = WinenetConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = WinenetConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        WinenetConfig::default()
    });
    config
        .protocol
        .validate()
        .context("invalid protocol configuration")?;

    let sim = config.simulation.clone();
    tracing::info!(
        nodes = sim.nodes,
        loss_percent = sim.loss_percent,
        packets_per_frame = config.protocol.packets_per_frame,
        frames_per_turn = sim.frames_per_turn,
        run_secs = sim.run_secs,
        "wnet-sim starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }
    if sim.run_secs > 0 {
        let shutdown = shutdown_tx.clone();
        let run_for = Duration::from_secs(sim.run_secs);
        tokio::spawn(async move {
            tokio::time::sleep(run_for).await;
            tracing::info!(secs = run_for.as_secs(), "run time elapsed");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let started = Instant::now();
    let mesh = Mesh::new(config.protocol.clone(), sim.loss_percent);
    let stats = TrafficStats::new();
    let shape = TrafficShape {
        frames_per_turn: sim.frames_per_turn,
        packets_per_frame: config.protocol.packets_per_frame,
        payload_size: sim.payload_size,
    };

    let discovery_task = tokio::spawn(
        mesh.discovery()
            .clone()
            .refresh_loop(Duration::from_secs(2), shutdown_tx.subscribe()),
    );

    // Nodes join one by one.
    {
        let mesh = mesh.clone();
        let stats = stats.clone();
        let shutdown = shutdown_tx.clone();
        let join_interval = Duration::from_millis(sim.join_interval_ms);
        tokio::spawn(async move {
            for i in 0..sim.nodes {
                let uid = AgencyUid::new(i as u64 + 1);
                let SimNode { node, deliveries } = match mesh.join(uid).await {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(node = %uid, error = %e, "node failed to start");
                        return;
                    }
                };

                let producer = Producer::new(node.clone(), shape, stats.clone(), shutdown.subscribe());
                tokio::spawn(async move {
                    if let Err(e) = producer.run().await {
                        tracing::error!(node = %uid, error = %e, "producer failed");
                    }
                });
                let consumer = Consumer::new(uid, deliveries, stats.clone(), shutdown.subscribe());
                tokio::spawn(async move {
                    if let Err(e) = consumer.run().await {
                        tracing::error!(node = %uid, error = %e, "consumer failed");
                    }
                });

                tokio::time::sleep(join_interval).await;
            }
            tracing::info!(nodes = mesh.nodes().len(), "all nodes joined");
        });
    }

    let snapshot_printer = {
        let mesh = mesh.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            loop {
                interval.tick().await;
                for node in mesh.nodes() {
                    let snap = node.snapshot().await;
                    let traffic = stats.get(snap.uid);
                    tracing::info!(
                        node = %snap.uid,
                        state = %snap.state,
                        paired = ?snap.paired_speaker.map(|s| s.to_string()),
                        valid_neighbours = snap.neighbours.iter().filter(|n| n.valid).count(),
                        tx = ?snap.tx_status,
                        sent = traffic.packets_sent,
                        received = traffic.packets_received,
                        "  node"
                    );
                }
                tracing::info!(medium = ?mesh.medium().stats(), "mesh snapshot");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = discovery_task      => tracing::error!("discovery exited: {:?}", r),
        r = snapshot_printer    => tracing::error!("snapshot printer exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    mesh.shutdown();

    let report = Report::collect(&mesh, &stats, started.elapsed()).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialise report")?
    );

    Ok(())
}
