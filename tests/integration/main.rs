//! Winenet integration test harness.
//!
//! Whole meshes run in-process over the simulated medium, on real timers
//! with short protocol timeouts:
//!
//!   cargo test --test integration
//!
//! Every test builds its own mesh; nothing is shared between tests.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast;
use tokio::time::Instant;

use winenet::{AgencyUid, NodeSnapshot, ProtocolConfig, Winenet, WnetState};
use winenet_sim::{Consumer, Mesh, Producer, SimNode, TrafficShape, TrafficStats};

mod delivery;
mod election;
mod failures;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const PACKETS_PER_FRAME: usize = 4;

pub fn fast_protocol() -> ProtocolConfig {
    ProtocolConfig {
        packets_per_frame: PACKETS_PER_FRAME,
        ack_timeout_ms: 40,
        listener_timeout_ms: 60,
        retries_max: 3,
        rng_seed: None,
    }
}

pub fn uid(n: u64) -> AgencyUid {
    AgencyUid::new(n)
}

/// A mesh plus the traffic tasks running on it. Dropping it stops everything.
pub struct TestMesh {
    pub mesh: Mesh,
    pub stats: TrafficStats,
    shutdown: broadcast::Sender<()>,
}

impl TestMesh {
    pub fn new(loss_percent: u8) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let mesh = Mesh::new(fast_protocol(), loss_percent);
        tokio::spawn(
            mesh.discovery()
                .clone()
                .refresh_loop(Duration::from_millis(300), shutdown.subscribe()),
        );
        Self {
            mesh,
            stats: TrafficStats::new(),
            shutdown,
        }
    }

    /// Join a node that only receives.
    pub async fn join_silent(&self, n: u64) -> Result<Winenet> {
        let SimNode { node, deliveries } = self.mesh.join(uid(n)).await?;
        let consumer = Consumer::new(node.uid(), deliveries, self.stats.clone(), self.shutdown.subscribe());
        tokio::spawn(consumer.run());
        Ok(node)
    }

    /// Join a node that also sends `frames_per_turn` frames per stream, forever.
    pub async fn join_talking(&self, n: u64, frames_per_turn: usize) -> Result<Winenet> {
        let node = self.join_silent(n).await?;
        let shape = TrafficShape {
            frames_per_turn,
            packets_per_frame: PACKETS_PER_FRAME,
            payload_size: 32,
        };
        let producer = Producer::new(node.clone(), shape, self.stats.clone(), self.shutdown.subscribe());
        tokio::spawn(producer.run());
        Ok(node)
    }

    pub async fn snapshots(&self) -> Vec<NodeSnapshot> {
        let mut out = Vec::new();
        for node in self.mesh.nodes() {
            out.push(node.snapshot().await);
        }
        out
    }

    pub async fn speakers(&self) -> Vec<AgencyUid> {
        self.snapshots()
            .await
            .into_iter()
            .filter(|s| s.state == WnetState::Speaker)
            .map(|s| s.uid)
            .collect()
    }

    pub fn streams_completed(&self, n: u64) -> u64 {
        self.stats.get(uid(n)).streams_completed
    }
}

impl Drop for TestMesh {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        self.mesh.shutdown();
    }
}

/// Poll `cond` every 50ms until it holds or `secs` elapse.
pub async fn wait_for<F, Fut>(secs: u64, what: &str, mut cond: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if cond().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    bail!("{what}: not reached within {secs}s")
}
