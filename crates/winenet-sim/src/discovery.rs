//! Neighbour discovery for the simulated mesh.
//!
//! Everyone on the medium is in range of everyone else. Joining announces
//! the node to all present nodes and vice versa; a refresh loop repeats the
//! announcements so handshakes lost to the medium are retried.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;

use winenet::{AgencyUid, Winenet};

#[derive(Clone, Default)]
pub struct Discovery {
    nodes: Arc<DashMap<AgencyUid, Winenet>>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, uid: AgencyUid) -> Option<Winenet> {
        self.nodes.get(&uid).map(|n| n.value().clone())
    }

    /// Present nodes in UID order.
    pub fn nodes(&self) -> Vec<Winenet> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by_key(Winenet::uid);
        nodes
    }

    pub async fn announce(&self, node: Winenet) {
        let uid = node.uid();
        let present = self.nodes();
        self.nodes.insert(uid, node.clone());
        tracing::info!(node = %uid, present = present.len(), "node announced");

        for other in present {
            other.on_neighbour_added(uid).await;
            node.on_neighbour_added(other.uid()).await;
        }
    }

    pub async fn withdraw(&self, uid: AgencyUid) -> Option<Winenet> {
        let (_, node) = self.nodes.remove(&uid)?;
        tracing::info!(node = %uid, "node withdrawn");
        for other in self.nodes() {
            other.on_neighbour_removed(uid).await;
        }
        Some(node)
    }

    /// Re-announce every pair once.
    pub async fn refresh(&self) {
        let nodes = self.nodes();
        for node in &nodes {
            for other in nodes.iter().filter(|o| o.uid() != node.uid()) {
                node.on_neighbour_updated(other.uid(), None).await;
            }
        }
    }

    pub async fn refresh_loop(
        self,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("discovery shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    tracing::trace!(nodes = self.len(), "discovery refresh");
                    self.refresh().await;
                }
            }
        }
    }
}
