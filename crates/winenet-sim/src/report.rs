//! End-of-run summary, printed as JSON.

use std::time::Duration;

use serde::Serialize;

use winenet::NodeSnapshot;

use crate::medium::MediumStats;
use crate::mesh::Mesh;
use crate::traffic::{NodeTraffic, TrafficStats};

#[derive(Debug, Serialize)]
pub struct NodeReport {
    #[serde(flatten)]
    pub snapshot: NodeSnapshot,
    pub traffic: NodeTraffic,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub elapsed_secs: f64,
    pub medium: MediumStats,
    pub totals: NodeTraffic,
    pub nodes: Vec<NodeReport>,
}

impl Report {
    pub async fn collect(mesh: &Mesh, stats: &TrafficStats, elapsed: Duration) -> Self {
        let mut nodes = Vec::new();
        for node in mesh.nodes() {
            nodes.push(NodeReport {
                snapshot: node.snapshot().await,
                traffic: stats.get(node.uid()),
            });
        }
        Self {
            elapsed_secs: elapsed.as_secs_f64(),
            medium: mesh.medium().stats(),
            totals: stats.totals(),
            nodes,
        }
    }
}
