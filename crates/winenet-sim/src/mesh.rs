//! A set of nodes sharing one medium.

use tokio::sync::mpsc;

use winenet::{AgencyUid, Delivery, ProtocolConfig, Winenet};
use winenet_core::config::ConfigError;

use crate::discovery::Discovery;
use crate::medium::Medium;

/// A node that joined the mesh, with its delivery channel.
pub struct SimNode {
    pub node: Winenet,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[derive(Clone)]
pub struct Mesh {
    protocol: ProtocolConfig,
    medium: Medium,
    discovery: Discovery,
}

impl Mesh {
    pub fn new(protocol: ProtocolConfig, loss_percent: u8) -> Self {
        Self {
            protocol,
            medium: Medium::new(loss_percent),
            discovery: Discovery::new(),
        }
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn nodes(&self) -> Vec<Winenet> {
        self.discovery.nodes()
    }

    /// Start a node, put it on the medium and announce it.
    pub async fn join(&self, uid: AgencyUid) -> Result<SimNode, ConfigError> {
        let (node, deliveries) = Winenet::spawn(uid, self.protocol.clone(), self.medium.port(uid))?;
        // The pump ends on its own once the node is detached.
        self.medium.attach(node.clone());
        self.discovery.announce(node.clone()).await;
        Ok(SimNode { node, deliveries })
    }

    /// Take a node off the mesh and stop it. Its neighbours are told it is gone.
    pub async fn leave(&self, uid: AgencyUid) -> bool {
        let Some(node) = self.discovery.withdraw(uid).await else {
            return false;
        };
        self.medium.detach(uid);
        node.shutdown();
        tracing::info!(node = %uid, "node left the mesh");
        true
    }

    /// Stop every node.
    pub fn shutdown(&self) {
        for node in self.nodes() {
            self.medium.detach(node.uid());
            node.shutdown();
        }
    }
}
