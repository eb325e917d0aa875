//! In-memory link shared by simulated nodes.
//!
//! Every attached node owns a queue. Sends encode through the wire codec
//! and push onto the receiver's queue; a pump task per node decodes them
//! back into the engine. Loss and per-link blocking are applied at send
//! time.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use winenet::{AgencyUid, Beacon, DataPacket, Transport, TransportError, Winenet};

/// A datagram in flight.
#[derive(Debug, Clone)]
struct Frame {
    from: AgencyUid,
    bytes: Bytes,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    lost: AtomicU64,
    blocked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediumStats {
    pub sent: u64,
    pub lost: u64,
    pub blocked: u64,
}

struct Inner {
    queues: DashMap<AgencyUid, mpsc::UnboundedSender<Frame>>,
    /// Directed links that drop everything.
    blocked: DashSet<(AgencyUid, AgencyUid)>,
    loss_percent: AtomicU8,
    counters: Counters,
}

#[derive(Clone)]
pub struct Medium {
    inner: Arc<Inner>,
}

impl Medium {
    pub fn new(loss_percent: u8) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: DashMap::new(),
                blocked: DashSet::new(),
                loss_percent: AtomicU8::new(loss_percent.min(100)),
                counters: Counters::default(),
            }),
        }
    }

    pub fn set_loss_percent(&self, percent: u8) {
        self.inner
            .loss_percent
            .store(percent.min(100), Ordering::Relaxed);
    }

    /// Transport endpoint for a node that will be attached as `uid`.
    pub fn port(&self, uid: AgencyUid) -> Arc<dyn Transport> {
        Arc::new(MediumPort {
            medium: self.clone(),
            uid,
        })
    }

    /// Start delivering datagrams addressed to `node`. The pump ends when the
    /// node is detached.
    pub fn attach(&self, node: Winenet) -> JoinHandle<()> {
        let uid = node.uid();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.queues.insert(uid, tx);
        tracing::debug!(node = %uid, "attached to medium");
        tokio::spawn(pump(node, rx))
    }

    pub fn detach(&self, uid: AgencyUid) {
        if self.inner.queues.remove(&uid).is_some() {
            tracing::debug!(node = %uid, "detached from medium");
        }
    }

    /// Drop all traffic between `a` and `b`, both directions.
    pub fn block(&self, a: AgencyUid, b: AgencyUid) {
        self.inner.blocked.insert((a, b));
        self.inner.blocked.insert((b, a));
        tracing::info!(a = %a, b = %b, "link blocked");
    }

    pub fn unblock(&self, a: AgencyUid, b: AgencyUid) {
        self.inner.blocked.remove(&(a, b));
        self.inner.blocked.remove(&(b, a));
        tracing::info!(a = %a, b = %b, "link restored");
    }

    pub fn stats(&self) -> MediumStats {
        let c = &self.inner.counters;
        MediumStats {
            sent: c.sent.load(Ordering::Relaxed),
            lost: c.lost.load(Ordering::Relaxed),
            blocked: c.blocked.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, from: AgencyUid, to: AgencyUid, bytes: Bytes) -> Result<(), TransportError> {
        let counters = &self.inner.counters;
        let queue = self
            .inner
            .queues
            .get(&to)
            .map(|q| q.value().clone())
            .ok_or(TransportError::NoLink(to))?;
        counters.sent.fetch_add(1, Ordering::Relaxed);

        if self.inner.blocked.contains(&(from, to)) {
            counters.blocked.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let loss = self.inner.loss_percent.load(Ordering::Relaxed);
        if loss > 0 && rand::thread_rng().gen_range(0..100) < loss {
            counters.lost.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(from = %from, to = %to, len = bytes.len(), "datagram lost");
            return Ok(());
        }

        queue
            .send(Frame { from, bytes })
            .map_err(|_| TransportError::Closed)
    }
}

/// Decode queued datagrams into the engine.
async fn pump(node: Winenet, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = node.on_datagram(frame.from, &frame.bytes).await {
            tracing::warn!(
                node = %node.uid(),
                peer = %frame.from,
                error = %e,
                head = hex::encode(&frame.bytes[..frame.bytes.len().min(8)]),
                "undecodable datagram dropped"
            );
        }
    }
}

struct MediumPort {
    medium: Medium,
    uid: AgencyUid,
}

impl Transport for MediumPort {
    fn send_beacon(&self, to: AgencyUid, beacon: &Beacon) -> Result<(), TransportError> {
        self.medium.deliver(self.uid, to, beacon.encode())
    }

    fn send_packet(&self, to: AgencyUid, packet: &DataPacket) -> Result<(), TransportError> {
        self.medium.deliver(self.uid, to, packet.encode()?)
    }
}
