//! Synthetic producers and consumers sitting on top of each node.
//!
//! Every payload starts with the origin UID and a per-origin counter, both
//! big-endian u64. Consumers use them to detect duplicates.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use winenet::{AgencyUid, Delivery, SendTarget, Winenet, WinenetError};

pub const PAYLOAD_HEADER_LEN: usize = 16;

pub fn encode_payload(origin: AgencyUid, counter: u64, size: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(size.max(PAYLOAD_HEADER_LEN));
    buf.put_u64(origin.get());
    buf.put_u64(counter);
    buf.resize(size.max(PAYLOAD_HEADER_LEN), 0);
    buf.freeze()
}

pub fn decode_payload(payload: &[u8]) -> Option<(AgencyUid, u64)> {
    let origin = payload.get(..8)?.try_into().ok().map(u64::from_be_bytes)?;
    let counter = payload.get(8..16)?.try_into().ok().map(u64::from_be_bytes)?;
    Some((AgencyUid::new(origin), counter))
}

// ── Stats ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeTraffic {
    pub packets_sent: u64,
    pub frames_acked: u64,
    pub frames_failed: u64,
    pub streams_completed: u64,
    pub packets_received: u64,
    pub duplicates: u64,
}

impl NodeTraffic {
    fn add(&mut self, o: &NodeTraffic) {
        self.packets_sent += o.packets_sent;
        self.frames_acked += o.frames_acked;
        self.frames_failed += o.frames_failed;
        self.streams_completed += o.streams_completed;
        self.packets_received += o.packets_received;
        self.duplicates += o.duplicates;
    }
}

#[derive(Clone, Default)]
pub struct TrafficStats {
    nodes: Arc<DashMap<AgencyUid, NodeTraffic>>,
    /// (receiver, origin) -> highest counter delivered.
    seen: Arc<DashMap<(AgencyUid, AgencyUid), u64>>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, uid: AgencyUid, f: impl FnOnce(&mut NodeTraffic)) {
        f(&mut self.nodes.entry(uid).or_default());
    }

    pub fn get(&self, uid: AgencyUid) -> NodeTraffic {
        self.nodes.get(&uid).map(|t| *t.value()).unwrap_or_default()
    }

    pub fn totals(&self) -> NodeTraffic {
        let mut total = NodeTraffic::default();
        for t in self.nodes.iter() {
            total.add(t.value());
        }
        total
    }

    /// Record a delivery. Returns false if it repeats or precedes an earlier
    /// one from the same origin.
    pub fn record_delivery(&self, receiver: AgencyUid, origin: AgencyUid, counter: u64) -> bool {
        let fresh = match self.seen.entry((receiver, origin)) {
            Entry::Occupied(mut e) if counter > *e.get() => {
                e.insert(counter);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(counter);
                true
            }
        };
        self.update(receiver, |t| {
            t.packets_received += 1;
            if !fresh {
                t.duplicates += 1;
            }
        });
        fresh
    }
}

// ── Producer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TrafficShape {
    pub frames_per_turn: usize,
    pub packets_per_frame: usize,
    pub payload_size: usize,
}

/// Sends `frames_per_turn` frames, ends the stream, and starts over.
pub struct Producer {
    node: Winenet,
    shape: TrafficShape,
    stats: TrafficStats,
    shutdown: broadcast::Receiver<()>,
}

impl Producer {
    pub fn new(
        node: Winenet,
        shape: TrafficShape,
        stats: TrafficStats,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            node,
            shape,
            stats,
            shutdown,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            node,
            shape,
            stats,
            mut shutdown,
        } = self;
        let uid = node.uid();
        let mut counter = 0u64;

        loop {
            let turn = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!(node = %uid, "producer shutting down");
                    return Ok(());
                }
                r = send_turn(&node, shape, &stats, &mut counter) => r,
            };
            match turn {
                Ok(()) => stats.update(uid, |t| t.streams_completed += 1),
                Err(WinenetError::Stopped) => {
                    tracing::debug!(node = %uid, "node stopped, producer exiting");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(node = %uid, error = %e, "stream aborted");
                }
            }
        }
    }
}

/// One speaker turn worth of frames, the last packet ending the stream.
async fn send_turn(
    node: &Winenet,
    shape: TrafficShape,
    stats: &TrafficStats,
    counter: &mut u64,
) -> Result<(), WinenetError> {
    let uid = node.uid();
    let TrafficShape {
        frames_per_turn,
        packets_per_frame,
        payload_size,
    } = shape;
    let frames_per_turn = frames_per_turn.max(1);

    for frame in 0..frames_per_turn {
        for slot in 0..packets_per_frame {
            let closes = slot + 1 == packets_per_frame;
            let last = frame + 1 == frames_per_turn && closes;
            let payload = encode_payload(uid, *counter, payload_size);
            *counter += 1;
            stats.update(uid, |t| t.packets_sent += 1);

            match node.submit_frame(SendTarget::Broadcast, payload, last).await {
                Ok(()) if closes => stats.update(uid, |t| t.frames_acked += 1),
                Ok(()) => {}
                Err(WinenetError::Unreachable) => {
                    tracing::debug!(node = %uid, frame, "frame reached nobody");
                    stats.update(uid, |t| t.frames_failed += 1);
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

// ── Consumer ──────────────────────────────────────────────────────────────────

pub struct Consumer {
    uid: AgencyUid,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    stats: TrafficStats,
    shutdown: broadcast::Receiver<()>,
}

impl Consumer {
    pub fn new(
        uid: AgencyUid,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        stats: TrafficStats,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            uid,
            deliveries,
            stats,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),
                d = self.deliveries.recv() => match d {
                    Some(d) => self.record(d),
                    None => return Ok(()),
                },
            }
        }
    }

    fn record(&self, d: Delivery) {
        let Some((origin, counter)) = decode_payload(&d.payload) else {
            tracing::warn!(
                node = %self.uid,
                peer = %d.from,
                head = hex::encode(&d.payload[..d.payload.len().min(16)]),
                "foreign payload"
            );
            return;
        };
        if self.stats.record_delivery(self.uid, origin, counter) {
            tracing::trace!(node = %self.uid, origin = %origin, counter, trans_id = %d.trans_id, "delivered");
        } else {
            tracing::warn!(node = %self.uid, origin = %origin, counter, "duplicate delivery");
        }
    }
}
