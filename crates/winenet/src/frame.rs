//! Frame buffers: one outgoing frame, one incoming frame.
//!
//! A frame is `packets_per_frame` consecutive packets acknowledged by a single
//! ACK. Packet `seq` lives in slot `seq % packets_per_frame`; a frame closes
//! when its last slot fills or when a packet carries the LAST flag.
//!
//! Sequence numbers wrap at the largest multiple of `packets_per_frame` that
//! fits the 24-bit field, so no frame straddles the wrap.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use winenet_core::wire::{MAX_PACKET_TRANSID, STREAM_MASK};
use winenet_core::{AgencyUid, DataPacket, TransId};

use crate::error::WinenetError;

/// True if the packet with this ID is the last one of its frame.
pub fn closes_frame(id: TransId, packets_per_frame: usize) -> bool {
    id.is_last() || slot_of(id, packets_per_frame) == packets_per_frame - 1
}

fn slot_of(id: TransId, packets_per_frame: usize) -> usize {
    id.seq() as usize % packets_per_frame
}

/// Count of sequence numbers in use before wrapping back to 0.
fn seq_span(packets_per_frame: usize) -> u32 {
    let n = packets_per_frame as u32;
    (MAX_PACKET_TRANSID + 1) / n * n
}

// ── Send side ─────────────────────────────────────────────────────────────────

/// Who should receive a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SendTarget {
    /// Every neighbour paired to us.
    #[default]
    Broadcast,

    /// One neighbour, if it is paired to us.
    Peer { uid: AgencyUid },
}

impl SendTarget {
    pub fn includes(&self, uid: AgencyUid) -> bool {
        match self {
            SendTarget::Broadcast => true,
            SendTarget::Peer { uid: target } => *target == uid,
        }
    }
}

/// Producer-side view of the outgoing buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TxStatus {
    /// Nothing queued. A speaker with no data hands off.
    #[default]
    NoData,
    /// A closed frame is waiting for the speaker.
    DataReady,
    /// The last frame went out; the producer may queue the next one.
    DataInProgress,
    /// The stream is over; the speaker should end its session.
    DataCompleted,
}

/// The request the producer is blocked on.
#[derive(Debug, Default)]
pub struct TxRequest {
    pub status: TxStatus,
    pub target: SendTarget,
    pub completion: Option<oneshot::Sender<Result<(), WinenetError>>>,
}

impl TxRequest {
    /// Wake the producer, if one is waiting.
    pub fn complete(&mut self, result: Result<(), WinenetError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Debug)]
pub struct TxFrame {
    slots: Vec<Option<DataPacket>>,
    next_seq: u32,
    span: u32,
    stream: u8,
}

impl TxFrame {
    pub fn new(packets_per_frame: usize) -> Self {
        Self {
            slots: vec![None; packets_per_frame],
            next_seq: 0,
            span: seq_span(packets_per_frame),
            stream: 0,
        }
    }

    /// Append a packet. Returns its transaction ID and whether it closed the frame.
    pub fn push(&mut self, payload: Bytes, last: bool) -> (TransId, bool) {
        let id = TransId::new(self.stream, self.next_seq, last);
        let slot = slot_of(id, self.slots.len());
        self.slots[slot] = Some(DataPacket::new(id, payload));

        if last {
            self.end_stream();
        } else {
            self.next_seq = (self.next_seq + 1) % self.span;
        }
        (id, closes_frame(id, self.slots.len()))
    }

    /// Flag the newest buffered packet as the last of the stream. Returns its
    /// new ID, or `None` if the frame is empty.
    pub fn mark_last(&mut self) -> Option<TransId> {
        let packet = self.slots.iter_mut().flatten().max_by_key(|p| p.trans_id.seq())?;
        let id = packet.trans_id;
        if id.is_last() {
            return Some(id);
        }
        packet.trans_id = TransId::new(id.stream(), id.seq(), true);
        let id = packet.trans_id;
        self.end_stream();
        Some(id)
    }

    fn end_stream(&mut self) {
        self.next_seq = 0;
        self.stream = self.stream.wrapping_add(1) & STREAM_MASK;
    }

    /// Buffered packets in slot order.
    pub fn packets(&self) -> Vec<DataPacket> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// ID the receiver acknowledges the buffered frame with.
    pub fn closing_trans_id(&self) -> Option<TransId> {
        self.slots.iter().flatten().last().map(|p| p.trans_id)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

// ── Receive side ──────────────────────────────────────────────────────────────

/// What the receiver should do with an incoming data packet.
#[derive(Debug, PartialEq, Eq)]
pub enum RxVerdict {
    /// In order, frame still open.
    Stored,
    /// The frame is complete: deliver `packets` and ACK OK with `ack`.
    FrameComplete { packets: Vec<DataPacket>, ack: TransId },
    /// Seen before. Re-acknowledge if it was the frame-closing packet.
    Duplicate { ack: Option<TransId> },
    /// Out of order. The frame was rewound; send ABORT if this is the first
    /// break in the frame.
    Gap { abort: Option<TransId> },
}

#[derive(Debug)]
pub struct RxFrame {
    slots: Vec<Option<DataPacket>>,
    stream: Option<u8>,
    expected: u32,
    span: u32,
    /// Frame start already answered with ABORT.
    aborted_frame: Option<u32>,
}

impl RxFrame {
    pub fn new(packets_per_frame: usize) -> Self {
        Self {
            slots: vec![None; packets_per_frame],
            stream: None,
            expected: 0,
            span: seq_span(packets_per_frame),
            aborted_frame: None,
        }
    }

    /// Forget all sequencing state, e.g. after pairing to a new speaker.
    pub fn reset(&mut self) {
        self.clear_slots();
        self.stream = None;
        self.expected = 0;
        self.aborted_frame = None;
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn accept(&mut self, packet: DataPacket) -> RxVerdict {
        let n = self.slots.len();
        let id = packet.trans_id;
        let seq = id.seq();

        if self.stream != Some(id.stream()) {
            // A new stream can only be joined at a frame boundary.
            if slot_of(id, n) == 0 {
                self.reset();
                self.stream = Some(id.stream());
                self.expected = seq;
            } else {
                return self.gap(id);
            }
        }

        if seq != self.expected {
            // Distance back from the expectation, modulo the sequence space.
            let behind = (self.expected + self.span - seq % self.span) % self.span;
            if behind <= self.span / 2 {
                let ack = closes_frame(id, n).then_some(id);
                return RxVerdict::Duplicate { ack };
            }
            return self.gap(id);
        }

        self.slots[slot_of(id, n)] = Some(packet);
        self.expected = (seq + 1) % self.span;
        self.aborted_frame = None;

        if closes_frame(id, n) {
            let packets = self.slots.iter_mut().filter_map(Option::take).collect();
            RxVerdict::FrameComplete { packets, ack: id }
        } else {
            RxVerdict::Stored
        }
    }

    fn gap(&mut self, id: TransId) -> RxVerdict {
        let n = self.slots.len() as u32;
        let frame_start = self.expected - self.expected % n;
        self.clear_slots();
        self.expected = frame_start;

        if self.aborted_frame == Some(frame_start) {
            RxVerdict::Gap { abort: None }
        } else {
            self.aborted_frame = Some(frame_start);
            RxVerdict::Gap { abort: Some(id) }
        }
    }

    fn clear_slots(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}
