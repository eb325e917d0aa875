//! Receive path: entry points the transport calls.
//!
//! Beacons are queued for the state machine; data packets are sequenced and
//! acknowledged right here, under the shared lock.

use bytes::Bytes;
use serde::Serialize;
use winenet_core::wire::{self, Datagram};
use winenet_core::{AckStatus, AgencyUid, Beacon, BeaconKind, DataPacket, TransId, WireError};

use crate::frame::RxVerdict;
use crate::inbox::PendingBeacon;
use crate::node::Winenet;

/// One data packet handed to the upper layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub from: AgencyUid,
    pub trans_id: TransId,
    #[serde(skip)]
    pub payload: Bytes,
}

impl Winenet {
    pub async fn on_beacon_received(&self, from: AgencyUid, beacon: Beacon) {
        let shared = self.shared();
        {
            let mut net = shared.net.lock().await;
            net.registry.update_from_beacon(from, &beacon.state);
            tracing::debug!(node = %shared.uid, peer = %from, beacon = %beacon.kind, "beacon received");
            net.inbox.push(PendingBeacon { from, beacon });
        }
        shared.wake();
    }

    pub async fn on_data_received(&self, from: AgencyUid, packet: DataPacket) {
        let shared = self.shared();
        let mut net = shared.net.lock().await;

        if net.registry.ourself().paired_speaker != Some(from) || from == shared.uid {
            tracing::trace!(node = %shared.uid, peer = %from, "data from non-speaker dropped");
            return;
        }

        let trans_id = packet.trans_id;
        match net.rx_frame.accept(packet) {
            RxVerdict::Stored => {
                tracing::trace!(node = %shared.uid, peer = %from, trans_id = %trans_id, "packet stored");
            }
            RxVerdict::FrameComplete { packets, ack } => {
                tracing::debug!(node = %shared.uid, peer = %from, packets = packets.len(), ack = %ack, "frame received");
                for p in packets {
                    let _ = shared.deliveries.send(Delivery {
                        from,
                        trans_id: p.trans_id,
                        payload: p.payload,
                    });
                }
                shared.send_frame_ack(&net, from, BeaconKind::Ack(AckStatus::Ok), ack);
            }
            RxVerdict::Duplicate { ack } => {
                tracing::trace!(node = %shared.uid, peer = %from, trans_id = %trans_id, "duplicate packet");
                if let Some(ack) = ack {
                    shared.send_frame_ack(&net, from, BeaconKind::Ack(AckStatus::Ok), ack);
                }
            }
            RxVerdict::Gap { abort } => {
                tracing::debug!(
                    node = %shared.uid,
                    peer = %from,
                    trans_id = %trans_id,
                    expected = net.rx_frame.expected(),
                    "sequence break"
                );
                if let Some(id) = abort {
                    shared.send_frame_ack(&net, from, BeaconKind::Ack(AckStatus::Abort), id);
                }
            }
        }
    }

    /// Decode a raw datagram and dispatch it.
    pub async fn on_datagram(&self, from: AgencyUid, bytes: &[u8]) -> Result<(), WireError> {
        match wire::decode(bytes)? {
            Datagram::Beacon(beacon) => self.on_beacon_received(from, beacon).await,
            Datagram::Data(packet) => self.on_data_received(from, packet).await,
        }
        Ok(())
    }

    /// Stop accepting data from the current speaker. Anything half-received
    /// is discarded.
    pub async fn cancel_rx(&self) {
        let shared = self.shared();
        let mut net = shared.net.lock().await;
        let me = shared.uid;
        if let Some(speaker) = net.registry.ourself().paired_speaker.filter(|s| *s != me) {
            net.registry.ourself_mut().paired_speaker = None;
            net.rx_frame.reset();
            tracing::debug!(node = %me, speaker = %speaker, "reception cancelled");
        }
    }
}
