//! Acknowledgment waits and the retrying exchanges built on them.

use tokio::time::{timeout_at, Instant};
use winenet_core::{AckStatus, AgencyUid, BeaconId, BeaconKind, DataPacket, TransId};

use super::{wins_tie_break, Engine};
use crate::node::NetState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AckOutcome {
    Ok,
    Abort,
    Timeout,
}

/// What the awaited ACK must acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AckExpect {
    /// A control beacon (GO_SPEAKER, BROADCAST_SPEAKER).
    Beacon,
    /// A data frame closed by this packet.
    Frame(TransId),
}

impl Engine {
    /// Wait up to the ACK timeout for `target` to acknowledge. A target that
    /// disappears from the registry counts as a timeout.
    pub(super) async fn wait_for_ack(&mut self, target: AgencyUid, expect: AckExpect) -> AckOutcome {
        let shared = self.shared.clone();
        let deadline = Instant::now() + shared.config.ack_timeout();

        loop {
            {
                let mut net = shared.net.lock().await;
                if net.registry.find(target).is_none() {
                    tracing::debug!(peer = %target, "ack target removed while waiting");
                    return AckOutcome::Timeout;
                }
                if expect == AckExpect::Beacon {
                    self.abort_weaker_claims(&mut net);
                }
                if let Some(outcome) = take_ack(&mut net, target, expect) {
                    return outcome;
                }
            }

            if timeout_at(deadline, shared.wake.notified()).await.is_err() {
                return AckOutcome::Timeout;
            }
        }
    }

    /// While we are claiming speakership, refuse competing claims from
    /// neighbours that lose the tie-break against us.
    fn abort_weaker_claims(&self, net: &mut NetState) {
        let claims = BeaconId::GoSpeaker | BeaconId::BroadcastSpeaker;
        if net.inbox.peek_matching(claims).is_none() {
            return;
        }
        let ours = net.registry.ourself();
        let ours = (ours.randnr, ours.uid);
        let weaker = net.inbox.drain_where(claims, |p| {
            p.beacon.kind != BeaconKind::BroadcastSpeaker { unpair: true }
                && wins_tie_break(ours, (p.beacon.state.randnr, p.from))
        });
        for p in weaker {
            tracing::debug!(peer = %p.from, beacon = %p.beacon.kind, "contending claim aborted");
            self.shared
                .send_beacon(net, p.from, BeaconKind::Ack(AckStatus::Abort));
        }
    }

    /// Send a control beacon and wait for its ACK, retrying on timeout.
    pub(super) async fn beacon_exchange(&mut self, target: AgencyUid, kind: BeaconKind) -> AckOutcome {
        let shared = self.shared.clone();
        shared
            .net
            .lock()
            .await
            .inbox
            .drain_where(BeaconId::Acknowledgment, |p| p.from == target);

        for attempt in 0..=shared.config.retries_max {
            {
                let net = shared.net.lock().await;
                if net.registry.find(target).is_none() {
                    return AckOutcome::Timeout;
                }
                shared.send_beacon(&net, target, kind);
            }
            match self.wait_for_ack(target, AckExpect::Beacon).await {
                AckOutcome::Timeout => {
                    tracing::debug!(peer = %target, beacon = %kind, attempt, "no ack");
                }
                outcome => return outcome,
            }
        }
        AckOutcome::Timeout
    }

    /// Send a whole frame to one receiver and wait for its cumulative ACK.
    /// The frame is retransmitted on ABORT or timeout. Returns true once
    /// acknowledged.
    pub(super) async fn frame_exchange(
        &mut self,
        target: AgencyUid,
        packets: &[DataPacket],
        closing: TransId,
    ) -> bool {
        let shared = self.shared.clone();

        for attempt in 0..=shared.config.retries_max {
            {
                let mut net = shared.net.lock().await;
                if net.registry.find(target).is_none() {
                    return false;
                }
                net.inbox
                    .drain_where(BeaconId::Acknowledgment, |p| p.from == target);
                for packet in packets {
                    if let Err(e) = shared.transport.send_packet(target, packet) {
                        tracing::warn!(peer = %target, error = %e, "data send failed");
                        break;
                    }
                }
                tracing::trace!(peer = %target, packets = packets.len(), closing = %closing, attempt, "frame sent");
            }

            match self.wait_for_ack(target, AckExpect::Frame(closing)).await {
                AckOutcome::Ok => return true,
                AckOutcome::Abort => {
                    tracing::debug!(peer = %target, attempt, "frame aborted by receiver");
                }
                AckOutcome::Timeout => {
                    tracing::debug!(peer = %target, attempt, "frame ack timeout");
                }
            }
        }
        false
    }
}

/// Consume acknowledgments from `target`, returning the first one that
/// answers `expect`. ACKs for other exchanges are dropped.
fn take_ack(net: &mut NetState, target: AgencyUid, expect: AckExpect) -> Option<AckOutcome> {
    while let Some(p) = net
        .inbox
        .take_where(BeaconId::Acknowledgment, |p| p.from == target)
    {
        let BeaconKind::Ack(status) = p.beacon.kind else {
            continue;
        };
        let state = p.beacon.state;

        match (expect, status) {
            (AckExpect::Beacon, _) if state.pkt_data => {}
            (AckExpect::Beacon, AckStatus::Ok) => return Some(AckOutcome::Ok),
            (AckExpect::Beacon, AckStatus::Abort) => return Some(AckOutcome::Abort),
            (AckExpect::Frame(_), _) if !state.pkt_data => {}
            (AckExpect::Frame(_), AckStatus::Abort) => return Some(AckOutcome::Abort),
            (AckExpect::Frame(closing), AckStatus::Ok) if state.trans_id == closing => {
                return Some(AckOutcome::Ok)
            }
            (AckExpect::Frame(_), AckStatus::Ok) => {}
        }
        tracing::trace!(peer = %target, "stale ack dropped");
    }
    None
}
