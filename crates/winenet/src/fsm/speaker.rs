use winenet_core::{AckStatus, BeaconId, BeaconKind};

use super::ack::AckOutcome;
use super::{Engine, WnetState};
use crate::error::WinenetError;
use crate::frame::TxStatus;
use crate::node::{NetState, Shared};

impl Engine {
    /// SPEAKER: we hold the channel. Announce ourselves, send the producer's
    /// frames, then hand the turn to the next neighbour.
    pub(super) async fn speaker(&mut self) -> WnetState {
        let next = self.speaking_session().await;
        self.leave_speakership().await;
        next
    }

    async fn speaking_session(&mut self) -> WnetState {
        let shared = self.shared.clone();
        let me = shared.uid;
        self.broadcast_done = false;
        {
            let mut net = shared.net.lock().await;
            net.speaking = true;
            net.registry.set_current_speaker(Some(me));
        }
        tracing::info!(from = %self.handle.previous, "speaking session started");

        loop {
            let status = {
                let mut net = shared.net.lock().await;
                if net.registry.ourself().paired_speaker != Some(me) {
                    tracing::warn!("no longer paired to ourselves, leaving speakership");
                    return WnetState::Listener;
                }
                self.speaker_events(&shared, &mut net);
                net.tx_request.status
            };

            match status {
                TxStatus::DataCompleted => {
                    end_session(&shared, &mut *shared.net.lock().await);
                    tracing::info!("transmission completed");
                    return self.go_next_speaker().await;
                }
                TxStatus::NoData => {
                    end_session(&shared, &mut *shared.net.lock().await);
                    return self.go_next_speaker().await;
                }
                TxStatus::DataInProgress => shared.wake.notified().await,
                TxStatus::DataReady => {
                    if !self.broadcast_done {
                        if let Some(next) = self.broadcast_speaker().await {
                            return next;
                        }
                        self.broadcast_done = true;
                    }
                    if let Some(next) = self.transmit_frame().await {
                        return next;
                    }
                }
            }
        }
    }

    fn speaker_events(&mut self, shared: &Shared, net: &mut NetState) {
        net.inbox.remove_matching(BeaconId::Acknowledgment);

        for p in net
            .inbox
            .drain_where(BeaconId::GoSpeaker | BeaconId::BroadcastSpeaker, |_| true)
        {
            if p.beacon.kind == (BeaconKind::BroadcastSpeaker { unpair: true }) {
                continue;
            }
            tracing::debug!(peer = %p.from, beacon = %p.beacon.kind, "already speaker, claim aborted");
            shared.send_beacon(net, p.from, BeaconKind::Ack(AckStatus::Abort));
        }

        while let Some(p) = net.inbox.take_matching(BeaconId::QueryState) {
            self.answer_query(net, &p);
        }
        while let Some(p) = net.inbox.take_matching(BeaconId::Ping) {
            self.process_ping(net, &p);
        }
    }

    /// Announce the session to every valid neighbour. Returns the next state
    /// if the session cannot go on.
    async fn broadcast_speaker(&mut self) -> Option<WnetState> {
        let shared = self.shared.clone();
        let targets = shared.net.lock().await.registry.valid_uids();
        if targets.is_empty() {
            shared.net.lock().await.registry.ourself_mut().paired_speaker = None;
            return Some(WnetState::Idle);
        }

        for target in targets {
            let outcome = self
                .beacon_exchange(target, BeaconKind::BroadcastSpeaker { unpair: false })
                .await;
            let mut net = shared.net.lock().await;
            match outcome {
                AckOutcome::Ok => {
                    tracing::debug!(peer = %target, "listener joined session");
                }
                AckOutcome::Abort => {
                    tracing::info!(peer = %target, "speakership contested, stepping down");
                    end_session(&shared, &mut net);
                    net.registry.ourself_mut().paired_speaker = None;
                    return Some(WnetState::Listener);
                }
                AckOutcome::Timeout => {
                    tracing::warn!(peer = %target, "broadcast not acknowledged, neighbour invalidated");
                    net.registry.invalidate(target);
                }
            }
        }

        let mut net = shared.net.lock().await;
        if !net.registry.has_valid_neighbour() {
            net.registry.ourself_mut().paired_speaker = None;
            return Some(WnetState::Idle);
        }
        None
    }

    /// Send the buffered frame to every listener paired to us and report the
    /// result to the producer.
    async fn transmit_frame(&mut self) -> Option<WnetState> {
        let shared = self.shared.clone();
        let me = shared.uid;

        let (packets, closing, receivers) = {
            let mut net = shared.net.lock().await;
            let target = net.tx_request.target;
            let receivers: Vec<_> = net
                .registry
                .iter()
                .filter(|n| n.uid != me && n.valid && n.paired_speaker == Some(me))
                .map(|n| n.uid)
                .filter(|uid| target.includes(*uid))
                .collect();

            let Some(closing) = net.tx_frame.closing_trans_id() else {
                net.tx_request.status = TxStatus::DataInProgress;
                net.tx_request.complete(Ok(()));
                return None;
            };
            (net.tx_frame.packets(), closing, receivers)
        };

        let mut delivered = 0usize;
        for receiver in receivers {
            if self.frame_exchange(receiver, &packets, closing).await {
                delivered += 1;
            } else {
                tracing::warn!(peer = %receiver, trans_id = %closing, "frame not acknowledged, neighbour invalidated");
                shared.net.lock().await.registry.invalidate(receiver);
            }
        }

        let mut net = shared.net.lock().await;
        net.tx_frame.clear();

        if delivered == 0 {
            tracing::warn!(trans_id = %closing, "frame reached no neighbour");
            net.tx_request.status = TxStatus::NoData;
            net.tx_request.complete(Err(WinenetError::Unreachable));
            end_session(&shared, &mut net);
            drop(net);
            return Some(self.go_next_speaker().await);
        }

        tracing::debug!(trans_id = %closing, delivered, "frame delivered");
        if closing.is_last() {
            // The producer is released once the session is handed off.
            net.tx_request.status = TxStatus::DataCompleted;
        } else {
            net.tx_request.status = TxStatus::DataInProgress;
            net.tx_request.complete(Ok(()));
        }
        None
    }

    /// The session is over, hand-off included. A producer waiting for the
    /// end of its stream is released here.
    async fn leave_speakership(&mut self) {
        let mut net = self.shared.net.lock().await;
        net.speaking = false;
        if net.tx_request.status == TxStatus::DataCompleted {
            net.tx_request.status = TxStatus::NoData;
            net.tx_request.complete(Ok(()));
        }
    }

    /// Hand speakership to the next valid neighbour after the last speaker,
    /// in UID order. Candidates that never answer are invalidated.
    pub(super) async fn go_next_speaker(&mut self) -> WnetState {
        let shared = self.shared.clone();
        let me = shared.uid;

        loop {
            let candidate = {
                let mut net = shared.net.lock().await;
                let cursor = net.registry.current_speaker().unwrap_or(me);
                match net.registry.next_valid(Some(cursor), false) {
                    Some(candidate) => {
                        net.registry.ourself_mut().paired_speaker = Some(candidate);
                        net.registry.set_current_speaker(Some(candidate));
                        candidate
                    }
                    None => {
                        net.registry.ourself_mut().paired_speaker = None;
                        net.registry.set_current_speaker(None);
                        tracing::info!("no neighbour to hand over to");
                        return WnetState::Idle;
                    }
                }
            };

            match self.beacon_exchange(candidate, BeaconKind::GoSpeaker).await {
                AckOutcome::Ok => {
                    tracing::debug!(peer = %candidate, "speakership handed over");
                    return WnetState::Listener;
                }
                AckOutcome::Abort => {
                    tracing::debug!(peer = %candidate, "hand-off refused");
                    shared.net.lock().await.registry.ourself_mut().paired_speaker = None;
                    return WnetState::Listener;
                }
                AckOutcome::Timeout => {
                    tracing::warn!(peer = %candidate, "hand-off not acknowledged, neighbour invalidated");
                    shared.net.lock().await.registry.invalidate(candidate);
                }
            }
        }
    }
}

/// Release every listener paired to us.
fn end_session(shared: &Shared, net: &mut NetState) {
    let me = shared.uid;
    let paired: Vec<_> = net
        .registry
        .iter()
        .filter(|n| n.uid != me && n.paired_speaker == Some(me))
        .map(|n| n.uid)
        .collect();

    for uid in paired {
        shared.send_beacon(net, uid, BeaconKind::BroadcastSpeaker { unpair: true });
        if let Some(n) = net.registry.find_mut(uid) {
            n.paired_speaker = None;
        }
    }
}
