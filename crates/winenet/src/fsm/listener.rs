use tokio::time::timeout;
use winenet_core::{AckStatus, BeaconId, BeaconKind, ReqRsp};

use super::{wins_tie_break, Engine, WnetState};
use crate::node::{NetState, Shared};

impl Engine {
    /// LISTENER: follow the paired speaker, take part in elections, accept
    /// hand-offs. Quiet periods trigger a state poll.
    pub(super) async fn listener(&mut self) -> WnetState {
        let shared = self.shared.clone();
        let mut woke = true;

        loop {
            {
                let mut net = shared.net.lock().await;
                if woke {
                    if let Some(next) = self.listener_events(&shared, &mut net) {
                        return next;
                    }
                } else {
                    let target = net
                        .registry
                        .ourself()
                        .paired_speaker
                        .filter(|s| *s != shared.uid)
                        .or_else(|| net.registry.first_valid());
                    if let Some(target) = target {
                        tracing::debug!(peer = %target, "listener timeout, polling state");
                        shared.send_beacon(&net, target, BeaconKind::QueryState(ReqRsp::Request));
                    }
                }
            }

            woke = timeout(shared.config.listener_timeout(), shared.wake.notified())
                .await
                .is_ok();
        }
    }

    fn listener_events(&mut self, shared: &Shared, net: &mut NetState) -> Option<WnetState> {
        let me = shared.uid;

        let spurious = net.inbox.remove_matching(BeaconId::Acknowledgment);
        if spurious > 0 {
            tracing::trace!(spurious, "stray acks dropped");
        }

        if !net.registry.has_valid_neighbour() {
            net.registry.ourself_mut().paired_speaker = None;
            tracing::info!("no valid neighbour left");
            return Some(WnetState::Idle);
        }

        // Election.
        while let Some(p) = net.inbox.take_matching(BeaconId::QueryState) {
            let sender = p.beacon.state;
            let ours = net.registry.ourself().clone();

            let claim = ours.paired_speaker.is_none()
                && wins_tie_break((ours.randnr, me), (sender.randnr, p.from))
                && (sender.paired_speaker.is_none() || sender.paired_speaker == Some(me));

            if claim {
                net.registry.ourself_mut().paired_speaker = Some(me);
                net.speaking = true;
                self.answer_query(net, &p);
                tracing::info!(peer = %p.from, randnr = ours.randnr, "election won");
                return Some(WnetState::Speaker);
            }

            if ours.paired_speaker == Some(p.from) && sender.paired_speaker != Some(p.from) {
                tracing::debug!(peer = %p.from, "speaker no longer speaking, unpaired");
                unpair(net);
            }
            self.answer_query(net, &p);
        }

        while let Some(p) = net.inbox.take_matching(BeaconId::Ping) {
            self.process_ping(net, &p);
        }

        // Hand-off from the previous speaker.
        while let Some(p) = net.inbox.take_matching(BeaconId::GoSpeaker) {
            let paired = net.registry.ourself().paired_speaker;
            let conflicting = paired
                .is_some_and(|s| s != p.from && s != me && net.registry.is_valid(s));

            if conflicting {
                tracing::debug!(peer = %p.from, "hand-off refused, paired elsewhere");
                shared.send_beacon(net, p.from, BeaconKind::Ack(AckStatus::Abort));
                continue;
            }
            net.registry.ourself_mut().paired_speaker = Some(me);
            net.speaking = true;
            shared.send_beacon(net, p.from, BeaconKind::Ack(AckStatus::Ok));
            tracing::info!(peer = %p.from, "speakership handed over to us");
            return Some(WnetState::Speaker);
        }

        while let Some(p) = net.inbox.take_matching(BeaconId::BroadcastSpeaker) {
            let paired = net.registry.ourself().paired_speaker;

            if p.beacon.kind == (BeaconKind::BroadcastSpeaker { unpair: true }) {
                if paired == Some(p.from) {
                    tracing::debug!(peer = %p.from, "speaker ended its session");
                    unpair(net);
                }
                continue;
            }

            let conflicting = paired
                .is_some_and(|s| s != p.from && s != me && net.registry.is_valid(s));
            if conflicting {
                tracing::debug!(peer = %p.from, "broadcast refused, paired elsewhere");
                shared.send_beacon(net, p.from, BeaconKind::Ack(AckStatus::Abort));
                continue;
            }
            if paired != Some(p.from) {
                net.registry.ourself_mut().paired_speaker = Some(p.from);
                net.rx_frame.reset();
                tracing::info!(speaker = %p.from, "paired to speaker");
            }
            shared.send_beacon(net, p.from, BeaconKind::Ack(AckStatus::Ok));
        }

        None
    }
}

/// Forget our speaker and anything half-received from it.
fn unpair(net: &mut NetState) {
    net.registry.ourself_mut().paired_speaker = None;
    net.rx_frame.reset();
}
