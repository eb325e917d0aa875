use winenet_core::{BeaconId, BeaconKind, ReqRsp};

use super::{Engine, WnetState};
use crate::frame::TxStatus;

impl Engine {
    /// IDLE: no reachable neighbour. Wait for a ping handshake (or a frame
    /// to send while someone is reachable), then start an election.
    pub(super) async fn idle(&mut self) -> WnetState {
        let shared = self.shared.clone();
        loop {
            {
                let mut net = shared.net.lock().await;

                let mut handshake = false;
                while let Some(p) = net.inbox.take_matching(BeaconId::Ping) {
                    handshake |= self.process_ping(&mut net, &p);
                }
                let dropped = net.inbox.clear();
                if dropped > 0 {
                    tracing::debug!(dropped, "beacons discarded while idle");
                }

                let has_data = net.tx_request.status == TxStatus::DataReady;
                if handshake || has_data {
                    if let Some(first) = net.registry.first_valid() {
                        self.draw_randnr(&mut net);
                        shared.send_beacon(&net, first, BeaconKind::QueryState(ReqRsp::Request));
                        return WnetState::Listener;
                    }
                }
            }
            shared.wake.notified().await;
        }
    }
}
