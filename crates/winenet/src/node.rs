//! The `Winenet` handle: one mesh participant.
//!
//! Owns the shared protocol state and the state machine task. Every entry
//! point (producer, transport, discovery) goes through this handle; many
//! independent instances can live in one process.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Notify};
use winenet_core::config::ConfigError;
use winenet_core::wire::MAX_PAYLOAD;
use winenet_core::{
    AgencyUid, Beacon, BeaconKind, NeighbourState, ProtocolConfig, ReqRsp, TransId,
};

use crate::error::WinenetError;
use crate::frame::{RxFrame, SendTarget, TxFrame, TxRequest, TxStatus};
use crate::fsm::{Fsm, WnetState};
use crate::inbox::Inbox;
use crate::neighbour::{Neighbour, Registry};
use crate::rx::Delivery;
use crate::transport::Transport;

// ── Shared state ──────────────────────────────────────────────────────────────

/// Everything guarded by the neighbour-list lock.
pub(crate) struct NetState {
    pub registry: Registry,
    pub inbox: Inbox,
    pub tx_frame: TxFrame,
    pub tx_request: TxRequest,
    pub rx_frame: RxFrame,
    /// Set from the moment we win or are handed speakership until the
    /// speaking session, hand-off included, is over.
    pub speaking: bool,
    /// Cleared when the state machine task exits.
    pub running: bool,
}

impl NetState {
    /// Our own state as carried in outgoing beacons.
    pub fn our_state(&self) -> NeighbourState {
        let me = self.registry.ourself();
        NeighbourState {
            paired_speaker: me.paired_speaker,
            randnr: me.randnr,
            pkt_data: false,
            trans_id: Default::default(),
        }
    }
}

pub(crate) struct Shared {
    pub uid: AgencyUid,
    pub config: ProtocolConfig,
    pub net: Mutex<NetState>,
    /// Wakes the state machine. Single waiter, so `notify_one` keeps a permit.
    pub wake: Notify,
    pub transport: Arc<dyn Transport>,
    pub state: watch::Sender<WnetState>,
    /// Serialises producer calls.
    pub xmit_lock: Mutex<()>,
    pub deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Shared {
    pub fn send_beacon(&self, net: &NetState, to: AgencyUid, kind: BeaconKind) {
        self.send(to, Beacon::new(kind, net.our_state()));
    }

    /// Acknowledge a data frame, carrying the ID of the packet it answers.
    pub fn send_frame_ack(
        &self,
        net: &NetState,
        to: AgencyUid,
        kind: BeaconKind,
        trans_id: TransId,
    ) {
        let state = NeighbourState {
            pkt_data: true,
            trans_id,
            ..net.our_state()
        };
        self.send(to, Beacon::new(kind, state));
    }

    fn send(&self, to: AgencyUid, beacon: Beacon) {
        match self.transport.send_beacon(to, &beacon) {
            Ok(()) => tracing::debug!(peer = %to, beacon = %beacon.kind, "beacon sent"),
            Err(e) => {
                tracing::warn!(peer = %to, beacon = %beacon.kind, error = %e, "beacon send failed")
            }
        }
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

// ── Introspection ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NeighbourInfo {
    pub uid: AgencyUid,
    pub valid: bool,
    pub paired_speaker: Option<AgencyUid>,
}

impl From<&Neighbour> for NeighbourInfo {
    fn from(n: &Neighbour) -> Self {
        Self {
            uid: n.uid,
            valid: n.valid,
            paired_speaker: n.paired_speaker,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub uid: AgencyUid,
    pub state: WnetState,
    pub paired_speaker: Option<AgencyUid>,
    pub randnr: u32,
    pub tx_status: TxStatus,
    pub pending_beacons: usize,
    /// Other smart objects, in UID order.
    pub neighbours: Vec<NeighbourInfo>,
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Winenet {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
}

impl Winenet {
    /// Start a node. Received data is delivered on the returned channel. The
    /// state machine runs until [`Winenet::shutdown`] is called or every
    /// handle is dropped.
    pub fn spawn(
        uid: AgencyUid,
        config: ProtocolConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Delivery>), ConfigError> {
        config.validate()?;

        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ uid.get()),
            None => StdRng::from_entropy(),
        };
        let randnr = rng.gen();

        let net = NetState {
            registry: Registry::new(uid, randnr),
            inbox: Inbox::new(),
            tx_frame: TxFrame::new(config.packets_per_frame),
            tx_request: TxRequest::default(),
            rx_frame: RxFrame::new(config.packets_per_frame),
            speaking: false,
            running: true,
        };

        let (state_tx, _) = watch::channel(WnetState::Init);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let shared = Arc::new(Shared {
            uid,
            config,
            net: Mutex::new(net),
            wake: Notify::new(),
            transport,
            state: state_tx,
            xmit_lock: Mutex::new(()),
            deliveries: delivery_tx,
        });

        let fsm = Fsm::new(shared.clone(), rng, shutdown_rx);
        tokio::spawn(async move {
            if let Err(e) = fsm.run().await {
                tracing::error!(node = %uid, error = %e, "state machine failed");
            }
        });

        tracing::info!(node = %uid, "winenet node started");
        Ok((
            Self {
                shared,
                shutdown: shutdown_tx,
            },
            delivery_rx,
        ))
    }

    pub fn uid(&self) -> AgencyUid {
        self.shared.uid
    }

    pub fn state(&self) -> WnetState {
        *self.shared.state.borrow()
    }

    /// Follow state changes.
    pub fn watch_state(&self) -> watch::Receiver<WnetState> {
        self.shared.state.subscribe()
    }

    /// Stop the state machine. A blocked producer gets [`WinenetError::Stopped`].
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    // ── Producer ─────────────────────────────────────────────────────────────

    /// Queue one packet. Returns at once unless the packet closes a frame, in
    /// which case it waits until the frame was acknowledged or failed. A
    /// frame ending the stream also waits for the speaker hand-off.
    pub async fn submit_frame(
        &self,
        target: SendTarget,
        payload: Bytes,
        last: bool,
    ) -> Result<(), WinenetError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WinenetError::PayloadTooLarge(payload.len()));
        }
        let _xmit = self.shared.xmit_lock.lock().await;

        let done = {
            let mut net = self.shared.net.lock().await;
            if !net.running {
                return Err(WinenetError::Stopped);
            }
            let (trans_id, closed) = net.tx_frame.push(payload, last);
            tracing::trace!(node = %self.shared.uid, trans_id = %trans_id, closed, "packet queued");
            if !closed {
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            net.tx_request = TxRequest {
                status: TxStatus::DataReady,
                target,
                completion: Some(tx),
            };
            rx
        };

        self.shared.wake();
        done.await.map_err(|_| WinenetError::Stopped)?
    }

    /// End the current stream. A partially filled frame is flushed first.
    /// When we are speaking this waits until the session is handed off;
    /// otherwise it returns at once.
    pub async fn submit_end_of_transmission(&self) -> Result<(), WinenetError> {
        let _xmit = self.shared.xmit_lock.lock().await;

        let done = {
            let mut net = self.shared.net.lock().await;
            if !net.running {
                return Err(WinenetError::Stopped);
            }

            let target = net.tx_request.target;
            let (tx, rx) = oneshot::channel();
            if let Some(trans_id) = net.tx_frame.mark_last() {
                tracing::debug!(node = %self.shared.uid, trans_id = %trans_id, "flushing partial frame");
                net.tx_request = TxRequest {
                    status: TxStatus::DataReady,
                    target,
                    completion: Some(tx),
                };
            } else if net.speaking {
                net.tx_request = TxRequest {
                    status: TxStatus::DataCompleted,
                    target,
                    completion: Some(tx),
                };
            } else {
                net.tx_request.status = TxStatus::NoData;
                return Ok(());
            }
            rx
        };

        self.shared.wake();
        done.await.map_err(|_| WinenetError::Stopped)?
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// A neighbour appeared. The side with the greater UID starts the ping
    /// handshake.
    pub async fn on_neighbour_added(&self, uid: AgencyUid) {
        let me = self.shared.uid;
        if uid == me {
            return;
        }
        {
            let mut net = self.shared.net.lock().await;
            if !net.registry.add(uid) {
                return;
            }
            tracing::info!(node = %me, peer = %uid, "neighbour added");
            if me > uid {
                self.shared
                    .send_beacon(&net, uid, BeaconKind::Ping(ReqRsp::Request));
            }
        }
        self.shared.wake();
    }

    pub async fn on_neighbour_removed(&self, uid: AgencyUid) {
        {
            let mut net = self.shared.net.lock().await;
            let was_speaker = net.registry.ourself().paired_speaker == Some(uid);
            if net.registry.remove(uid).is_none() {
                return;
            }
            if was_speaker {
                net.rx_frame.reset();
            }
            tracing::info!(node = %self.shared.uid, peer = %uid, was_speaker, "neighbour removed");
        }
        self.shared.wake();
    }

    /// Discovery refresh. Unknown neighbours are added; a neighbour that is
    /// not yet valid gets a new ping so a lost handshake is retried.
    pub async fn on_neighbour_updated(&self, uid: AgencyUid, observed: Option<NeighbourState>) {
        let me = self.shared.uid;
        if uid == me {
            return;
        }
        {
            let mut net = self.shared.net.lock().await;
            let added = net.registry.add(uid);
            if let Some(state) = observed {
                net.registry.update_from_beacon(uid, &state);
            }

            let ping = if added {
                tracing::info!(node = %me, peer = %uid, "neighbour added");
                me > uid
            } else {
                !net.registry.is_valid(uid)
            };
            if ping {
                tracing::debug!(node = %me, peer = %uid, "pinging neighbour");
                self.shared
                    .send_beacon(&net, uid, BeaconKind::Ping(ReqRsp::Request));
            }
        }
        self.shared.wake();
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> NodeSnapshot {
        let net = self.shared.net.lock().await;
        let me = net.registry.ourself();
        NodeSnapshot {
            uid: self.shared.uid,
            state: self.state(),
            paired_speaker: me.paired_speaker,
            randnr: me.randnr,
            tx_status: net.tx_request.status,
            pending_beacons: net.inbox.len(),
            neighbours: net
                .registry
                .iter()
                .filter(|n| n.uid != self.shared.uid)
                .map(NeighbourInfo::from)
                .collect(),
        }
    }
}
