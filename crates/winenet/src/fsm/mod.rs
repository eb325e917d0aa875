//! Protocol state machine.
//!
//! One task per node runs the machine. Each state is an async method that
//! returns the next state; the task loop applies the transition and
//! publishes it on the state watch channel.
//!
//! The shared state lock is taken in short sections and never held across
//! an await.

mod ack;
mod idle;
mod listener;
mod speaker;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::Instrument;
use winenet_core::{AgencyUid, BeaconKind, ReqRsp};

use crate::error::WinenetError;
use crate::frame::TxStatus;
use crate::inbox::PendingBeacon;
use crate::node::{NetState, Shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WnetState {
    Init,
    Idle,
    Listener,
    Speaker,
}

impl fmt::Display for WnetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WnetState::Init => "INIT",
            WnetState::Idle => "IDLE",
            WnetState::Listener => "LISTENER",
            WnetState::Speaker => "SPEAKER",
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct FsmHandle {
    state: WnetState,
    previous: WnetState,
}

/// Election tie-break: higher random number wins, equal numbers fall back
/// to UID order.
pub(crate) fn wins_tie_break(ours: (u32, AgencyUid), theirs: (u32, AgencyUid)) -> bool {
    ours > theirs
}

/// State the machine works on. Split from [`Fsm`] so the shutdown receiver
/// can be polled next to a running state.
struct Engine {
    shared: Arc<Shared>,
    handle: FsmHandle,
    rng: StdRng,
    /// BROADCAST_SPEAKER already sent in this speaking session.
    broadcast_done: bool,
}

pub(crate) struct Fsm {
    engine: Engine,
    shutdown: broadcast::Receiver<()>,
}

impl Fsm {
    pub fn new(shared: Arc<Shared>, rng: StdRng, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            engine: Engine {
                shared,
                handle: FsmHandle {
                    state: WnetState::Init,
                    previous: WnetState::Init,
                },
                rng,
                broadcast_done: false,
            },
            shutdown,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            mut engine,
            mut shutdown,
        } = self;
        let span = tracing::info_span!("winenet", node = %engine.shared.uid);

        async move {
            tracing::info!("state machine started");
            loop {
                let next = tokio::select! {
                    _ = shutdown.recv() => break,
                    next = engine.step() => next,
                };
                engine.transition(next);
            }
            engine.stop().await;
            Ok(())
        }
        .instrument(span)
        .await
    }
}

impl Engine {
    async fn step(&mut self) -> WnetState {
        match self.handle.state {
            WnetState::Init => self.init().await,
            WnetState::Idle => self.idle().await,
            WnetState::Listener => self.listener().await,
            WnetState::Speaker => self.speaker().await,
        }
    }

    fn transition(&mut self, next: WnetState) {
        if next == self.handle.state {
            return;
        }
        tracing::info!(from = %self.handle.state, to = %next, "state change");
        self.handle.previous = self.handle.state;
        self.handle.state = next;
        self.shared.state.send_replace(next);
    }

    async fn init(&mut self) -> WnetState {
        let shared = self.shared.clone();
        loop {
            if shared.net.lock().await.registry.find(shared.uid).is_some() {
                return WnetState::Idle;
            }
            shared.wake.notified().await;
        }
    }

    async fn stop(&mut self) {
        let mut net = self.shared.net.lock().await;
        net.running = false;
        net.tx_request.status = TxStatus::NoData;
        net.tx_request.complete(Err(WinenetError::Stopped));
        tracing::info!(last_state = %self.handle.state, "state machine stopped");
    }

    /// New tie-break number, published with our next beacons.
    fn draw_randnr(&mut self, net: &mut NetState) {
        net.registry.ourself_mut().randnr = self.rng.gen();
    }

    /// Handle a PING beacon. Returns true if it completed or answered a handshake.
    fn process_ping(&self, net: &mut NetState, pending: &PendingBeacon) -> bool {
        let BeaconKind::Ping(cause) = pending.beacon.kind else {
            return false;
        };
        let Some(n) = net.registry.find_mut(pending.from) else {
            tracing::debug!(peer = %pending.from, "ping from unknown neighbour ignored");
            return false;
        };
        n.valid = true;

        match cause {
            ReqRsp::Request => {
                tracing::debug!(peer = %pending.from, "ping request, answering");
                self.shared
                    .send_beacon(net, pending.from, BeaconKind::Ping(ReqRsp::Response));
            }
            ReqRsp::Response => {
                tracing::info!(peer = %pending.from, "neighbour validated");
            }
        }
        true
    }

    /// Answer a QUERY_STATE request with our state.
    fn answer_query(&self, net: &NetState, pending: &PendingBeacon) {
        if pending.beacon.kind == BeaconKind::QueryState(ReqRsp::Request) {
            self.shared
                .send_beacon(net, pending.from, BeaconKind::QueryState(ReqRsp::Response));
        }
    }
}
