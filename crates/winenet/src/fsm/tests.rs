//! State machine tests. One real node talks to scripted peers through a
//! recording transport; the tokio clock is paused so ACK timeouts elapse
//! instantly once the node is waiting on nothing else.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use winenet_core::wire::MAX_PAYLOAD;
use winenet_core::{
    AckStatus, AgencyUid, Beacon, BeaconKind, DataPacket, NeighbourState, ProtocolConfig, ReqRsp,
    TransId,
};

use crate::frame::{SendTarget, TxStatus};
use crate::rx::Delivery;
use crate::transport::{Transport, TransportError};
use crate::{WinenetError, Winenet, WnetState};

// ── Harness ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Beacon(AgencyUid, Beacon),
    Packet(AgencyUid, DataPacket),
}

struct Recorder(mpsc::UnboundedSender<Sent>);

impl Transport for Recorder {
    fn send_beacon(&self, to: AgencyUid, beacon: &Beacon) -> Result<(), TransportError> {
        self.0
            .send(Sent::Beacon(to, *beacon))
            .map_err(|_| TransportError::Closed)
    }

    fn send_packet(&self, to: AgencyUid, packet: &DataPacket) -> Result<(), TransportError> {
        self.0
            .send(Sent::Packet(to, packet.clone()))
            .map_err(|_| TransportError::Closed)
    }
}

fn uid(n: u64) -> AgencyUid {
    AgencyUid::new(n)
}

fn state(paired: Option<u64>, randnr: u32) -> NeighbourState {
    NeighbourState {
        paired_speaker: paired.map(uid),
        randnr,
        ..NeighbourState::default()
    }
}

fn frame_ack(paired: u64, trans_id: TransId) -> NeighbourState {
    NeighbourState {
        pkt_data: true,
        trans_id,
        ..state(Some(paired), 0)
    }
}

fn is_poll(sent: &Sent) -> bool {
    matches!(sent, Sent::Beacon(_, b) if b.kind == BeaconKind::QueryState(ReqRsp::Request))
}

struct Harness {
    node: Winenet,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    sent: mpsc::UnboundedReceiver<Sent>,
    log: Vec<Sent>,
}

impl Harness {
    fn new(me: u64, packets_per_frame: usize) -> Self {
        let (tx, sent) = mpsc::unbounded_channel();
        let config = ProtocolConfig {
            packets_per_frame,
            rng_seed: Some(7),
            ..ProtocolConfig::default()
        };
        let (node, deliveries) =
            Winenet::spawn(uid(me), config, Arc::new(Recorder(tx))).expect("valid config");
        Self {
            node,
            deliveries,
            sent,
            log: Vec::new(),
        }
    }

    async fn next(&mut self) -> Sent {
        let sent = timeout(Duration::from_secs(60), self.sent.recv())
            .await
            .expect("node sent nothing")
            .expect("transport closed");
        self.log.push(sent.clone());
        sent
    }

    /// Next beacon to `to` of the given kind. State polls in between are
    /// skipped; anything else fails the test.
    async fn expect_beacon(&mut self, to: u64, kind: BeaconKind) -> Beacon {
        loop {
            match self.next().await {
                Sent::Beacon(t, b) if t == uid(to) && b.kind == kind => return b,
                other if is_poll(&other) => continue,
                other => panic!("expected {kind} to {to}, got {other:?}"),
            }
        }
    }

    async fn expect_packet(&mut self, to: u64) -> DataPacket {
        loop {
            match self.next().await {
                Sent::Packet(t, p) if t == uid(to) => return p,
                other if is_poll(&other) => continue,
                other => panic!("expected data to {to}, got {other:?}"),
            }
        }
    }

    async fn inject(&self, from: u64, kind: BeaconKind, state: NeighbourState) {
        self.node
            .on_beacon_received(uid(from), Beacon::new(kind, state))
            .await;
    }

    /// Everything sent so far.
    fn drain(&mut self) -> Vec<Sent> {
        while let Ok(sent) = self.sent.try_recv() {
            self.log.push(sent);
        }
        self.log.clone()
    }

    fn count_beacons(&mut self, to: u64, kind: BeaconKind) -> usize {
        self.drain()
            .iter()
            .filter(|s| matches!(s, Sent::Beacon(t, b) if *t == uid(to) && b.kind == kind))
            .count()
    }

    async fn wait_state(&self, want: WnetState) {
        let mut rx = self.node.watch_state();
        timeout(Duration::from_secs(60), rx.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("node never reached {want}"))
            .expect("state channel closed");
    }

    async fn wait_tx_status(&self, want: TxStatus) {
        for _ in 0..1000 {
            if self.node.snapshot().await.tx_status == want {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("tx status never became {want:?}");
    }

    /// Complete the ping handshake with a peer that has a lower UID.
    async fn validate(&mut self, peer: u64) {
        self.node.on_neighbour_added(uid(peer)).await;
        self.expect_beacon(peer, BeaconKind::Ping(ReqRsp::Request)).await;
        self.inject(peer, BeaconKind::Ping(ReqRsp::Response), state(None, 0))
            .await;
    }

    /// Let `from` hand the speaker role to us.
    async fn handed_speakership(&mut self, me: u64, from: u64) {
        self.inject(from, BeaconKind::GoSpeaker, state(Some(me), 0)).await;
        self.expect_beacon(from, BeaconKind::Ack(AckStatus::Ok)).await;
    }

    /// Queue a frame from a separate producer task and wait until it is ready.
    async fn queue_frame(
        &self,
        payloads: Vec<&'static str>,
        last: bool,
    ) -> tokio::task::JoinHandle<Result<(), WinenetError>> {
        let node = self.node.clone();
        let handle = tokio::spawn(async move {
            let count = payloads.len();
            for (i, p) in payloads.into_iter().enumerate() {
                let is_last = last && i + 1 == count;
                node.submit_frame(SendTarget::Broadcast, Bytes::from_static(p.as_bytes()), is_last)
                    .await?;
            }
            Ok::<(), WinenetError>(())
        });
        self.wait_tx_status(TxStatus::DataReady).await;
        handle
    }
}

// ── Ping handshake ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn greater_uid_pings_and_both_sides_validate() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;

    h.expect_beacon(10, BeaconKind::QueryState(ReqRsp::Request)).await;
    h.wait_state(WnetState::Listener).await;

    let snap = h.node.snapshot().await;
    assert!(snap.neighbours.iter().any(|n| n.uid == uid(10) && n.valid));

    h.node.on_neighbour_added(uid(10)).await;
    assert_eq!(h.count_beacons(10, BeaconKind::Ping(ReqRsp::Request)), 1);
    assert_eq!(h.count_beacons(10, BeaconKind::Ping(ReqRsp::Response)), 0);
}

#[tokio::test(start_paused = true)]
async fn lower_uid_waits_for_ping_and_answers() {
    let mut h = Harness::new(10, 8);
    h.node.on_neighbour_added(uid(20)).await;
    assert!(h.drain().is_empty());

    h.inject(20, BeaconKind::Ping(ReqRsp::Request), state(None, 0)).await;
    h.expect_beacon(20, BeaconKind::Ping(ReqRsp::Response)).await;
    h.wait_state(WnetState::Listener).await;

    let snap = h.node.snapshot().await;
    assert!(snap.neighbours.iter().any(|n| n.uid == uid(20) && n.valid));
    assert_eq!(h.count_beacons(20, BeaconKind::Ping(ReqRsp::Request)), 0);
}

#[tokio::test(start_paused = true)]
async fn ping_from_unknown_neighbour_is_ignored() {
    let mut h = Harness::new(10, 8);
    h.wait_state(WnetState::Idle).await;
    h.inject(99, BeaconKind::Ping(ReqRsp::Request), state(None, 0)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.node.state(), WnetState::Idle);
    assert!(h.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_neighbour_is_pinged_again_on_refresh() {
    let mut h = Harness::new(10, 8);
    h.node.on_neighbour_added(uid(20)).await;
    h.node.on_neighbour_updated(uid(20), None).await;
    h.expect_beacon(20, BeaconKind::Ping(ReqRsp::Request)).await;
}

// ── Election ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn higher_random_number_claims_speakership() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    h.expect_beacon(10, BeaconKind::QueryState(ReqRsp::Request)).await;
    let ours = h.node.snapshot().await.randnr;

    let producer = h.queue_frame(vec!["hello"], true).await;

    h.inject(
        10,
        BeaconKind::QueryState(ReqRsp::Response),
        state(None, ours.saturating_sub(1)),
    )
    .await;

    let broadcast = h
        .expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false })
        .await;
    assert_eq!(h.node.state(), WnetState::Speaker);
    assert_eq!(broadcast.state.paired_speaker, Some(uid(20)));

    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(20), 0)).await;
    let packet = h.expect_packet(10).await;
    assert!(packet.trans_id.is_last());

    let snap = h.node.snapshot().await;
    assert!(snap
        .neighbours
        .iter()
        .any(|n| n.uid == uid(10) && n.paired_speaker == Some(uid(20))));

    h.inject(10, BeaconKind::Ack(AckStatus::Ok), frame_ack(20, packet.trans_id))
        .await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: true }).await;
    h.expect_beacon(10, BeaconKind::GoSpeaker).await;
    assert!(!producer.is_finished());

    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(10), 0)).await;
    assert_eq!(producer.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn lower_random_number_answers_and_follows() {
    let mut h = Harness::new(10, 8);
    h.node.on_neighbour_added(uid(20)).await;
    h.inject(20, BeaconKind::Ping(ReqRsp::Request), state(None, 0)).await;
    h.expect_beacon(20, BeaconKind::Ping(ReqRsp::Response)).await;
    h.wait_state(WnetState::Listener).await;

    h.inject(20, BeaconKind::QueryState(ReqRsp::Request), state(None, u32::MAX))
        .await;
    let answer = h
        .expect_beacon(20, BeaconKind::QueryState(ReqRsp::Response))
        .await;
    assert_eq!(answer.state.paired_speaker, None);
    assert_eq!(h.node.state(), WnetState::Listener);

    h.inject(20, BeaconKind::BroadcastSpeaker { unpair: false }, state(Some(20), u32::MAX))
        .await;
    let ack = h.expect_beacon(20, BeaconKind::Ack(AckStatus::Ok)).await;
    assert_eq!(ack.state.paired_speaker, Some(uid(20)));

    let snap = h.node.snapshot().await;
    assert_eq!(snap.state, WnetState::Listener);
    assert_eq!(snap.paired_speaker, Some(uid(20)));
}

#[tokio::test(start_paused = true)]
async fn broadcast_from_second_speaker_is_refused() {
    let mut h = Harness::new(30, 8);
    h.validate(10).await;
    h.validate(20).await;

    h.inject(10, BeaconKind::BroadcastSpeaker { unpair: false }, state(Some(10), 0))
        .await;
    h.expect_beacon(10, BeaconKind::Ack(AckStatus::Ok)).await;

    h.inject(20, BeaconKind::BroadcastSpeaker { unpair: false }, state(Some(20), 0))
        .await;
    h.expect_beacon(20, BeaconKind::Ack(AckStatus::Abort)).await;

    h.inject(10, BeaconKind::BroadcastSpeaker { unpair: true }, state(None, 0))
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.node.snapshot().await.paired_speaker, None);
}

// ── Rotation ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn speaker_without_data_hands_off_once() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    h.handed_speakership(20, 10).await;

    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: true }).await;
    h.expect_beacon(10, BeaconKind::GoSpeaker).await;
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(10), 0)).await;

    h.wait_state(WnetState::Listener).await;
    assert_eq!(h.node.snapshot().await.paired_speaker, Some(uid(10)));
    assert_eq!(h.count_beacons(10, BeaconKind::GoSpeaker), 1);
    assert!(!h.drain().iter().any(|s| matches!(s, Sent::Packet(..))));
}

#[tokio::test(start_paused = true)]
async fn hand_off_follows_uid_order_and_skips_silent_candidate() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    h.node.on_neighbour_added(uid(30)).await;
    h.inject(30, BeaconKind::Ping(ReqRsp::Request), state(None, 0)).await;
    h.expect_beacon(30, BeaconKind::Ping(ReqRsp::Response)).await;

    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: true }).await;

    // Next after ourself is 30. It never answers.
    let retries = ProtocolConfig::default().retries_max as usize;
    for _ in 0..=retries {
        h.expect_beacon(30, BeaconKind::GoSpeaker).await;
    }

    // Wraps around to 10.
    h.expect_beacon(10, BeaconKind::GoSpeaker).await;
    assert_eq!(h.count_beacons(30, BeaconKind::GoSpeaker), retries + 1);

    let snap = h.node.snapshot().await;
    assert!(snap.neighbours.iter().any(|n| n.uid == uid(30) && !n.valid));
}

#[tokio::test(start_paused = true)]
async fn refused_hand_off_leaves_us_unpaired_listener() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: true }).await;
    h.expect_beacon(10, BeaconKind::GoSpeaker).await;

    h.inject(10, BeaconKind::Ack(AckStatus::Abort), state(Some(10), 0)).await;
    h.wait_state(WnetState::Listener).await;
    assert_eq!(h.node.snapshot().await.paired_speaker, None);
}

// ── Framed delivery: sender ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn lost_frame_ack_retransmits_whole_frame() {
    let mut h = Harness::new(20, 3);
    h.validate(10).await;
    let producer = h.queue_frame(vec!["a", "b", "c"], false).await;

    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false }).await;
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(20), 0)).await;

    let mut first = Vec::new();
    for _ in 0..3 {
        first.push(h.expect_packet(10).await);
    }
    // The ACK is lost; the whole frame comes again after the timeout.
    let mut second = Vec::new();
    for _ in 0..3 {
        second.push(h.expect_packet(10).await);
    }
    assert_eq!(first, second);
    assert_eq!(
        first.iter().map(|p| p.trans_id.seq()).collect::<Vec<_>>(),
        [0, 1, 2]
    );

    h.inject(10, BeaconKind::Ack(AckStatus::Ok), frame_ack(20, first[2].trans_id))
        .await;
    assert_eq!(producer.await.unwrap(), Ok(()));
    h.wait_tx_status(TxStatus::DataInProgress).await;
    assert_eq!(h.node.state(), WnetState::Speaker);
}

#[tokio::test(start_paused = true)]
async fn aborted_frame_is_resent_and_stale_ack_ignored() {
    let mut h = Harness::new(20, 2);
    h.validate(10).await;
    let producer = h.queue_frame(vec!["a", "b"], false).await;

    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false }).await;
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(20), 0)).await;

    h.expect_packet(10).await;
    let closing = h.expect_packet(10).await;

    // An OK for some other packet does not complete the frame.
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), frame_ack(20, TransId::new(0, 9, false)))
        .await;
    h.inject(10, BeaconKind::Ack(AckStatus::Abort), frame_ack(20, closing.trans_id))
        .await;

    h.expect_packet(10).await;
    let again = h.expect_packet(10).await;
    assert_eq!(again, closing);

    h.inject(10, BeaconKind::Ack(AckStatus::Ok), frame_ack(20, closing.trans_id))
        .await;
    assert_eq!(producer.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn frame_nobody_acknowledges_fails_producer() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    let producer = h.queue_frame(vec!["x"], true).await;

    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false }).await;
    // Acknowledged, but paired to someone else: no receiver for the frame.
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(10), 0)).await;

    assert_eq!(producer.await.unwrap(), Err(WinenetError::Unreachable));
    h.expect_beacon(10, BeaconKind::GoSpeaker).await;

    // Still handing off: ending the stream now waits for the hand-off.
    let node = h.node.clone();
    let eot = tokio::spawn(async move { node.submit_end_of_transmission().await });
    h.wait_tx_status(TxStatus::DataCompleted).await;
    assert!(!eot.is_finished());

    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(10), 0)).await;
    assert_eq!(eot.await.unwrap(), Ok(()));
    h.wait_state(WnetState::Listener).await;
    assert_eq!(h.node.snapshot().await.tx_status, TxStatus::NoData);
}

#[tokio::test(start_paused = true)]
async fn end_of_transmission_hands_off() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    for p in ["a", "b"] {
        h.node
            .submit_frame(SendTarget::Broadcast, Bytes::from_static(p.as_bytes()), false)
            .await
            .unwrap();
    }
    // Two packets do not close a frame of eight; flush them.
    let node = h.node.clone();
    let eot = tokio::spawn(async move { node.submit_end_of_transmission().await });
    h.wait_tx_status(TxStatus::DataReady).await;

    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false }).await;
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(20), 0)).await;

    h.expect_packet(10).await;
    let closing = h.expect_packet(10).await;
    assert!(closing.trans_id.is_last());
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), frame_ack(20, closing.trans_id))
        .await;

    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: true }).await;
    h.expect_beacon(10, BeaconKind::GoSpeaker).await;
    assert!(!eot.is_finished());
    assert_eq!(h.node.state(), WnetState::Speaker);

    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(10), 0)).await;
    assert_eq!(eot.await.unwrap(), Ok(()));
    h.wait_state(WnetState::Listener).await;
    assert_eq!(h.node.snapshot().await.paired_speaker, Some(uid(10)));
}

#[tokio::test(start_paused = true)]
async fn end_of_transmission_after_last_frame_returns_at_once() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    let producer = h.queue_frame(vec!["x"], true).await;

    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false }).await;
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(20), 0)).await;
    let packet = h.expect_packet(10).await;
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), frame_ack(20, packet.trans_id))
        .await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: true }).await;
    h.expect_beacon(10, BeaconKind::GoSpeaker).await;
    h.inject(10, BeaconKind::Ack(AckStatus::Ok), state(Some(10), 0)).await;
    assert_eq!(producer.await.unwrap(), Ok(()));

    // The session is over; nothing is left to end.
    let eot = timeout(Duration::from_millis(1), h.node.submit_end_of_transmission()).await;
    assert_eq!(eot, Ok(Ok(())));
    assert_eq!(h.node.snapshot().await.tx_status, TxStatus::NoData);
}

// ── Framed delivery: receiver ─────────────────────────────────────────────────

async fn paired_listener(h: &mut Harness, speaker: u64) {
    h.node.on_neighbour_added(uid(speaker)).await;
    h.inject(speaker, BeaconKind::Ping(ReqRsp::Request), state(None, 0))
        .await;
    h.expect_beacon(speaker, BeaconKind::Ping(ReqRsp::Response)).await;
    h.inject(
        speaker,
        BeaconKind::BroadcastSpeaker { unpair: false },
        state(Some(speaker), u32::MAX),
    )
    .await;
    let ack = h.expect_beacon(speaker, BeaconKind::Ack(AckStatus::Ok)).await;
    assert_eq!(ack.state.paired_speaker, Some(uid(speaker)));
}

fn packets(stream: u8, seqs: std::ops::Range<u32>) -> Vec<DataPacket> {
    seqs.map(|s| DataPacket::new(TransId::new(stream, s, false), Bytes::from(format!("pkt{s}"))))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn duplicate_frame_is_delivered_once_and_reacknowledged() {
    let mut h = Harness::new(10, 3);
    paired_listener(&mut h, 20).await;
    let frame = packets(0, 0..3);

    for p in &frame {
        h.node.on_data_received(uid(20), p.clone()).await;
    }
    let ack = h.expect_beacon(20, BeaconKind::Ack(AckStatus::Ok)).await;
    assert!(ack.state.pkt_data);
    assert_eq!(ack.state.trans_id, frame[2].trans_id);

    for p in &frame {
        let d = h.deliveries.try_recv().unwrap();
        assert_eq!(d.payload, p.payload);
        assert_eq!(d.from, uid(20));
    }

    // The speaker missed our ACK and sends the frame again.
    for p in &frame {
        h.node.on_data_received(uid(20), p.clone()).await;
    }
    let again = h.expect_beacon(20, BeaconKind::Ack(AckStatus::Ok)).await;
    assert_eq!(again.state.trans_id, frame[2].trans_id);
    assert!(h.deliveries.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn sequence_gap_aborts_then_recovers() {
    let mut h = Harness::new(10, 3);
    paired_listener(&mut h, 20).await;
    let frame = packets(0, 0..3);

    h.node.on_data_received(uid(20), frame[0].clone()).await;
    h.node.on_data_received(uid(20), frame[2].clone()).await;
    let abort = h.expect_beacon(20, BeaconKind::Ack(AckStatus::Abort)).await;
    assert!(abort.state.pkt_data);
    assert!(h.deliveries.try_recv().is_err());

    for p in &frame {
        h.node.on_data_received(uid(20), p.clone()).await;
    }
    h.expect_beacon(20, BeaconKind::Ack(AckStatus::Ok)).await;
    for _ in 0..3 {
        h.deliveries.try_recv().unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn data_from_non_speaker_is_dropped() {
    let mut h = Harness::new(10, 1);
    paired_listener(&mut h, 20).await;
    h.node.on_neighbour_added(uid(5)).await;

    h.node.on_data_received(uid(5), packets(0, 0..1).remove(0)).await;
    assert!(h.deliveries.try_recv().is_err());

    h.node.cancel_rx().await;
    h.node.on_data_received(uid(20), packets(0, 0..1).remove(0)).await;
    assert!(h.deliveries.try_recv().is_err());
    assert_eq!(h.count_beacons(20, BeaconKind::Ack(AckStatus::Ok)), 1);
}

#[tokio::test(start_paused = true)]
async fn raw_datagrams_are_decoded() {
    let mut h = Harness::new(10, 1);
    paired_listener(&mut h, 20).await;

    let bytes = packets(0, 0..1).remove(0).encode().unwrap();
    h.node.on_datagram(uid(20), &bytes).await.unwrap();
    assert_eq!(h.deliveries.try_recv().unwrap().payload, Bytes::from("pkt0"));
    assert!(h.node.on_datagram(uid(20), &[0xee]).await.is_err());
}

// ── Failure handling ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn silent_listener_is_invalidated_after_retry_budget() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    let _producer = h.queue_frame(vec!["x"], true).await;
    h.handed_speakership(20, 10).await;

    let retries = ProtocolConfig::default().retries_max as usize;
    for _ in 0..=retries {
        h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false })
            .await;
    }
    h.wait_state(WnetState::Idle).await;
    assert_eq!(
        h.count_beacons(10, BeaconKind::BroadcastSpeaker { unpair: false }),
        retries + 1
    );
    let snap = h.node.snapshot().await;
    assert!(snap.neighbours.iter().all(|n| !n.valid));
}

#[tokio::test(start_paused = true)]
async fn removal_during_ack_wait_counts_as_timeout() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    let _producer = h.queue_frame(vec!["x"], true).await;
    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false })
        .await;

    h.node.on_neighbour_removed(uid(10)).await;
    h.wait_state(WnetState::Idle).await;
    assert_eq!(
        h.count_beacons(10, BeaconKind::BroadcastSpeaker { unpair: false }),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn weaker_claim_during_broadcast_is_aborted() {
    let mut h = Harness::new(20, 8);
    h.validate(5).await;
    h.validate(10).await;
    let _producer = h.queue_frame(vec!["x"], true).await;

    h.handed_speakership(20, 10).await;
    h.expect_beacon(5, BeaconKind::BroadcastSpeaker { unpair: false }).await;

    h.inject(10, BeaconKind::BroadcastSpeaker { unpair: false }, state(Some(10), 0))
        .await;
    h.expect_beacon(10, BeaconKind::Ack(AckStatus::Abort)).await;

    h.inject(5, BeaconKind::Ack(AckStatus::Ok), state(Some(20), 0)).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false }).await;
    assert_eq!(h.node.state(), WnetState::Speaker);
}

#[tokio::test(start_paused = true)]
async fn abort_of_broadcast_steps_down() {
    let mut h = Harness::new(20, 8);
    h.validate(10).await;
    let _producer = h.queue_frame(vec!["x"], true).await;
    h.handed_speakership(20, 10).await;
    h.expect_beacon(10, BeaconKind::BroadcastSpeaker { unpair: false }).await;

    h.inject(10, BeaconKind::Ack(AckStatus::Abort), state(Some(10), 0)).await;
    h.wait_state(WnetState::Listener).await;
    let snap = h.node.snapshot().await;
    assert_eq!(snap.paired_speaker, None);
    assert_eq!(snap.tx_status, TxStatus::DataReady);
}

// ── Producer API ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn end_of_transmission_outside_speakership_returns_at_once() {
    let h = Harness::new(20, 8);
    h.wait_state(WnetState::Idle).await;
    assert_eq!(h.node.submit_end_of_transmission().await, Ok(()));
    assert_eq!(h.node.snapshot().await.tx_status, TxStatus::NoData);
}

#[tokio::test(start_paused = true)]
async fn oversized_payload_is_rejected() {
    let h = Harness::new(20, 8);
    let big = Bytes::from(vec![0u8; MAX_PAYLOAD + 1]);
    assert_eq!(
        h.node.submit_frame(SendTarget::Broadcast, big, false).await,
        Err(WinenetError::PayloadTooLarge(MAX_PAYLOAD + 1))
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_blocked_producer() {
    let h = Harness::new(20, 8);
    let producer = h.queue_frame(vec!["x"], true).await;

    h.node.shutdown();
    assert_eq!(producer.await.unwrap(), Err(WinenetError::Stopped));
    assert_eq!(
        h.node
            .submit_frame(SendTarget::Broadcast, Bytes::from_static(b"y"), true)
            .await,
        Err(WinenetError::Stopped)
    );
}
