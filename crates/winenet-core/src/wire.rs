//! Winenet wire format: beacons and data packets.
//!
//! Two kinds of datagram travel over the link: control beacons (ping, election
//! queries, speaker hand-off and broadcast, acknowledgments) and data packets
//! produced by the upper layer. Every beacon carries a snapshot of the sender's
//! neighbour state so peers keep learning each other's beliefs without a
//! dedicated sync message.
//!
//! Multi-byte integers are little-endian. The header types use zerocopy derives
//! for allocation-free parsing; there is no unsafe code in this module.

use std::fmt;
use std::ops::BitOr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Unique identifier of a smart object. Totally ordered; the order drives
/// neighbour list sorting, ping initiation and speaker rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgencyUid(u64);

impl AgencyUid {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// On the wire, 0 means "no smart object".
    pub fn from_wire(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn to_wire(uid: Option<Self>) -> u64 {
        uid.map_or(0, |u| u.0)
    }
}

impl From<u64> for AgencyUid {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for AgencyUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

// ── Transaction IDs ───────────────────────────────────────────────────────────

/// Mask of the modulo sequence counter carried in a data packet.
pub const MAX_PACKET_TRANSID: u32 = 0x00ff_ffff;

/// Set on the last packet of a stream. Forces the receiver to close the frame.
pub const LAST_PACKET: u32 = 1 << 24;

const STREAM_SHIFT: u32 = 25;

/// Stream numbers wrap at 7 bits.
pub const STREAM_MASK: u8 = 0x7f;

/// Transaction ID of a data packet.
///
/// Layout:
///   bits  0-23: sequence number within the stream
///   bit     24: last packet of the stream
///   bits 25-31: stream number, bumped by the sender for every new stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransId(u32);

impl TransId {
    pub fn new(stream: u8, seq: u32, last: bool) -> Self {
        let mut raw = (seq & MAX_PACKET_TRANSID) | (u32::from(stream & STREAM_MASK) << STREAM_SHIFT);
        if last {
            raw |= LAST_PACKET;
        }
        Self(raw)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn seq(self) -> u32 {
        self.0 & MAX_PACKET_TRANSID
    }

    pub const fn is_last(self) -> bool {
        self.0 & LAST_PACKET != 0
    }

    pub const fn stream(self) -> u8 {
        (self.0 >> STREAM_SHIFT) as u8 & STREAM_MASK
    }
}

impl fmt::Display for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream(), self.seq())?;
        if self.is_last() {
            f.write_str("L")?;
        }
        Ok(())
    }
}

// ── Beacon identifiers ────────────────────────────────────────────────────────

/// Beacon identifier. Values are single bits so handlers can wait on a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BeaconId {
    /// The previous speaker gives the turn to the next smart object.
    GoSpeaker = 1 << 0,
    /// Acknowledges a beacon or a whole data frame.
    Acknowledgment = 1 << 1,
    /// A speaker tells its neighbours it is about to send (or, with the
    /// unpair cause, that its session is over).
    BroadcastSpeaker = 1 << 2,
    /// Reachability handshake between two newly discovered neighbours.
    Ping = 1 << 3,
    /// Asks a neighbour for its state; used for election and liveness.
    QueryState = 1 << 4,
}

impl TryFrom<u8> for BeaconId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(BeaconId::GoSpeaker),
            0x02 => Ok(BeaconId::Acknowledgment),
            0x04 => Ok(BeaconId::BroadcastSpeaker),
            0x08 => Ok(BeaconId::Ping),
            0x10 => Ok(BeaconId::QueryState),
            other => Err(WireError::UnknownBeacon(other)),
        }
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BeaconId::GoSpeaker => "GO_SPEAKER",
            BeaconId::Acknowledgment => "ACKNOWLEDGMENT",
            BeaconId::BroadcastSpeaker => "BROADCAST_SPEAKER",
            BeaconId::Ping => "PING",
            BeaconId::QueryState => "QUERY_STATE",
        })
    }
}

/// A set of beacon identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconMask(u8);

impl BeaconMask {
    pub const ANY: BeaconMask = BeaconMask(0xff);

    pub fn contains(self, id: BeaconId) -> bool {
        self.0 & id as u8 != 0
    }
}

impl From<BeaconId> for BeaconMask {
    fn from(id: BeaconId) -> Self {
        BeaconMask(id as u8)
    }
}

impl BitOr for BeaconId {
    type Output = BeaconMask;

    fn bitor(self, rhs: BeaconId) -> BeaconMask {
        BeaconMask(self as u8 | rhs as u8)
    }
}

impl BitOr<BeaconId> for BeaconMask {
    type Output = BeaconMask;

    fn bitor(self, rhs: BeaconId) -> BeaconMask {
        BeaconMask(self.0 | rhs as u8)
    }
}

// ── Beacon causes ─────────────────────────────────────────────────────────────

/// Cause of PING and QUERY_STATE beacons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReqRsp {
    Request = 1,
    Response = 2,
}

/// Cause of ACKNOWLEDGMENT beacons (and of an unpairing BROADCAST_SPEAKER).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    Abort = 1,
}

/// A beacon identifier together with its cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconKind {
    Ping(ReqRsp),
    GoSpeaker,
    BroadcastSpeaker { unpair: bool },
    Ack(AckStatus),
    QueryState(ReqRsp),
}

impl BeaconKind {
    pub fn id(self) -> BeaconId {
        match self {
            BeaconKind::Ping(_) => BeaconId::Ping,
            BeaconKind::GoSpeaker => BeaconId::GoSpeaker,
            BeaconKind::BroadcastSpeaker { .. } => BeaconId::BroadcastSpeaker,
            BeaconKind::Ack(_) => BeaconId::Acknowledgment,
            BeaconKind::QueryState(_) => BeaconId::QueryState,
        }
    }

    /// Wire sub-code; its meaning depends on the identifier.
    pub fn cause(self) -> u8 {
        match self {
            BeaconKind::Ping(r) | BeaconKind::QueryState(r) => r as u8,
            BeaconKind::GoSpeaker => 0,
            BeaconKind::BroadcastSpeaker { unpair } => {
                if unpair {
                    AckStatus::Abort as u8
                } else {
                    AckStatus::Ok as u8
                }
            }
            BeaconKind::Ack(status) => status as u8,
        }
    }

    fn from_wire(id: u8, cause: u8) -> Result<Self, WireError> {
        let bad_cause = || WireError::UnknownCause { id, cause };
        let req_rsp = |cause| match cause {
            1 => Ok(ReqRsp::Request),
            2 => Ok(ReqRsp::Response),
            _ => Err(bad_cause()),
        };
        match BeaconId::try_from(id)? {
            BeaconId::Ping => Ok(BeaconKind::Ping(req_rsp(cause)?)),
            BeaconId::QueryState => Ok(BeaconKind::QueryState(req_rsp(cause)?)),
            BeaconId::GoSpeaker => Ok(BeaconKind::GoSpeaker),
            BeaconId::BroadcastSpeaker => match cause {
                0 => Ok(BeaconKind::BroadcastSpeaker { unpair: false }),
                1 => Ok(BeaconKind::BroadcastSpeaker { unpair: true }),
                _ => Err(bad_cause()),
            },
            BeaconId::Acknowledgment => match cause {
                0 => Ok(BeaconKind::Ack(AckStatus::Ok)),
                1 => Ok(BeaconKind::Ack(AckStatus::Abort)),
                _ => Err(bad_cause()),
            },
        }
    }
}

impl fmt::Display for BeaconKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeaconKind::Ping(r) | BeaconKind::QueryState(r) => {
                write!(f, "{} ({:?})", self.id(), r)
            }
            BeaconKind::BroadcastSpeaker { unpair: true } => write!(f, "{} (unpair)", self.id()),
            BeaconKind::Ack(status) => write!(f, "{} ({:?})", self.id(), status),
            _ => write!(f, "{}", self.id()),
        }
    }
}

// ── Neighbour state ───────────────────────────────────────────────────────────

/// The sender's state, piggy-backed on every beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighbourState {
    /// The smart object the sender believes is the current speaker.
    pub paired_speaker: Option<AgencyUid>,
    /// Random tie-break number used during election.
    pub randnr: u32,
    /// Set on acknowledgments of data frames.
    pub pkt_data: bool,
    /// Transaction ID of the frame-closing packet being acknowledged.
    pub trans_id: TransId,
}

/// A control beacon: what it is, plus the sender's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub kind: BeaconKind,
    pub state: NeighbourState,
}

impl Beacon {
    pub fn new(kind: BeaconKind, state: NeighbourState) -> Self {
        Self { kind, state }
    }

    /// Serialize into a single datagram.
    pub fn encode(&self) -> Bytes {
        let header = BeaconHeader {
            kind: KIND_BEACON,
            id: self.kind.id() as u8,
            cause: self.kind.cause(),
            priv_len: NEIGHBOUR_STATE_LEN as u8,
        };
        let state = NeighbourStateWire::from(&self.state);

        let mut out = BytesMut::with_capacity(BEACON_LEN);
        out.put_slice(header.as_bytes());
        out.put_slice(state.as_bytes());
        out.freeze()
    }
}

// ── Data packets ──────────────────────────────────────────────────────────────

/// A data packet handed down by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub trans_id: TransId,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn new(trans_id: TransId, payload: Bytes) -> Self {
        Self { trans_id, payload }
    }

    /// Serialize into a single datagram.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }
        let header = DataHeader {
            kind: KIND_DATA,
            reserved: 0,
            trans_id: U32::new(self.trans_id.raw()),
            length: U16::new(self.payload.len() as u16),
        };

        let mut out = BytesMut::with_capacity(DATA_HEADER_LEN + self.payload.len());
        out.put_slice(header.as_bytes());
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }
}

// ── Datagram layout ───────────────────────────────────────────────────────────

/// First byte of a beacon datagram.
pub const KIND_BEACON: u8 = 0x01;

/// First byte of a data datagram.
pub const KIND_DATA: u8 = 0x02;

/// Maximum data payload in bytes. Larger data must be split by the producer.
pub const MAX_PAYLOAD: usize = 1400;

const NEIGHBOUR_STATE_LEN: usize = std::mem::size_of::<NeighbourStateWire>();
const BEACON_HEADER_LEN: usize = std::mem::size_of::<BeaconHeader>();
const DATA_HEADER_LEN: usize = std::mem::size_of::<DataHeader>();

/// Length of a beacon datagram as produced by [`Beacon::encode`].
pub const BEACON_LEN: usize = BEACON_HEADER_LEN + NEIGHBOUR_STATE_LEN;

/// Beacon header. `priv_len` bytes of private data follow; they always start
/// with a [`NeighbourStateWire`].
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct BeaconHeader {
    pub kind: u8,
    pub id: u8,
    pub cause: u8,
    pub priv_len: u8,
}

assert_eq_size!(BeaconHeader, [u8; 4]);

/// Neighbour state as carried in a beacon.
///
/// Wire size: 17 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct NeighbourStateWire {
    /// 0 when the sender is unpaired.
    pub paired_speaker: U64<LittleEndian>,
    pub trans_id: U32<LittleEndian>,
    pub pkt_data: u8,
    pub randnr: U32<LittleEndian>,
}

assert_eq_size!(NeighbourStateWire, [u8; 17]);

impl From<&NeighbourState> for NeighbourStateWire {
    fn from(state: &NeighbourState) -> Self {
        Self {
            paired_speaker: U64::new(AgencyUid::to_wire(state.paired_speaker)),
            trans_id: U32::new(state.trans_id.raw()),
            pkt_data: u8::from(state.pkt_data),
            randnr: U32::new(state.randnr),
        }
    }
}

impl From<&NeighbourStateWire> for NeighbourState {
    fn from(wire: &NeighbourStateWire) -> Self {
        Self {
            paired_speaker: AgencyUid::from_wire(wire.paired_speaker.get()),
            randnr: wire.randnr.get(),
            pkt_data: wire.pkt_data != 0,
            trans_id: TransId::from_raw(wire.trans_id.get()),
        }
    }
}

/// Data packet header, followed by `length` payload bytes.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct DataHeader {
    pub kind: u8,
    pub reserved: u8,
    pub trans_id: U32<LittleEndian>,
    pub length: U16<LittleEndian>,
}

assert_eq_size!(DataHeader, [u8; 8]);

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Beacon(Beacon),
    Data(DataPacket),
}

/// Parse one datagram received from the link.
pub fn decode(bytes: &[u8]) -> Result<Datagram, WireError> {
    match bytes.first() {
        None => Err(WireError::Truncated { needed: 1, got: 0 }),
        Some(&KIND_BEACON) => decode_beacon(bytes).map(Datagram::Beacon),
        Some(&KIND_DATA) => decode_data(bytes).map(Datagram::Data),
        Some(&other) => Err(WireError::UnknownKind(other)),
    }
}

fn decode_beacon(bytes: &[u8]) -> Result<Beacon, WireError> {
    let header = BeaconHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
        needed: BEACON_HEADER_LEN,
        got: bytes.len(),
    })?;

    let priv_len = header.priv_len as usize;
    if priv_len < NEIGHBOUR_STATE_LEN {
        return Err(WireError::Truncated {
            needed: BEACON_LEN,
            got: BEACON_HEADER_LEN + priv_len,
        });
    }
    if bytes.len() < BEACON_HEADER_LEN + priv_len {
        return Err(WireError::Truncated {
            needed: BEACON_HEADER_LEN + priv_len,
            got: bytes.len(),
        });
    }

    // Private data may grow; only the leading neighbour state is interpreted.
    let state = NeighbourStateWire::read_from_prefix(&bytes[BEACON_HEADER_LEN..]).ok_or(
        WireError::Truncated {
            needed: BEACON_LEN,
            got: bytes.len(),
        },
    )?;

    Ok(Beacon {
        kind: BeaconKind::from_wire(header.id, header.cause)?,
        state: NeighbourState::from(&state),
    })
}

fn decode_data(bytes: &[u8]) -> Result<DataPacket, WireError> {
    let header = DataHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
        needed: DATA_HEADER_LEN,
        got: bytes.len(),
    })?;

    let declared = header.length.get() as usize;
    let actual = bytes.len() - DATA_HEADER_LEN;
    if declared != actual {
        return Err(WireError::LengthMismatch { declared, actual });
    }

    Ok(DataPacket {
        trans_id: TransId::from_raw(header.trans_id.get()),
        payload: Bytes::copy_from_slice(&bytes[DATA_HEADER_LEN..]),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown datagram kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown beacon id: 0x{0:02x}")]
    UnknownBeacon(u8),

    #[error("invalid cause {cause} for beacon id 0x{id:02x}")]
    UnknownCause { id: u8, cause: u8 },

    #[error("datagram truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("declared payload length {declared} does not match {actual} received bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
