//! winenet: datalink protocol engine for mesh smart objects.
//!
//! Neighbours validate each other with a ping handshake, elect a single
//! speaker, and pass the speaker role around in UID order. The speaker sends
//! data in frames of N packets, each frame covered by one acknowledgment and
//! retransmitted whole on loss.
//!
//! The engine sits between three external parties: a [`Transport`] that
//! moves datagrams, a discovery component that reports neighbours coming
//! and going, and a producer/consumer pair on top.

pub mod error;
pub mod frame;
pub mod inbox;
pub mod neighbour;
pub mod transport;

mod fsm;
mod node;
mod rx;

pub use error::WinenetError;
pub use frame::{SendTarget, TxStatus};
pub use fsm::WnetState;
pub use node::{NeighbourInfo, NodeSnapshot, Winenet};
pub use rx::Delivery;
pub use transport::{Transport, TransportError};

pub use winenet_core::{
    AckStatus, AgencyUid, Beacon, BeaconId, BeaconKind, DataPacket, NeighbourState,
    ProtocolConfig, ReqRsp, TransId,
};
