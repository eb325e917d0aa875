//! Transport boundary: how the engine puts beacons and packets on the link.
//!
//! Sends are fire-and-forget datagrams. Implementations must not block and
//! must not call back into the engine from inside a send.

use winenet_core::{AgencyUid, Beacon, DataPacket, WireError};

pub trait Transport: Send + Sync {
    /// Send a control beacon to one neighbour.
    fn send_beacon(&self, to: AgencyUid, beacon: &Beacon) -> Result<(), TransportError>;

    /// Send a data packet to one neighbour.
    fn send_packet(&self, to: AgencyUid, packet: &DataPacket) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no link to {0}")]
    NoLink(AgencyUid),

    #[error("link closed")]
    Closed,

    #[error("encoding failed: {0}")]
    Wire(#[from] WireError),
}
