//! winenet-core: identifiers, wire format and configuration.
//! The protocol engine and the simulator both depend on this one.

pub mod config;
pub mod wire;

pub use config::{ProtocolConfig, SimulationConfig, WinenetConfig};
pub use wire::{
    AckStatus, AgencyUid, Beacon, BeaconId, BeaconKind, BeaconMask, DataPacket, Datagram,
    NeighbourState, ReqRsp, TransId, WireError,
};
