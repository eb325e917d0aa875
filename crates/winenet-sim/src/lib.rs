//! winenet-sim: run Winenet meshes in one process.
//!
//! Nodes share an in-memory [`Medium`](medium::Medium) with configurable
//! loss; [`Discovery`](discovery::Discovery) tells them about each other.

pub mod discovery;
pub mod medium;
pub mod mesh;
pub mod report;
pub mod traffic;

pub use discovery::Discovery;
pub use medium::{Medium, MediumStats};
pub use mesh::{Mesh, SimNode};
pub use report::Report;
pub use traffic::{Consumer, Producer, TrafficShape, TrafficStats};
