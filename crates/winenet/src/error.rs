use winenet_core::WireError;

use crate::transport::TransportError;

/// Failures reported to the producer. Timeouts, aborts and sequence breaks
/// are handled inside the state machine and never show up here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WinenetError {
    #[error("no neighbour acknowledged the frame")]
    Unreachable,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("winenet instance stopped")]
    Stopped,
}

impl From<WireError> for WinenetError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::PayloadTooLarge(len) => WinenetError::PayloadTooLarge(len),
            other => WinenetError::Transport(TransportError::Wire(other)),
        }
    }
}
