use thiserror::Error;

use crate::engine::EngineCall;
use crate::handle::{error_name, Handle};
use crate::peer::PeerState;

/// Shared result type for data channel operations.
pub type Result<T, E = PeerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("{call} failed with error code {code} ({})", code_name(.code))]
    Engine { call: EngineCall, code: i32 },
    #[error("{operation} is not valid while the peer is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: PeerState,
    },
    #[error("handle {0} is already registered")]
    HandleInUse(Handle),
    #[error("text payload contains an interior NUL byte")]
    InteriorNul,
    #[error("binary payload of {0} bytes exceeds the engine size limit")]
    PayloadTooLarge(usize),
    #[error("local description is not NUL-terminated UTF-8 text")]
    InvalidDescription,
    #[error("native engine is not available in this build")]
    NativeUnavailable,
}

fn code_name(code: &i32) -> &'static str {
    error_name(*code)
}

impl PeerError {
    /// True for precondition violations (misuse of the peer lifecycle).
    pub fn is_misuse(&self) -> bool {
        matches!(self, PeerError::InvalidState { .. })
    }
}
