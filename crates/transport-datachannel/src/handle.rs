use std::fmt;
use std::os::raw::c_int;

use crate::engine::EngineCall;
use crate::error::{PeerError, Result};

pub const RTC_ERR_SUCCESS: c_int = 0;
pub const RTC_ERR_INVALID: c_int = -1;
pub const RTC_ERR_FAILURE: c_int = -2;
pub const RTC_ERR_NOT_AVAIL: c_int = -3;
pub const RTC_ERR_TOO_SMALL: c_int = -4;

/// Engine-issued identifier for a peer connection or a data channel.
///
/// Connections and channels share one numeric space inside the engine, and a
/// value may be handed out again once the resource behind it is deleted.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Handle(pub c_int);

impl Handle {
    pub fn raw(self) -> c_int {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Symbolic name for an engine status code.
pub fn error_name(code: c_int) -> &'static str {
    match code {
        RTC_ERR_SUCCESS => "RTC_ERR_SUCCESS",
        RTC_ERR_INVALID => "RTC_ERR_INVALID",
        RTC_ERR_FAILURE => "RTC_ERR_FAILURE",
        RTC_ERR_NOT_AVAIL => "RTC_ERR_NOT_AVAIL",
        RTC_ERR_TOO_SMALL => "RTC_ERR_TOO_SMALL",
        _ => "unknown",
    }
}

/// Turns a status-returning engine call into a `Result`, keeping the
/// non-negative value (a size, a handle or plain success).
pub fn check(status: c_int, call: EngineCall) -> Result<c_int> {
    if status < RTC_ERR_SUCCESS {
        return Err(PeerError::Engine { call, code: status });
    }
    Ok(status)
}

/// Like [`check`], for calls that hand back a new handle.
pub fn check_handle(status: c_int, call: EngineCall) -> Result<Handle> {
    check(status, call).map(Handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_status_names_the_call() {
        let err = check(RTC_ERR_FAILURE, EngineCall::CreatePeerConnection).unwrap_err();
        assert_eq!(
            err.to_string(),
            "rtcCreatePeerConnection failed with error code -2 (RTC_ERR_FAILURE)"
        );
    }

    #[test]
    fn non_negative_status_passes_through() {
        assert_eq!(check(0, EngineCall::SendMessage).unwrap(), 0);
        assert_eq!(
            check_handle(7, EngineCall::CreateDataChannel).unwrap(),
            Handle(7)
        );
    }

    #[test]
    fn unknown_codes_still_render() {
        assert_eq!(error_name(-42), "unknown");
    }
}
