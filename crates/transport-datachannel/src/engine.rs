//! The capability table of the underlying peer-connection engine.
//!
//! The engine speaks in flat integer handles and global callback function
//! pointers. [`Engine`] mirrors that surface one call per method, keeping the
//! status convention: non-negative means success (or a handle, or a size),
//! negative is an error code.

use std::fmt;
use std::os::raw::{c_char, c_int, c_void};

pub const RTC_GATHERING_NEW: c_int = 0;
pub const RTC_GATHERING_INPROGRESS: c_int = 1;
pub const RTC_GATHERING_COMPLETE: c_int = 2;

/// Size marker passed with text payloads; the data is NUL-terminated.
pub const TEXT_MESSAGE_SIZE: c_int = -1;

pub type GatheringStateCallback = unsafe extern "C" fn(pc: c_int, state: c_int, ptr: *mut c_void);
pub type DataChannelCallback = unsafe extern "C" fn(pc: c_int, dc: c_int, ptr: *mut c_void);
pub type OpenCallback = unsafe extern "C" fn(id: c_int, ptr: *mut c_void);
pub type ClosedCallback = unsafe extern "C" fn(id: c_int, ptr: *mut c_void);
pub type MessageCallback =
    unsafe extern "C" fn(id: c_int, message: *const c_char, size: c_int, ptr: *mut c_void);

/// Which side of the handshake a remote description belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        }
    }
}

/// Names each engine entry point, for error reporting and fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineCall {
    CreatePeerConnection,
    SetGatheringStateCallback,
    SetDataChannelCallback,
    SetRemoteDescription,
    GetLocalDescription,
    CreateDataChannel,
    SetOpenCallback,
    SetMessageCallback,
    SetClosedCallback,
    SendMessage,
    CloseDataChannel,
    DeleteDataChannel,
    ClosePeerConnection,
    DeletePeerConnection,
}

impl EngineCall {
    pub fn symbol(self) -> &'static str {
        match self {
            EngineCall::CreatePeerConnection => "rtcCreatePeerConnection",
            EngineCall::SetGatheringStateCallback => "rtcSetGatheringStateChangeCallback",
            EngineCall::SetDataChannelCallback => "rtcSetDataChannelCallback",
            EngineCall::SetRemoteDescription => "rtcSetRemoteDescription",
            EngineCall::GetLocalDescription => "rtcGetLocalDescription",
            EngineCall::CreateDataChannel => "rtcCreateDataChannel",
            EngineCall::SetOpenCallback => "rtcSetOpenCallback",
            EngineCall::SetMessageCallback => "rtcSetMessageCallback",
            EngineCall::SetClosedCallback => "rtcSetClosedCallback",
            EngineCall::SendMessage => "rtcSendMessage",
            EngineCall::CloseDataChannel => "rtcClose",
            EngineCall::DeleteDataChannel => "rtcDelete",
            EngineCall::ClosePeerConnection => "rtcClosePeerConnection",
            EngineCall::DeletePeerConnection => "rtcDeletePeerConnection",
        }
    }
}

impl fmt::Display for EngineCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A callback-driven peer-connection engine.
///
/// Implementations may invoke the registered callbacks from any thread, at
/// any time between registration and deletion of the handle they were
/// registered on.
pub trait Engine: Send + Sync {
    /// Warm up global engine state. Safe to call repeatedly.
    fn preload(&self) {}

    /// Release global engine state once no connection is left.
    fn cleanup(&self) {}

    fn create_peer_connection(&self, ice_servers: &[String]) -> c_int;

    fn set_gathering_state_change_callback(&self, pc: c_int, cb: GatheringStateCallback) -> c_int;

    fn set_data_channel_callback(&self, pc: c_int, cb: DataChannelCallback) -> c_int;

    fn set_remote_description(&self, pc: c_int, sdp: &str, kind: DescriptionKind) -> c_int;

    /// Size-then-fill: with `None` returns the buffer length required
    /// (terminator included); with a buffer, copies the NUL-terminated
    /// description into it and returns the bytes written.
    fn local_description(&self, pc: c_int, buffer: Option<&mut [u8]>) -> c_int;

    fn create_data_channel(&self, pc: c_int, label: &str) -> c_int;

    fn set_open_callback(&self, dc: c_int, cb: OpenCallback) -> c_int;

    fn set_message_callback(&self, dc: c_int, cb: MessageCallback) -> c_int;

    fn set_closed_callback(&self, dc: c_int, cb: ClosedCallback) -> c_int;

    /// `size` is the byte length of a binary payload, or
    /// [`TEXT_MESSAGE_SIZE`] when `data` holds NUL-terminated text.
    fn send_message(&self, dc: c_int, data: &[u8], size: c_int) -> c_int;

    fn close_data_channel(&self, dc: c_int) -> c_int;

    fn delete_data_channel(&self, dc: c_int) -> c_int;

    fn close_peer_connection(&self, pc: c_int) -> c_int;

    fn delete_peer_connection(&self, pc: c_int) -> c_int;
}
