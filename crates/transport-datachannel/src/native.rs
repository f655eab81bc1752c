//! libdatachannel bindings.
//!
//! Linking is configured by `build.rs`; point `DATACHANNEL_LIB_DIR` at the
//! directory holding the shared library when it is not on the default search
//! path.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;

use once_cell::sync::OnceCell;
use tracing::{debug, error, info, trace, warn};

use crate::engine::{
    ClosedCallback, DataChannelCallback, DescriptionKind, Engine, GatheringStateCallback,
    MessageCallback, OpenCallback,
};
use crate::handle::RTC_ERR_INVALID;

mod ffi {
    use std::os::raw::{c_char, c_int};

    use crate::engine::{
        ClosedCallback, DataChannelCallback, GatheringStateCallback, MessageCallback,
        OpenCallback,
    };

    pub type LogCallback = unsafe extern "C" fn(level: c_int, message: *const c_char);

    #[repr(C)]
    pub struct RtcConfiguration {
        pub ice_servers: *const *const c_char,
        pub ice_servers_count: c_int,
        pub proxy_server: *const c_char,
        pub bind_address: *const c_char,
        pub certificate_type: c_int,
        pub ice_transport_policy: c_int,
        pub enable_ice_tcp: bool,
        pub enable_ice_udp_mux: bool,
        pub disable_auto_negotiation: bool,
        pub force_media_transport: bool,
        pub port_range_begin: u16,
        pub port_range_end: u16,
        pub mtu: c_int,
        pub max_message_size: c_int,
    }

    extern "C" {
        pub fn rtcInitLogger(level: c_int, cb: Option<LogCallback>);
        pub fn rtcPreload();
        pub fn rtcCleanup();

        pub fn rtcCreatePeerConnection(config: *const RtcConfiguration) -> c_int;
        pub fn rtcClosePeerConnection(pc: c_int) -> c_int;
        pub fn rtcDeletePeerConnection(pc: c_int) -> c_int;

        pub fn rtcSetGatheringStateChangeCallback(pc: c_int, cb: Option<GatheringStateCallback>) -> c_int;
        pub fn rtcSetDataChannelCallback(pc: c_int, cb: Option<DataChannelCallback>) -> c_int;
        pub fn rtcSetRemoteDescription(pc: c_int, sdp: *const c_char, kind: *const c_char) -> c_int;
        pub fn rtcGetLocalDescription(pc: c_int, buffer: *mut c_char, size: c_int) -> c_int;

        pub fn rtcCreateDataChannel(pc: c_int, label: *const c_char) -> c_int;
        pub fn rtcSetOpenCallback(id: c_int, cb: Option<OpenCallback>) -> c_int;
        pub fn rtcSetMessageCallback(id: c_int, cb: Option<MessageCallback>) -> c_int;
        pub fn rtcSetClosedCallback(id: c_int, cb: Option<ClosedCallback>) -> c_int;
        pub fn rtcSendMessage(id: c_int, data: *const c_char, size: c_int) -> c_int;
        pub fn rtcClose(id: c_int) -> c_int;
        pub fn rtcDelete(id: c_int) -> c_int;
    }
}

/// Verbosity of the engine's own log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum EngineLogLevel {
    None = 0,
    Fatal = 1,
    Error = 2,
    Warning = 3,
    Info = 4,
    Debug = 5,
    Verbose = 6,
}

static LOGGER: OnceCell<EngineLogLevel> = OnceCell::new();

/// Forward libdatachannel log lines to `tracing` under the `libdatachannel`
/// target. Only the first call installs the logger.
pub fn enable_engine_logging(level: EngineLogLevel) {
    let mut installed = false;
    LOGGER.get_or_init(|| {
        unsafe { ffi::rtcInitLogger(level as c_int, Some(forward_engine_log)) };
        installed = true;
        level
    });
    if installed {
        debug!(target: "datachannel", ?level, "engine logging enabled");
    }
}

unsafe extern "C" fn forward_engine_log(level: c_int, message: *const c_char) {
    if message.is_null() {
        return;
    }
    let line = CStr::from_ptr(message).to_string_lossy();
    match level {
        1 | 2 => error!(target: "libdatachannel", "{line}"),
        3 => warn!(target: "libdatachannel", "{line}"),
        4 => info!(target: "libdatachannel", "{line}"),
        5 => debug!(target: "libdatachannel", "{line}"),
        _ => trace!(target: "libdatachannel", "{line}"),
    }
}

/// [`Engine`] backed by the system libdatachannel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEngine;

impl NativeEngine {
    pub fn new() -> Self {
        Self
    }
}

fn c_string(value: &str) -> Option<CString> {
    CString::new(value).ok()
}

impl Engine for NativeEngine {
    fn preload(&self) {
        unsafe { ffi::rtcPreload() }
    }

    fn cleanup(&self) {
        unsafe { ffi::rtcCleanup() }
    }

    fn create_peer_connection(&self, ice_servers: &[String]) -> c_int {
        let Some(servers) = ice_servers
            .iter()
            .map(|server| c_string(server))
            .collect::<Option<Vec<_>>>()
        else {
            return RTC_ERR_INVALID;
        };
        let pointers: Vec<*const c_char> = servers.iter().map(|s| s.as_ptr()).collect();
        let config = ffi::RtcConfiguration {
            ice_servers: if pointers.is_empty() {
                ptr::null()
            } else {
                pointers.as_ptr()
            },
            ice_servers_count: pointers.len() as c_int,
            proxy_server: ptr::null(),
            bind_address: ptr::null(),
            certificate_type: 0,
            ice_transport_policy: 0,
            enable_ice_tcp: false,
            enable_ice_udp_mux: false,
            disable_auto_negotiation: false,
            force_media_transport: false,
            port_range_begin: 0,
            port_range_end: 0,
            mtu: 0,
            max_message_size: 0,
        };
        // The engine copies the configuration before returning.
        unsafe { ffi::rtcCreatePeerConnection(&config) }
    }

    fn set_gathering_state_change_callback(&self, pc: c_int, cb: GatheringStateCallback) -> c_int {
        unsafe { ffi::rtcSetGatheringStateChangeCallback(pc, Some(cb)) }
    }

    fn set_data_channel_callback(&self, pc: c_int, cb: DataChannelCallback) -> c_int {
        unsafe { ffi::rtcSetDataChannelCallback(pc, Some(cb)) }
    }

    fn set_remote_description(&self, pc: c_int, sdp: &str, kind: DescriptionKind) -> c_int {
        let (Some(sdp), Some(kind)) = (c_string(sdp), c_string(kind.as_str())) else {
            return RTC_ERR_INVALID;
        };
        unsafe { ffi::rtcSetRemoteDescription(pc, sdp.as_ptr(), kind.as_ptr()) }
    }

    fn local_description(&self, pc: c_int, buffer: Option<&mut [u8]>) -> c_int {
        match buffer {
            None => unsafe { ffi::rtcGetLocalDescription(pc, ptr::null_mut(), 0) },
            Some(buffer) => {
                let Ok(size) = c_int::try_from(buffer.len()) else {
                    return RTC_ERR_INVALID;
                };
                unsafe { ffi::rtcGetLocalDescription(pc, buffer.as_mut_ptr().cast(), size) }
            }
        }
    }

    fn create_data_channel(&self, pc: c_int, label: &str) -> c_int {
        let Some(label) = c_string(label) else {
            return RTC_ERR_INVALID;
        };
        unsafe { ffi::rtcCreateDataChannel(pc, label.as_ptr()) }
    }

    fn set_open_callback(&self, dc: c_int, cb: OpenCallback) -> c_int {
        unsafe { ffi::rtcSetOpenCallback(dc, Some(cb)) }
    }

    fn set_message_callback(&self, dc: c_int, cb: MessageCallback) -> c_int {
        unsafe { ffi::rtcSetMessageCallback(dc, Some(cb)) }
    }

    fn set_closed_callback(&self, dc: c_int, cb: ClosedCallback) -> c_int {
        unsafe { ffi::rtcSetClosedCallback(dc, Some(cb)) }
    }

    fn send_message(&self, dc: c_int, data: &[u8], size: c_int) -> c_int {
        unsafe { ffi::rtcSendMessage(dc, data.as_ptr().cast(), size) }
    }

    fn close_data_channel(&self, dc: c_int) -> c_int {
        unsafe { ffi::rtcClose(dc) }
    }

    fn delete_data_channel(&self, dc: c_int) -> c_int {
        unsafe { ffi::rtcDelete(dc) }
    }

    fn close_peer_connection(&self, pc: c_int) -> c_int {
        unsafe { ffi::rtcClosePeerConnection(pc) }
    }

    fn delete_peer_connection(&self, pc: c_int) -> c_int {
        unsafe { ffi::rtcDeletePeerConnection(pc) }
    }
}
