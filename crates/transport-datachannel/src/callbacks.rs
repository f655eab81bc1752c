//! Engine callback entry points.
//!
//! These are the only functions that run on the engine's own threads. Each one
//! resolves its handle through the registry and either completes a signal or
//! enqueues a message; none of them blocks or suspends. A handle that is no
//! longer registered means the connection is being torn down, and the event is
//! dropped.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::engine::{Engine, EngineCall, RTC_GATHERING_COMPLETE};
use crate::error::Result;
use crate::handle::{check, Handle};
use crate::registry::{registry, HandleRegistry};
use crate::state::Message;

pub(crate) unsafe extern "C" fn on_gathering_state_change(
    pc: c_int,
    state: c_int,
    _ptr: *mut c_void,
) {
    gathering_state_changed(registry(), Handle(pc), state);
}

pub(crate) unsafe extern "C" fn on_data_channel(pc: c_int, dc: c_int, _ptr: *mut c_void) {
    data_channel_available(registry(), Handle(pc), Handle(dc));
}

pub(crate) unsafe extern "C" fn on_open(id: c_int, _ptr: *mut c_void) {
    channel_opened(registry(), Handle(id));
}

pub(crate) unsafe extern "C" fn on_message(
    id: c_int,
    message: *const c_char,
    size: c_int,
    _ptr: *mut c_void,
) {
    message_received(registry(), Handle(id), message, size);
}

pub(crate) unsafe extern "C" fn on_closed(id: c_int, _ptr: *mut c_void) {
    channel_closed(registry(), Handle(id));
}

/// Arm the connection-level gathering callback.
pub(crate) fn arm_gathering(engine: &dyn Engine, pc: Handle) -> Result<()> {
    check(
        engine.set_gathering_state_change_callback(pc.raw(), on_gathering_state_change),
        EngineCall::SetGatheringStateCallback,
    )?;
    Ok(())
}

/// Arm the answerer-side "remote created a channel" callback.
pub(crate) fn arm_incoming_channel(engine: &dyn Engine, pc: Handle) -> Result<()> {
    check(
        engine.set_data_channel_callback(pc.raw(), on_data_channel),
        EngineCall::SetDataChannelCallback,
    )?;
    Ok(())
}

/// Arm open, message and closed callbacks for a channel.
pub(crate) fn arm_channel(engine: &dyn Engine, dc: Handle) -> Result<()> {
    check(
        engine.set_open_callback(dc.raw(), on_open),
        EngineCall::SetOpenCallback,
    )?;
    check(
        engine.set_message_callback(dc.raw(), on_message),
        EngineCall::SetMessageCallback,
    )?;
    check(
        engine.set_closed_callback(dc.raw(), on_closed),
        EngineCall::SetClosedCallback,
    )?;
    Ok(())
}

pub(crate) fn gathering_state_changed(registry: &HandleRegistry, pc: Handle, state: c_int) {
    if state != RTC_GATHERING_COMPLETE {
        trace!(target: "datachannel", %pc, state, "gathering in progress");
        return;
    }
    let Some(conn) = registry.lookup(pc) else {
        trace!(target: "datachannel", %pc, "gathering event for unregistered handle");
        return;
    };
    if conn.gathering_complete.complete(()) {
        debug!(target: "datachannel", %pc, "address gathering complete");
    }
}

pub(crate) fn data_channel_available(registry: &HandleRegistry, pc: Handle, dc: Handle) {
    let Some(conn) = registry.lookup(pc) else {
        trace!(target: "datachannel", %pc, %dc, "channel offered on unregistered handle");
        return;
    };
    match conn.adopt_channel(dc, || registry.register(dc, Arc::clone(&conn))) {
        Ok(true) => {}
        Ok(false) => {
            debug!(target: "datachannel", %pc, %dc, "connection closing, releasing remote channel");
            release_refused_channel(conn.engine(), dc);
            return;
        }
        Err(err) => {
            warn!(target: "datachannel", %pc, %dc, error = %err, "ignoring remote channel");
            return;
        }
    }
    debug!(target: "datachannel", %pc, %dc, "remote data channel available");
    if let Err(err) = arm_channel(conn.engine(), dc) {
        warn!(target: "datachannel", %dc, error = %err, "failed to arm channel callbacks");
    }
}

/// Close and delete a channel nobody will own.
fn release_refused_channel(engine: &dyn Engine, dc: Handle) {
    let steps = [
        (engine.close_data_channel(dc.raw()), EngineCall::CloseDataChannel),
        (engine.delete_data_channel(dc.raw()), EngineCall::DeleteDataChannel),
    ];
    for (status, call) in steps {
        if let Err(err) = check(status, call) {
            warn!(target: "datachannel", %dc, error = %err, "releasing refused channel failed");
        }
    }
}

pub(crate) fn channel_opened(registry: &HandleRegistry, dc: Handle) {
    let Some(conn) = registry.lookup(dc) else {
        trace!(target: "datachannel", %dc, "open event for unregistered handle");
        return;
    };
    if conn.data_channel_ready.complete(dc) {
        debug!(target: "datachannel", %dc, "data channel open");
    }
}

/// # Safety
///
/// `message` must be null, or point to a NUL-terminated string when `size` is
/// negative, or to at least `size` readable bytes otherwise.
pub(crate) unsafe fn message_received(
    registry: &HandleRegistry,
    dc: Handle,
    message: *const c_char,
    size: c_int,
) {
    if message.is_null() {
        trace!(target: "datachannel", %dc, size, "ignoring empty message notification");
        return;
    }
    let Some(conn) = registry.lookup(dc) else {
        trace!(target: "datachannel", %dc, "message for unregistered handle");
        return;
    };
    let message = if size < 0 {
        let text = CStr::from_ptr(message).to_string_lossy().into_owned();
        Message::Text(text)
    } else {
        let bytes = std::slice::from_raw_parts(message.cast::<u8>(), size as usize);
        Message::Binary(Bytes::copy_from_slice(bytes))
    };
    trace!(target: "datachannel", %dc, len = message.len(), "message received");
    if !conn.push_message(message) {
        trace!(target: "datachannel", %dc, "inbound queue closed, message dropped");
    }
}

pub(crate) fn channel_closed(registry: &HandleRegistry, dc: Handle) {
    let Some(conn) = registry.lookup(dc) else {
        trace!(target: "datachannel", %dc, "close event for unregistered handle");
        return;
    };
    if conn.close_incoming() {
        debug!(target: "datachannel", %dc, "data channel closed by engine");
    }
}
