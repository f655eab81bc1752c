//! In-process engine that links two connections without any networking.
//!
//! Events are delivered from a dedicated worker thread through the same
//! callback function pointers a native engine would call, in the order the
//! engine produced them. Handles come from one process-wide counter, so
//! connections from different `LoopbackEngine` values never collide in the
//! handle registry.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::engine::{
    ClosedCallback, DataChannelCallback, DescriptionKind, Engine, EngineCall,
    GatheringStateCallback, MessageCallback, OpenCallback, RTC_GATHERING_COMPLETE,
    RTC_GATHERING_INPROGRESS,
};
use crate::handle::{RTC_ERR_FAILURE, RTC_ERR_INVALID, RTC_ERR_NOT_AVAIL, RTC_ERR_SUCCESS, RTC_ERR_TOO_SMALL};

const LOOPBACK_ATTRIBUTE: &str = "a=loopback-pc:";

static NEXT_HANDLE: AtomicI32 = AtomicI32::new(1);

fn allocate_handle() -> c_int {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

type Task = Box<dyn FnOnce() + Send>;

/// Counters for calls that create or release engine resources.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connections_created: usize,
    pub connections_deleted: usize,
    pub channels_created: usize,
    pub channels_deleted: usize,
    pub messages_sent: usize,
    pub preloads: usize,
    pub cleanups: usize,
}

#[derive(Default)]
struct Connection {
    gathering_cb: Option<GatheringStateCallback>,
    data_channel_cb: Option<DataChannelCallback>,
    local_description: Option<String>,
    remote: Option<c_int>,
    channel: Option<c_int>,
    closed: bool,
}

struct Channel {
    label: String,
    open_cb: Option<OpenCallback>,
    message_cb: Option<MessageCallback>,
    closed_cb: Option<ClosedCallback>,
    remote: Option<c_int>,
    open: bool,
    closing: bool,
    closed: bool,
}

impl Channel {
    fn new(label: String) -> Self {
        Self {
            label,
            open_cb: None,
            message_cb: None,
            closed_cb: None,
            remote: None,
            open: false,
            closing: false,
            closed: false,
        }
    }
}

enum Payload {
    Text(CString),
    Binary(Vec<u8>),
}

#[derive(Default)]
struct Tables {
    connections: HashMap<c_int, Connection>,
    channels: HashMap<c_int, Channel>,
    failures: HashMap<EngineCall, c_int>,
    stats: LoopbackStats,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
}

impl Shared {
    fn fire_gathering(&self, pc: c_int, state: c_int) {
        let cb = self
            .tables
            .lock()
            .connections
            .get(&pc)
            .and_then(|conn| conn.gathering_cb);
        if let Some(cb) = cb {
            unsafe { cb(pc, state, ptr::null_mut()) };
        }
    }

    fn fire_open(&self, dc: c_int) {
        let cb = {
            let mut tables = self.tables.lock();
            let Some(channel) = tables.channels.get_mut(&dc) else {
                return;
            };
            if channel.closing || channel.closed {
                return;
            }
            channel.open = true;
            channel.open_cb
        };
        if let Some(cb) = cb {
            unsafe { cb(dc, ptr::null_mut()) };
        }
    }

    fn fire_message(&self, dc: c_int, payload: Payload) {
        let cb = {
            let tables = self.tables.lock();
            match tables.channels.get(&dc) {
                Some(channel) if !channel.closed => channel.message_cb,
                _ => None,
            }
        };
        let Some(cb) = cb else {
            trace!(target: "datachannel.loopback", dc, "message target gone");
            return;
        };
        match payload {
            Payload::Text(text) => unsafe { cb(dc, text.as_ptr(), -1, ptr::null_mut()) },
            Payload::Binary(bytes) => unsafe {
                cb(
                    dc,
                    bytes.as_ptr().cast::<c_char>(),
                    bytes.len() as c_int,
                    ptr::null_mut(),
                )
            },
        }
    }

    fn fire_closed(&self, dc: c_int) {
        let cb = {
            let mut tables = self.tables.lock();
            let Some(channel) = tables.channels.get_mut(&dc) else {
                return;
            };
            if channel.closed {
                return;
            }
            channel.closed = true;
            channel.open = false;
            channel.closed_cb
        };
        if let Some(cb) = cb {
            unsafe { cb(dc, ptr::null_mut()) };
        }
    }

    /// Wire the answerer's channel to the offerer's and announce both ends.
    fn connect(&self, offerer: c_int, answerer: c_int) {
        let (offer_dc, answer_dc, announce) = {
            let mut guard = self.tables.lock();
            let tables = &mut *guard;
            let Some(offer_dc) = tables.connections.get(&offerer).and_then(|c| c.channel) else {
                return;
            };
            let Some(label) = tables.channels.get(&offer_dc).map(|c| c.label.clone()) else {
                return;
            };
            let Some(conn) = tables.connections.get_mut(&answerer) else {
                return;
            };
            let answer_dc = allocate_handle();
            conn.channel = Some(answer_dc);
            let announce = conn.data_channel_cb;

            let mut channel = Channel::new(label);
            channel.remote = Some(offer_dc);
            tables.channels.insert(answer_dc, channel);
            if let Some(offered) = tables.channels.get_mut(&offer_dc) {
                offered.remote = Some(answer_dc);
            }
            tables.stats.channels_created += 1;
            (offer_dc, answer_dc, announce)
        };
        debug!(
            target: "datachannel.loopback",
            offerer, answerer, offer_dc, answer_dc, "loopback link established"
        );
        if let Some(cb) = announce {
            unsafe { cb(answerer, answer_dc, ptr::null_mut()) };
        }
        self.fire_open(offer_dc);
        self.fire_open(answer_dc);
    }
}

/// An [`Engine`] that connects peers living in the same process.
pub struct LoopbackEngine {
    shared: Arc<Shared>,
    tasks: Sender<Task>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    pub fn new() -> Self {
        let (tasks, queue) = unbounded::<Task>();
        thread::spawn(move || {
            while let Ok(task) = queue.recv() {
                task();
            }
        });
        Self {
            shared: Arc::new(Shared::default()),
            tasks,
        }
    }

    /// Make the next invocation of `call` return `code`.
    pub fn fail(&self, call: EngineCall, code: c_int) {
        self.shared.tables.lock().failures.insert(call, code);
    }

    pub fn stats(&self) -> LoopbackStats {
        self.shared.tables.lock().stats
    }

    /// Connections and channels created but not yet deleted.
    pub fn live_handles(&self) -> usize {
        let tables = self.shared.tables.lock();
        tables.connections.len() + tables.channels.len()
    }

    fn post(&self, task: impl FnOnce(&Shared) + Send + 'static) {
        let shared = Arc::clone(&self.shared);
        // The worker only stops once every sender is gone.
        let _ = self.tasks.send(Box::new(move || task(&shared)));
    }

    fn injected_failure(&self, tables: &mut Tables, call: EngineCall) -> Option<c_int> {
        let code = tables.failures.remove(&call)?;
        debug!(target: "datachannel.loopback", %call, code, "injected failure");
        Some(code)
    }

    fn schedule_gathering(&self, pc: c_int) {
        self.post(move |shared| {
            shared.fire_gathering(pc, RTC_GATHERING_INPROGRESS);
            shared.fire_gathering(pc, RTC_GATHERING_COMPLETE);
        });
    }

    fn close_channel(&self, tables: &mut Tables, dc: c_int) -> c_int {
        let Some(channel) = tables.channels.get_mut(&dc) else {
            return RTC_ERR_INVALID;
        };
        if channel.closing {
            return RTC_ERR_SUCCESS;
        }
        channel.closing = true;
        let remote = channel.remote;
        self.post(move |shared| {
            shared.fire_closed(dc);
            if let Some(remote) = remote {
                shared.fire_closed(remote);
            }
        });
        RTC_ERR_SUCCESS
    }

    fn with_channel(&self, dc: c_int, apply: impl FnOnce(&mut Channel)) -> c_int {
        match self.shared.tables.lock().channels.get_mut(&dc) {
            Some(channel) => {
                apply(channel);
                RTC_ERR_SUCCESS
            }
            None => RTC_ERR_INVALID,
        }
    }
}

fn describe(pc: c_int, kind: DescriptionKind) -> String {
    let setup = match kind {
        DescriptionKind::Offer => "actpass",
        DescriptionKind::Answer => "active",
    };
    let port = 40_000 + (pc.unsigned_abs() % 20_000);
    format!(
        "v=0\r\n\
         o=- {pc} 0 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=group:BUNDLE 0\r\n\
         a=msid-semantic:WMS *\r\n\
         a=setup:{setup}\r\n\
         a=ice-ufrag:lb{pc}\r\n\
         a=ice-pwd:loopback-{pc}\r\n\
         m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
         c=IN IP4 127.0.0.1\r\n\
         a=mid:0\r\n\
         a=sctp-port:5000\r\n\
         {LOOPBACK_ATTRIBUTE}{pc}\r\n\
         a=candidate:1 1 UDP 2122317823 127.0.0.1 {port} typ host\r\n\
         a=end-of-candidates\r\n"
    )
}

fn linked_connection(sdp: &str) -> Option<c_int> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(LOOPBACK_ATTRIBUTE))
        .and_then(|value| value.trim().parse().ok())
}

impl Engine for LoopbackEngine {
    fn preload(&self) {
        self.shared.tables.lock().stats.preloads += 1;
    }

    fn cleanup(&self) {
        let mut tables = self.shared.tables.lock();
        tables.stats.cleanups += 1;
        debug!(
            target: "datachannel.loopback",
            live = tables.connections.len() + tables.channels.len(),
            "cleanup requested"
        );
    }

    fn create_peer_connection(&self, ice_servers: &[String]) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::CreatePeerConnection) {
            return code;
        }
        let pc = allocate_handle();
        tables.connections.insert(pc, Connection::default());
        tables.stats.connections_created += 1;
        debug!(
            target: "datachannel.loopback",
            pc,
            ice_servers = ice_servers.len(),
            "connection created"
        );
        pc
    }

    fn set_gathering_state_change_callback(&self, pc: c_int, cb: GatheringStateCallback) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::SetGatheringStateCallback) {
            return code;
        }
        match tables.connections.get_mut(&pc) {
            Some(conn) => {
                conn.gathering_cb = Some(cb);
                RTC_ERR_SUCCESS
            }
            None => RTC_ERR_INVALID,
        }
    }

    fn set_data_channel_callback(&self, pc: c_int, cb: DataChannelCallback) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::SetDataChannelCallback) {
            return code;
        }
        match tables.connections.get_mut(&pc) {
            Some(conn) => {
                conn.data_channel_cb = Some(cb);
                RTC_ERR_SUCCESS
            }
            None => RTC_ERR_INVALID,
        }
    }

    fn set_remote_description(&self, pc: c_int, sdp: &str, kind: DescriptionKind) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::SetRemoteDescription) {
            return code;
        }
        let Some(peer) = linked_connection(sdp) else {
            return RTC_ERR_INVALID;
        };
        if peer == pc || !tables.connections.contains_key(&peer) {
            return RTC_ERR_INVALID;
        }
        let peer_remote = tables.connections.get(&peer).and_then(|c| c.remote);
        let Some(conn) = tables.connections.get_mut(&pc) else {
            return RTC_ERR_INVALID;
        };
        if conn.closed || conn.remote.is_some() {
            return RTC_ERR_FAILURE;
        }
        match kind {
            DescriptionKind::Offer => {
                if conn.local_description.is_some() {
                    return RTC_ERR_FAILURE;
                }
                conn.remote = Some(peer);
                conn.local_description = Some(describe(pc, DescriptionKind::Answer));
                drop(tables);
                self.schedule_gathering(pc);
            }
            DescriptionKind::Answer => {
                if conn.channel.is_none() || peer_remote != Some(pc) {
                    return RTC_ERR_FAILURE;
                }
                conn.remote = Some(peer);
                drop(tables);
                self.post(move |shared| shared.connect(pc, peer));
            }
        }
        trace!(target: "datachannel.loopback", pc, peer, kind = kind.as_str(), "remote description applied");
        RTC_ERR_SUCCESS
    }

    fn local_description(&self, pc: c_int, buffer: Option<&mut [u8]>) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::GetLocalDescription) {
            return code;
        }
        let Some(conn) = tables.connections.get(&pc) else {
            return RTC_ERR_INVALID;
        };
        let Some(sdp) = conn.local_description.as_deref() else {
            return RTC_ERR_NOT_AVAIL;
        };
        let required = sdp.len() + 1;
        let Some(buffer) = buffer else {
            return required as c_int;
        };
        if buffer.len() < required {
            return RTC_ERR_TOO_SMALL;
        }
        buffer[..sdp.len()].copy_from_slice(sdp.as_bytes());
        buffer[sdp.len()] = 0;
        required as c_int
    }

    fn create_data_channel(&self, pc: c_int, label: &str) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::CreateDataChannel) {
            return code;
        }
        let Some(conn) = tables.connections.get_mut(&pc) else {
            return RTC_ERR_INVALID;
        };
        if conn.closed || conn.channel.is_some() || conn.remote.is_some() {
            return RTC_ERR_FAILURE;
        }
        let dc = allocate_handle();
        conn.channel = Some(dc);
        conn.local_description = Some(describe(pc, DescriptionKind::Offer));
        tables.channels.insert(dc, Channel::new(label.to_string()));
        tables.stats.channels_created += 1;
        drop(tables);
        debug!(target: "datachannel.loopback", pc, dc, label, "channel created");
        self.schedule_gathering(pc);
        dc
    }

    fn set_open_callback(&self, dc: c_int, cb: OpenCallback) -> c_int {
        self.with_channel(dc, |channel| channel.open_cb = Some(cb))
    }

    fn set_message_callback(&self, dc: c_int, cb: MessageCallback) -> c_int {
        self.with_channel(dc, |channel| channel.message_cb = Some(cb))
    }

    fn set_closed_callback(&self, dc: c_int, cb: ClosedCallback) -> c_int {
        self.with_channel(dc, |channel| channel.closed_cb = Some(cb))
    }

    fn send_message(&self, dc: c_int, data: &[u8], size: c_int) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::SendMessage) {
            return code;
        }
        let Some(channel) = tables.channels.get(&dc) else {
            return RTC_ERR_INVALID;
        };
        if !channel.open || channel.closing || channel.closed {
            return RTC_ERR_FAILURE;
        }
        let Some(remote) = channel.remote else {
            return RTC_ERR_FAILURE;
        };
        let payload = if size < 0 {
            match CStr::from_bytes_until_nul(data) {
                Ok(text) => Payload::Text(text.to_owned()),
                Err(_) => return RTC_ERR_INVALID,
            }
        } else {
            match data.get(..size as usize) {
                Some(bytes) => Payload::Binary(bytes.to_vec()),
                None => return RTC_ERR_INVALID,
            }
        };
        tables.stats.messages_sent += 1;
        drop(tables);
        self.post(move |shared| shared.fire_message(remote, payload));
        RTC_ERR_SUCCESS
    }

    fn close_data_channel(&self, dc: c_int) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::CloseDataChannel) {
            return code;
        }
        self.close_channel(&mut tables, dc)
    }

    fn delete_data_channel(&self, dc: c_int) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::DeleteDataChannel) {
            return code;
        }
        if tables.channels.remove(&dc).is_none() {
            return RTC_ERR_INVALID;
        }
        for conn in tables.connections.values_mut() {
            if conn.channel == Some(dc) {
                conn.channel = None;
            }
        }
        tables.stats.channels_deleted += 1;
        debug!(target: "datachannel.loopback", dc, "channel deleted");
        RTC_ERR_SUCCESS
    }

    fn close_peer_connection(&self, pc: c_int) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::ClosePeerConnection) {
            return code;
        }
        let Some(conn) = tables.connections.get_mut(&pc) else {
            return RTC_ERR_INVALID;
        };
        if conn.closed {
            return RTC_ERR_SUCCESS;
        }
        conn.closed = true;
        if let Some(dc) = conn.channel {
            self.close_channel(&mut tables, dc);
        }
        RTC_ERR_SUCCESS
    }

    fn delete_peer_connection(&self, pc: c_int) -> c_int {
        let mut tables = self.shared.tables.lock();
        if let Some(code) = self.injected_failure(&mut tables, EngineCall::DeletePeerConnection) {
            return code;
        }
        if tables.connections.remove(&pc).is_none() {
            return RTC_ERR_INVALID;
        }
        tables.stats.connections_deleted += 1;
        debug!(target: "datachannel.loopback", pc, "connection deleted");
        RTC_ERR_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_round_trips_the_connection_handle() {
        let sdp = describe(42, DescriptionKind::Offer);
        assert!(sdp.starts_with("v=0\r\n"));
        assert_eq!(linked_connection(&sdp), Some(42));
        assert_eq!(linked_connection("v=0\r\ns=-\r\n"), None);
    }

    #[test]
    fn local_description_uses_size_then_fill() {
        let engine = LoopbackEngine::new();
        let pc = engine.create_peer_connection(&[]);
        assert_eq!(engine.local_description(pc, None), RTC_ERR_NOT_AVAIL);

        let dc = engine.create_data_channel(pc, "data");
        assert!(dc > 0);
        let size = engine.local_description(pc, None);
        assert!(size > 0);

        let mut short = vec![0u8; size as usize - 1];
        assert_eq!(engine.local_description(pc, Some(&mut short)), RTC_ERR_TOO_SMALL);

        let mut buffer = vec![0u8; size as usize];
        assert_eq!(engine.local_description(pc, Some(&mut buffer)), size);
        assert_eq!(buffer.last(), Some(&0));
        let text = CStr::from_bytes_until_nul(&buffer).unwrap().to_str().unwrap();
        assert_eq!(linked_connection(text), Some(pc));
    }

    #[test]
    fn injected_failure_fires_once() {
        let engine = LoopbackEngine::new();
        engine.fail(EngineCall::CreatePeerConnection, RTC_ERR_FAILURE);
        assert_eq!(engine.create_peer_connection(&[]), RTC_ERR_FAILURE);
        assert!(engine.create_peer_connection(&[]) > 0);
        assert_eq!(engine.stats().connections_created, 1);
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let engine = LoopbackEngine::new();
        assert_eq!(engine.create_data_channel(-7, "x"), RTC_ERR_INVALID);
        assert_eq!(engine.send_message(-7, b"hi\0", -1), RTC_ERR_INVALID);
        assert_eq!(engine.delete_data_channel(-7), RTC_ERR_INVALID);
        assert_eq!(engine.delete_peer_connection(-7), RTC_ERR_INVALID);
    }

    #[test]
    fn garbage_remote_description_is_invalid() {
        let engine = LoopbackEngine::new();
        let pc = engine.create_peer_connection(&[]);
        assert_eq!(
            engine.set_remote_description(pc, "not an sdp", DescriptionKind::Offer),
            RTC_ERR_INVALID
        );
    }

    #[test]
    fn preload_and_cleanup_are_counted() {
        let engine = LoopbackEngine::new();
        engine.preload();
        engine.preload();
        engine.cleanup();
        let stats = engine.stats();
        assert_eq!((stats.preloads, stats.cleanups), (2, 1));
    }

    #[test]
    fn sending_before_open_fails() {
        let engine = LoopbackEngine::new();
        let pc = engine.create_peer_connection(&[]);
        let dc = engine.create_data_channel(pc, "data");
        assert_eq!(engine.send_message(dc, b"hi\0", -1), RTC_ERR_FAILURE);
    }
}
