use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::engine::Engine;
use crate::error::Result;
use crate::handle::Handle;

/// A single message received over the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message.
    Text(String),
    /// Raw binary message.
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }
}

/// Single-shot completion signal: resolved at most once, awaited without
/// blocking the awaiting thread.
pub struct Completion<T> {
    slot: watch::Sender<Option<T>>,
}

impl<T> Completion<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Resolve with `value`. Returns false (and keeps the first value) when
    /// already resolved.
    pub fn complete(&self, value: T) -> bool {
        self.slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(value);
            true
        })
    }

    pub fn is_complete(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn peek(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            let resolved = rx.borrow_and_update().clone();
            if let Some(value) = resolved {
                return value;
            }
            // `self` owns the sender, so `changed` cannot report a closed channel.
            let _ = rx.changed().await;
        }
    }
}

impl<T> Default for Completion<T>
where
    T: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct ChannelSlot {
    handle: Option<Handle>,
    retired: bool,
}

/// Per-connection rendezvous between the callback shim and the facade.
pub struct ConnectionState {
    engine: Arc<dyn Engine>,
    pub gathering_complete: Completion<()>,
    pub data_channel_ready: Completion<Handle>,
    incoming_tx: async_channel::Sender<Message>,
    incoming_rx: async_channel::Receiver<Message>,
    channel: Mutex<ChannelSlot>,
}

impl ConnectionState {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        let (incoming_tx, incoming_rx) = async_channel::unbounded();
        Self {
            engine,
            gathering_complete: Completion::new(),
            data_channel_ready: Completion::new(),
            incoming_tx,
            incoming_rx,
            channel: Mutex::new(ChannelSlot::default()),
        }
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Non-blocking enqueue. Returns false when the queue is already closed.
    pub fn push_message(&self, message: Message) -> bool {
        self.incoming_tx.try_send(message).is_ok()
    }

    /// Close the inbound queue. Buffered messages stay readable. Returns true
    /// only for the call that actually closed it.
    pub fn close_incoming(&self) -> bool {
        self.incoming_tx.close()
    }

    pub fn is_incoming_closed(&self) -> bool {
        self.incoming_tx.is_closed()
    }

    pub fn incoming(&self) -> async_channel::Receiver<Message> {
        self.incoming_rx.clone()
    }

    /// Record the channel handle this connection currently owns. Returns
    /// false once the slot has been retired.
    pub fn set_channel(&self, handle: Handle) -> bool {
        let mut slot = self.channel.lock();
        if slot.retired {
            return false;
        }
        slot.handle = Some(handle);
        true
    }

    /// Take ownership of a channel announced by the engine. `register` runs
    /// under the slot lock, so adoption and [`retire_channel`] never
    /// interleave. Returns `Ok(false)` without calling `register` once the
    /// slot is retired.
    ///
    /// [`retire_channel`]: Self::retire_channel
    pub fn adopt_channel(
        &self,
        handle: Handle,
        register: impl FnOnce() -> Result<()>,
    ) -> Result<bool> {
        let mut slot = self.channel.lock();
        if slot.retired {
            return Ok(false);
        }
        register()?;
        slot.handle = Some(handle);
        Ok(true)
    }

    pub fn channel(&self) -> Option<Handle> {
        self.channel.lock().handle
    }

    /// Take the current channel handle and refuse any later one.
    pub fn retire_channel(&self) -> Option<Handle> {
        let mut slot = self.channel.lock();
        slot.retired = true;
        slot.handle.take()
    }

    pub fn is_channel_retired(&self) -> bool {
        self.channel.lock().retired
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("gathering_complete", &self.gathering_complete.is_complete())
            .field("data_channel_ready", &self.data_channel_ready.peek())
            .field("incoming_closed", &self.is_incoming_closed())
            .field("queued", &self.incoming_rx.len())
            .field("channel", &self.channel())
            .finish()
    }
}
