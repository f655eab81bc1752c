use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::c_int;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::Stream;
use tracing::{debug, trace, warn};

use crate::callbacks;
use crate::config::PeerConfig;
use crate::engine::{DescriptionKind, Engine, EngineCall, TEXT_MESSAGE_SIZE};
use crate::error::{PeerError, Result};
use crate::handle::{check, check_handle, Handle};
use crate::registry::registry;
use crate::state::{ConnectionState, Message};

/// Lifecycle of a [`DataChannelPeer`]. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Created,
    Offering,
    Answering,
    GatheringAddresses,
    DescriptionReady,
    AwaitingRemote,
    AwaitingChannel,
    Open,
    Closed,
}

/// A single-use peer connection carrying one data channel.
///
/// Offerer: [`offer`](Self::offer), hand the text to the remote peer,
/// [`accept_answer`](Self::accept_answer) with its reply, then
/// [`await_data_channel`](Self::await_data_channel).
///
/// Answerer: [`accept_offer`](Self::accept_offer), hand the answer back, then
/// [`await_data_channel`](Self::await_data_channel).
///
/// How the offer and answer text travel between peers is up to the caller.
/// Once closed, an instance cannot be reused.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the connection and a data channel labelled `label`, wait for
    /// address gathering, and return the local offer.
    async fn offer(&mut self, label: &str) -> Result<String>;

    /// Apply a remote offer, wait for address gathering, and return the
    /// local answer.
    async fn accept_offer(&mut self, offer_sdp: &str) -> Result<String>;

    /// Apply the remote answer (offerer only). Does not suspend.
    fn accept_answer(&mut self, answer_sdp: &str) -> Result<()>;

    /// Wait until the data channel is open.
    async fn await_data_channel(&mut self) -> Result<()>;

    /// Send a text message over the open channel.
    fn send(&self, text: &str) -> Result<()>;

    /// Send a binary message over the open channel.
    fn send_binary(&self, data: &[u8]) -> Result<()>;

    /// Inbound messages; ends once the channel closes and the backlog drains.
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = Message> + Send>>;

    /// Next inbound message, or `None` once the channel has closed and drained.
    async fn recv(&self) -> Option<Message>;

    /// Release the channel and the connection. Calling it again does nothing.
    fn close(&mut self);

    fn state(&self) -> PeerState;
}

/// [`PeerConnection`] driving an [`Engine`] through the process-wide handle
/// registry.
pub struct DataChannelPeer {
    engine: Arc<dyn Engine>,
    config: PeerConfig,
    shared: Arc<ConnectionState>,
    incoming: async_channel::Receiver<Message>,
    state: PeerState,
    connection: Option<Handle>,
}

impl DataChannelPeer {
    pub fn new(engine: Arc<dyn Engine>, config: PeerConfig) -> Self {
        engine.preload();
        let shared = Arc::new(ConnectionState::new(Arc::clone(&engine)));
        let incoming = shared.incoming();
        Self {
            engine,
            config,
            shared,
            incoming,
            state: PeerState::Created,
            connection: None,
        }
    }

    /// A peer backed by the system libdatachannel.
    #[cfg(feature = "native")]
    pub fn native(config: PeerConfig) -> Self {
        Self::new(Arc::new(crate::native::NativeEngine::new()), config)
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Current `(connection, channel)` engine handles.
    pub fn handles(&self) -> (Option<Handle>, Option<Handle>) {
        (self.connection, self.shared.channel())
    }

    fn expect_state(&self, operation: &'static str, expected: PeerState) -> Result<()> {
        if self.state != expected {
            return Err(PeerError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: PeerState) {
        debug!(
            target: "datachannel",
            connection = ?self.connection,
            from = ?self.state,
            to = ?next,
            "peer state transition"
        );
        self.state = next;
    }

    fn create_connection(&mut self) -> Result<Handle> {
        let pc = check_handle(
            self.engine.create_peer_connection(&self.config.ice_servers),
            EngineCall::CreatePeerConnection,
        )?;
        self.connection = Some(pc);
        registry().register(pc, Arc::clone(&self.shared))?;
        callbacks::arm_gathering(self.engine.as_ref(), pc)?;
        debug!(
            target: "datachannel",
            %pc,
            ice_servers = self.config.ice_servers.len(),
            "peer connection created"
        );
        Ok(pc)
    }

    fn connection_for(&self, operation: &'static str) -> Result<Handle> {
        self.connection.ok_or(PeerError::InvalidState {
            operation,
            state: self.state,
        })
    }

    fn open_channel(&self, operation: &'static str) -> Result<Handle> {
        self.expect_state(operation, PeerState::Open)?;
        self.shared.channel().ok_or(PeerError::InvalidState {
            operation,
            state: self.state,
        })
    }

    async fn await_local_description(&mut self) -> Result<String> {
        let pc = self.connection_for("local_description")?;
        self.transition(PeerState::GatheringAddresses);
        self.shared.gathering_complete.wait().await;

        let size = check(
            self.engine.local_description(pc.raw(), None),
            EngineCall::GetLocalDescription,
        )?;
        let mut buffer = vec![0u8; size as usize];
        let written = check(
            self.engine.local_description(pc.raw(), Some(&mut buffer)),
            EngineCall::GetLocalDescription,
        )?;
        buffer.truncate(written as usize);
        let description = CStr::from_bytes_until_nul(&buffer)
            .map_err(|_| PeerError::InvalidDescription)?
            .to_str()
            .map_err(|_| PeerError::InvalidDescription)?
            .to_owned();

        self.transition(PeerState::DescriptionReady);
        Ok(description)
    }

    fn report_teardown(status: c_int, call: EngineCall, handle: Handle) {
        if let Err(err) = check(status, call) {
            warn!(target: "datachannel", %handle, error = %err, "teardown call failed");
        }
    }
}

#[async_trait]
impl PeerConnection for DataChannelPeer {
    async fn offer(&mut self, label: &str) -> Result<String> {
        self.expect_state("offer", PeerState::Created)?;
        self.transition(PeerState::Offering);
        let pc = self.create_connection()?;

        let dc = check_handle(
            self.engine.create_data_channel(pc.raw(), label),
            EngineCall::CreateDataChannel,
        )?;
        self.shared.set_channel(dc);
        registry().register(dc, Arc::clone(&self.shared))?;
        callbacks::arm_channel(self.engine.as_ref(), dc)?;
        debug!(target: "datachannel", %pc, %dc, label, "data channel created");

        let offer = self.await_local_description().await?;
        self.transition(PeerState::AwaitingRemote);
        Ok(offer)
    }

    async fn accept_offer(&mut self, offer_sdp: &str) -> Result<String> {
        self.expect_state("accept_offer", PeerState::Created)?;
        self.transition(PeerState::Answering);
        let pc = self.create_connection()?;

        callbacks::arm_incoming_channel(self.engine.as_ref(), pc)?;
        check(
            self.engine
                .set_remote_description(pc.raw(), offer_sdp, DescriptionKind::Offer),
            EngineCall::SetRemoteDescription,
        )?;

        let answer = self.await_local_description().await?;
        self.transition(PeerState::AwaitingChannel);
        Ok(answer)
    }

    fn accept_answer(&mut self, answer_sdp: &str) -> Result<()> {
        self.expect_state("accept_answer", PeerState::AwaitingRemote)?;
        let pc = self.connection_for("accept_answer")?;
        check(
            self.engine
                .set_remote_description(pc.raw(), answer_sdp, DescriptionKind::Answer),
            EngineCall::SetRemoteDescription,
        )?;
        self.transition(PeerState::AwaitingChannel);
        Ok(())
    }

    async fn await_data_channel(&mut self) -> Result<()> {
        self.expect_state("await_data_channel", PeerState::AwaitingChannel)?;
        let dc = self.shared.data_channel_ready.wait().await;
        self.shared.set_channel(dc);
        self.transition(PeerState::Open);
        Ok(())
    }

    fn send(&self, text: &str) -> Result<()> {
        let dc = self.open_channel("send")?;
        let payload = CString::new(text).map_err(|_| PeerError::InteriorNul)?;
        check(
            self.engine
                .send_message(dc.raw(), payload.as_bytes_with_nul(), TEXT_MESSAGE_SIZE),
            EngineCall::SendMessage,
        )?;
        trace!(target: "datachannel", %dc, len = text.len(), "text sent");
        Ok(())
    }

    fn send_binary(&self, data: &[u8]) -> Result<()> {
        let dc = self.open_channel("send_binary")?;
        let size = c_int::try_from(data.len()).map_err(|_| PeerError::PayloadTooLarge(data.len()))?;
        check(
            self.engine.send_message(dc.raw(), data, size),
            EngineCall::SendMessage,
        )?;
        trace!(target: "datachannel", %dc, len = data.len(), "binary sent");
        Ok(())
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = Message> + Send>> {
        let receiver = self.incoming.clone();
        Box::pin(stream! {
            while let Ok(message) = receiver.recv().await {
                yield message;
            }
        })
    }

    async fn recv(&self) -> Option<Message> {
        self.incoming.recv().await.ok()
    }

    fn close(&mut self) {
        if self.state == PeerState::Closed {
            return;
        }
        self.transition(PeerState::Closed);
        self.shared.close_incoming();

        // From here on the shim releases any channel the engine announces.
        if let Some(dc) = self.shared.retire_channel() {
            Self::report_teardown(
                self.engine.close_data_channel(dc.raw()),
                EngineCall::CloseDataChannel,
                dc,
            );
            registry().unregister_owned(dc, &self.shared);
            Self::report_teardown(
                self.engine.delete_data_channel(dc.raw()),
                EngineCall::DeleteDataChannel,
                dc,
            );
        }
        if let Some(pc) = self.connection.take() {
            Self::report_teardown(
                self.engine.close_peer_connection(pc.raw()),
                EngineCall::ClosePeerConnection,
                pc,
            );
            registry().unregister_owned(pc, &self.shared);
            Self::report_teardown(
                self.engine.delete_peer_connection(pc.raw()),
                EngineCall::DeletePeerConnection,
                pc,
            );
        }
    }

    fn state(&self) -> PeerState {
        self.state
    }
}

impl Drop for DataChannelPeer {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DataChannelPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelPeer")
            .field("state", &self.state)
            .field("connection", &self.connection)
            .field("shared", &self.shared)
            .finish()
    }
}
