//! Awaitable single data-channel peer connections.
//!
//! The underlying engine (libdatachannel, or the in-process [`loopback`]
//! engine) hands out integer handles and reports progress through global
//! callbacks on its own threads. This crate routes those callbacks back to the
//! connection that owns the handle and exposes the handshake as a handful of
//! async steps on [`DataChannelPeer`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use transport_datachannel::{DataChannelPeer, LoopbackEngine, PeerConfig, PeerConnection};
//!
//! # async fn demo() -> transport_datachannel::Result<()> {
//! let engine = Arc::new(LoopbackEngine::new());
//! let mut alice = DataChannelPeer::new(engine.clone(), PeerConfig::localhost());
//! let mut bob = DataChannelPeer::new(engine, PeerConfig::localhost());
//!
//! let offer = alice.offer("data").await?;
//! let answer = bob.accept_offer(&offer).await?;
//! alice.accept_answer(&answer)?;
//! alice.await_data_channel().await?;
//! bob.await_data_channel().await?;
//!
//! alice.send("hi")?;
//! let message = bob.recv().await;
//! # let _ = message;
//! # Ok(())
//! # }
//! ```

mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod loopback;
#[cfg(feature = "native")]
pub mod native;
pub mod peer;
pub mod registry;
pub mod state;

pub use config::{PeerConfig, DEFAULT_ICE_SERVERS, DEFAULT_LABEL};
pub use engine::{DescriptionKind, Engine, EngineCall};
pub use error::{PeerError, Result};
pub use handle::Handle;
pub use loopback::{LoopbackEngine, LoopbackStats};
pub use peer::{DataChannelPeer, PeerConnection, PeerState};
pub use registry::{registry, HandleRegistry};
pub use state::Message;
