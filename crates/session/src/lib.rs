//! Multiplexed, flow-controlled stream sessions with RPC call correlation.
//!
//! A [`Session`] owns a single ordered byte transport and multiplexes many
//! concurrent [`StreamHandle`]s over it, each independently flow
//! controlled with credit windows. A [`CallClient`] layers
//! request/response correlation on top of one stream, resolving every
//! pending call exactly once.
//!
//! The core performs no reconnection, retry, or logging policy: failures
//! are reported with their kind and originating stream or call id, and
//! lifecycle notifications are published on a broadcast channel for an
//! external observer.
//!
//! # Example
//!
//! ```no_run
//! use weft_session::{Session, SessionConfig, SessionRole};
//!
//! async fn example(transport: tokio::net::TcpStream) -> weft_session::Result<()> {
//!     let session = Session::spawn(transport, SessionRole::Client, SessionConfig::default());
//!     let mut stream = session.open_stream().await?;
//!     stream.write(bytes::Bytes::from_static(b"hello")).await?;
//!     stream.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod events;
mod flow;
mod rpc;
mod session;
mod stream;

pub use config::SessionConfig;
pub use error::{Error, ProtocolViolation, ResetReason, Result};
pub use events::SessionEvent;
pub use rpc::{CallClient, CallHandler, CallResponder};
pub use session::{Session, SessionRole, SessionState};
pub use stream::{StreamHandle, StreamReader, StreamState, StreamWriter};

pub use bytes::Bytes;
