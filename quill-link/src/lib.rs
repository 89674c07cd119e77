//! # quill-link - WebSocket plumbing for Quill completions
//!
//! Session-bound request/response over JSON text frames, with a
//! server-side transport and a client-side connection registry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   predict / response   ┌─────────────┐   ConnectionService   ┌─────────────┐
//! │ Connection  │ ◄────────────────────► │  Transport  │ ────────────────────► │     Hub     │
//! │ (editor)    │   sessionInfo, "h"     │  (relay)    │                       │ (upstream)  │
//! └─────────────┘                        └─────────────┘                       └──────┬──────┘
//!                                                                                     │
//!                                                                               Connection ×N
//!                                                                              (one per session)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - JSON wire codec (`predict`, `predictResponse`, `sessionInfo`)
//! - [`connection`] - client socket with correlation, timeouts and idle close
//! - [`pending`] - exactly-once settlement table for in-flight requests
//! - [`hub`] - keyed, de-duplicated connection registry
//! - [`server`] - accepting transport with heartbeats
//! - [`config`] - connection settings and environment lookup

pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod pending;
pub mod protocol;
pub mod server;

// Re-exports for convenience
pub use config::{validate_url, ConfigError, LinkConfig};
pub use connection::{CloseHandler, CloseReason, Connection, ErrorHandler};
pub use error::LinkError;
pub use hub::{ConnectionService, Hub};
pub use pending::PendingRequests;
pub use protocol::{
    Frame, Message, PredictRequest, PredictResponse, ProtocolError, Session, SessionInfo,
    CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, ERROR_CODE_INTERNAL, ERROR_CODE_OK, HEARTBEAT_FRAME,
};
pub use server::{ServerConfig, ServerStats, Transport};
