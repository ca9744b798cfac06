//! # tcpsrv-core
//!
//! Core types and traits for the TCP server-socket manager.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The epoll/eventfd implementation lives in `tcpsrv`.
//!
//! ## Modules
//!
//! - `id` - Listening socket and accepted connection identifiers
//! - `socket` - Socket properties and read-only snapshots
//! - `event` - Accept notifications delivered to subscribers
//! - `error` - Error taxonomy and caller-facing result codes
//! - `traits` - Collaborator seams (wake notifier, connection registry)

pub mod id;
pub mod socket;
pub mod event;
pub mod error;
pub mod traits;

// Re-exports for convenience
pub use id::{ConnectionId, SocketId};
pub use socket::{SocketInfo, SocketProperties};
pub use event::AcceptEvent;
pub use error::{codes, ErrorInfo, Result, ServerSocketError};
pub use traits::{ConnectionRegistry, Notifier};
