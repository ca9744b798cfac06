//! # tcpsrv
//!
//! Non-blocking TCP listening sockets multiplexed on a single epoll event
//! loop.
//!
//! This crate provides:
//! - A registry of listening sockets with caller-visible metadata
//! - A lock-free control queue through which callers reach the loop
//! - The event loop thread (epoll + eventfd wakeup)
//! - Pause/resume of accepting per socket
//! - A persistent stream of accept notifications
//!
//! ## Threading
//!
//! ```text
//! caller threads                         event loop thread
//! ──────────────                         ─────────────────
//! create/update/get_info ──► registry ◄── accept (lookup)
//! listen (bind) ───────────┐
//! disconnect/close/resume ─┼─► ControlQueue ──► drain → epoll set
//!                          └─ eventfd wake ──► epoll_wait
//! AcceptStream ◄────────────────────────────── AcceptSink::emit
//! ```

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod config;
        mod connections;
        mod event_loop;
        mod manager;
        mod notifier;
        mod queue;
        mod registry;
        mod sink;
        mod socket;

        pub use config::ManagerConfig;
        pub use connections::ConnectionTable;
        pub use manager::ServerSocketManager;
        pub use notifier::EventFdNotifier;
        pub use queue::Completion;
        pub use registry::SocketRegistry;
        pub use sink::AcceptStream;
        pub use socket::ListeningSocket;
    } else {
        compile_error!("tcpsrv requires epoll and eventfd (Linux or Android)");
    }
}

pub use tcpsrv_core::{
    codes, AcceptEvent, ConnectionId, ConnectionRegistry, ErrorInfo, Notifier, Result, ServerSocketError,
    SocketId, SocketInfo, SocketProperties,
};
