//! # Riptide Core
//!
//! The descriptor-facing half of Riptide: a one-shot readiness reactor and the
//! per-connection environment store.
//!
//! This crate provides:
//! - **Reactor**: One-shot, edge-triggered readiness monitoring over a
//!   build-time selected backend (epoll on Linux, kqueue on macOS/BSD)
//! - **Environment store**: Named, disposable objects attached to a connection
//! - **Connection**: The handle tying a descriptor and its environment together
//!
//! ## Design Principles
//!
//! 1. **One-shot by contract** — a registration fires at most once and must be
//!    re-armed; a consumer that stops re-arming stops receiving events
//! 2. **No hot-path allocation** — readiness rounds use fixed stack buffers
//! 3. **The reactor owns nothing** — connection state belongs to the caller;
//!    the reactor only sees `(descriptor, token, interest)`
//!
//! ## Example
//!
//! ```rust,ignore
//! use riptide_core::reactor::{Events, Interest, Reactor, Token};
//!
//! let reactor = Reactor::new(handler)?;
//! reactor.monitor(fd, Token(1), Interest::READ)?;
//!
//! // Worker threads poll for readiness
//! reactor.review(Some(Duration::from_millis(100)))?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // Selectively allowed in the platform backends with SAFETY comments
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod conn;
pub mod env;
pub mod reactor;

// Re-export key types
pub use conn::Connection;
pub use env::{EnvEntry, EnvStore, SetPolicy};
pub use reactor::{Events, Interest, Reactor, Token};

/// Result type for riptide-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for riptide-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reactor-related errors
    #[error("Reactor error: {0}")]
    Reactor(#[from] reactor::ReactorError),
}
