//! # Riptide Bus
//!
//! The event-distribution half of Riptide: a publish/subscribe message bus
//! with authenticated envelopes for cluster transport.
//!
//! This crate provides:
//! - **Envelope**: One published event in a single contiguous buffer, with an
//!   in-place authenticated-encryption codec for the cluster wire
//! - **Registry**: Exact-channel and glob-pattern subscriptions with
//!   guaranteed teardown notification
//! - **Bus**: The dispatch engine decoupling publication from callback
//!   execution via a pluggable task queue
//! - **SecretKeys**: Process key material, XOR-masked at rest
//!
//! ## Design Principles
//!
//! 1. **Publication never runs callbacks** — `publish` enqueues one delivery
//!    task per matched subscriber and returns
//! 2. **Reference counting over destructive mutation** — envelopes and
//!    subscriptions are `Arc`-held; cancellation races resolve by skipping,
//!    never by corrupting an in-flight delivery
//! 3. **Authenticated or discarded** — a cluster frame that fails
//!    authentication is dropped whole; no field of it is ever parsed
//!
//! ## Example
//!
//! ```rust,ignore
//! use riptide_bus::{Bus, InlineQueue, Scope, SecretKeys, SubscribeArgs};
//!
//! let bus = Bus::new(Arc::new(InlineQueue), SecretKeys::random());
//! let sub = bus.subscribe(SubscribeArgs::exact("orders", 0, |_, env| {
//!     println!("{} bytes", env.message().len());
//! }))?;
//! bus.publish("orders", b"fill", 0, Scope::Local)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod envelope;
pub mod queue;
pub mod registry;
pub mod secret;

// Re-export key types
pub use bus::{Bus, BusError, BusMetrics, ClusterTransport, Scope};
pub use envelope::{CodecError, Envelope, Flags, SealedEnvelope};
pub use queue::{InlineQueue, Task, TaskQueue, WorkerPool};
pub use registry::{Registry, RegistryError, SubscribeArgs, Subscription, SubscriptionHandle};
pub use secret::SecretKeys;

/// Result type for riptide-bus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for riptide-bus
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Envelope codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] envelope::CodecError),

    /// Subscription registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    /// Dispatch engine errors
    #[error("Bus error: {0}")]
    Bus(#[from] bus::BusError),
}
