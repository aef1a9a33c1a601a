//! Publish/dispatch engine.
//!
//! Decouples publication from callback execution:
//!
//! ```text
//! publish(channel, message, filter, scope)
//!    │
//!    ├─► author one Envelope (single allocation, Arc-held)
//!    ├─► cluster scope: seal a copy, hand to the ClusterTransport
//!    ├─► Registry::subscribers(channel, filter)   (exact, then patterns)
//!    └─► enqueue one delivery task per subscriber on the TaskQueue
//! ```
//!
//! Each task invokes exactly one subscriber's callback with a read-only view
//! of the envelope. The envelope's reference count is held by every task and
//! released as each finishes; the buffer is freed exactly once, safely under
//! concurrent completion.
//!
//! Ordering: tasks for one publish are enqueued in a fixed order (exact
//! matches in registration order, then patterns). Execution order across
//! publishes or subscribers is up to the queue; a FIFO queue gives each
//! subscriber its own deliveries in publish order.
//!
//! Cluster ingress runs the identical match+enqueue path after the frame
//! authenticates; a frame that fails authentication is logged, counted, and
//! dropped whole.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::envelope::{CodecError, Envelope, Flags, SealedEnvelope};
use crate::queue::TaskQueue;
use crate::registry::{Registry, RegistryError, SubscribeArgs, SubscriptionHandle};
use crate::secret::SecretKeys;

// ---------------------------------------------------------------------------
// Scope / ClusterTransport
// ---------------------------------------------------------------------------

/// How far a publish travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// This process only.
    Local,
    /// This process plus every connected remote process.
    Cluster,
}

/// Outbound leg of cluster distribution.
///
/// Receives the sealed frame for one cluster-scoped publish and carries it to
/// remote processes, where [`Bus::receive`] authenticates it and re-runs the
/// local dispatch path. Delivery is best-effort: a transport failure is
/// logged and counted, never retried, and local delivery is unaffected.
pub trait ClusterTransport: Send + Sync {
    /// Carries one sealed frame toward the remote processes.
    ///
    /// # Errors
    ///
    /// Returns the transport's error; the bus logs it and drops the frame
    /// for the remotes.
    fn forward(&self, frame: SealedEnvelope) -> std::io::Result<()>;
}

// ---------------------------------------------------------------------------
// BusError
// ---------------------------------------------------------------------------

/// Errors from the dispatch engine.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Envelope authoring or sealing failed, or an ingress frame was
    /// rejected.
    #[error("Envelope codec: {0}")]
    Codec(#[from] CodecError),
}

// ---------------------------------------------------------------------------
// BusMetrics
// ---------------------------------------------------------------------------

/// Atomic counters for monitoring the dispatch engine.
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Envelopes authored by `publish`.
    published: AtomicU64,
    /// Delivery tasks that ran a subscriber callback.
    delivered: AtomicU64,
    /// Delivery tasks skipped because the subscription was removed first.
    skipped: AtomicU64,
    /// Ingress frames rejected (authentication or structure).
    rejected_frames: AtomicU64,
    /// Cluster forwards that failed in the transport.
    transport_failures: AtomicU64,
}

impl BusMetrics {
    /// Envelopes authored by `publish`.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Delivery tasks that ran a subscriber callback.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Delivery tasks skipped because the subscription was removed first.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Ingress frames rejected.
    #[must_use]
    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames.load(Ordering::Relaxed)
    }

    /// Cluster forwards that failed in the transport.
    #[must_use]
    pub fn transport_failures(&self) -> u64 {
        self.transport_failures.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// The publish/dispatch engine.
///
/// Owns the subscription [`Registry`], the key material for cluster frames,
/// and a handle to the external [`TaskQueue`].
pub struct Bus {
    registry: Arc<Registry>,
    queue: Arc<dyn TaskQueue>,
    keys: SecretKeys,
    transport: RwLock<Option<Arc<dyn ClusterTransport>>>,
    metrics: Arc<BusMetrics>,
}

impl Bus {
    /// Creates a bus over the given task queue and key material.
    #[must_use]
    pub fn new(queue: Arc<dyn TaskQueue>, keys: SecretKeys) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            queue,
            keys,
            transport: RwLock::new(None),
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    /// Attaches the outbound cluster transport.
    pub fn set_transport(&self, transport: Arc<dyn ClusterTransport>) {
        *self.transport.write() = Some(transport);
    }

    /// Returns the subscription registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the metrics counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    /// Registers a subscription. See [`Registry::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPattern`] for an uncompilable glob.
    pub fn subscribe(&self, args: SubscribeArgs) -> Result<SubscriptionHandle, RegistryError> {
        self.registry.subscribe(args)
    }

    /// Removes every subscription matching the selector. See
    /// [`Registry::unsubscribe`]. Returns the number removed (`0` = nothing
    /// matched, not an error).
    pub fn unsubscribe(&self, channel: &str, filter: i8, is_pattern: bool) -> usize {
        self.registry.unsubscribe(channel, filter, is_pattern)
    }

    /// Publishes `message` on `(channel, filter)`.
    ///
    /// Authors one envelope, enqueues one delivery task per matching
    /// subscriber, and returns without running any callback. Publishing to a
    /// channel with zero subscribers is success with zero deliveries.
    ///
    /// [`Scope::Cluster`] additionally seals a copy of the envelope and
    /// hands it to the attached transport (best-effort: a transport failure
    /// is logged and counted, local delivery is unaffected; without a
    /// transport the publish is local-only).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Codec`] if the envelope cannot be authored or
    /// sealed.
    pub fn publish(
        &self,
        channel: &str,
        message: &[u8],
        filter: i8,
        scope: Scope,
    ) -> Result<(), BusError> {
        let flags = match scope {
            Scope::Local => Flags::empty(),
            Scope::Cluster => Flags::CLUSTER,
        };
        let envelope = Envelope::author(channel, message, filter, flags)?;

        if scope == Scope::Cluster {
            let transport = self.transport.read().clone();
            if let Some(transport) = transport {
                let frame = envelope.sealed_copy(&self.keys)?;
                if let Err(e) = transport.forward(frame) {
                    tracing::warn!(channel, "cluster forward failed, remotes skipped: {e}");
                    self.metrics.transport_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        self.fan_out(Arc::new(envelope));
        Ok(())
    }

    /// Ingress path for one cluster frame received from a remote process.
    ///
    /// Authenticates and decrypts the frame, then runs the identical
    /// match+enqueue path as a local publish. Never re-forwards, so frames
    /// cannot loop between processes.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Codec`] if the frame is structurally invalid or
    /// fails authentication. The frame is discarded whole; no field of it is
    /// parsed past the failure.
    pub fn receive(&self, frame: &[u8]) -> Result<(), BusError> {
        let sealed = match SealedEnvelope::from_bytes(frame.to_vec()) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::warn!("malformed cluster frame dropped: {e}");
                self.metrics.rejected_frames.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        match sealed.open(&self.keys) {
            Ok(envelope) => {
                self.fan_out(Arc::new(envelope));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("unauthenticated cluster frame dropped: {e}");
                self.metrics.rejected_frames.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Enqueues one delivery task per matching subscriber.
    fn fan_out(&self, envelope: Arc<Envelope>) {
        let subscribers = self.registry.subscribers(envelope.channel(), envelope.filter());
        for sub in subscribers {
            let envelope = Arc::clone(&envelope);
            let metrics = Arc::clone(&self.metrics);
            self.queue.enqueue(Box::new(move || {
                if sub.deliver(&envelope) {
                    metrics.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    metrics.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("registry", &self.registry)
            .field("has_transport", &self.transport.read().is_some())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
