//! # Reactor Module
//!
//! One-shot, edge-triggered readiness monitoring with a build-time selected
//! platform backend.
//!
//! ## Design Goals
//!
//! - **One-shot delivery** — a registration fires at most once, then reverts
//!   to unarmed; re-arming is an explicit `monitor` call. This is the
//!   backpressure mechanism: a consumer that stops re-arming stops receiving.
//! - **Exactly one callback per ready descriptor** — `on_close` when the
//!   peer hung up or the descriptor errored, else `on_data` when readable,
//!   else `on_ready` when writable.
//! - **No hot-path allocation** — readiness rounds run out of fixed stack
//!   buffers.
//!
//! ## Per-descriptor state machine
//!
//! ```text
//!            monitor(fd, token, interest)
//! unarmed ──────────────────────────────► armed(interest)
//!    ▲                                        │
//!    │          event fires (one-shot)        │
//!    ├────────────────────────────────────────┤
//!    │               forget(fd)               │
//!    └────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! `monitor`, `forget`, and `review` all take `&self` and may be called from
//! any number of worker threads; the kernel object serializes itself. A
//! `monitor` call racing an in-flight `review` round is not guaranteed to be
//! observed until the next round — visibility is round-granular.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
use epoll::Epoll as Selector;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
use kqueue::Kqueue as Selector;

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
compile_error!("riptide-core requires an epoll- or kqueue-capable platform");

// ---------------------------------------------------------------------------
// Token / Interest
// ---------------------------------------------------------------------------

/// Opaque user value attached to a monitored descriptor.
///
/// Supplied at [`Reactor::monitor`] time and echoed back into every callback
/// for that descriptor. The reactor never interprets it; the owning protocol
/// layer uses it to find its connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Readiness interest for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interest in readability.
    pub const READ: Self = Self(0b01);
    /// Interest in writability.
    pub const WRITE: Self = Self(0b10);
    /// Interest in both directions.
    pub const BOTH: Self = Self(0b11);

    /// Returns `true` if this interest includes readability.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Returns `true` if this interest includes writability.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Events — readiness callbacks
// ---------------------------------------------------------------------------

/// Readiness callbacks invoked by [`Reactor::review`].
///
/// All three run synchronously on the reviewing thread and must not block
/// indefinitely. With multiple worker threads calling `review`, callbacks for
/// different descriptors run concurrently; callbacks for one descriptor are
/// serialized by the one-shot contract (the descriptor is unarmed until the
/// callback's owner re-arms it).
pub trait Events: Send + Sync {
    /// The descriptor became writable.
    fn on_ready(&self, token: Token);

    /// The descriptor became readable.
    fn on_data(&self, token: Token);

    /// The peer hung up or the descriptor errored. Takes precedence over
    /// `on_data` when EOF and pending input fire together.
    fn on_close(&self, token: Token);
}

// ---------------------------------------------------------------------------
// ReactorError
// ---------------------------------------------------------------------------

/// Errors that can occur in the reactor.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The backend kernel object could not be created. This is the one
    /// unrecoverable failure in the core: without it no descriptor can be
    /// monitored, and the embedding process is expected to abort.
    #[error("Backend creation failed: {0}")]
    BackendCreation(#[source] io::Error),

    /// The backend rejected a `monitor` registration (e.g. resource
    /// exhaustion). The caller decides whether to close the connection.
    #[error("Monitor failed for descriptor {fd}: {source}")]
    Monitor {
        /// The descriptor that could not be armed.
        fd: RawFd,
        /// The backend error.
        #[source]
        source: io::Error,
    },

    /// The backend rejected a `forget` call for a reason other than the
    /// descriptor being already gone (that case is silent success).
    #[error("Forget failed for descriptor {fd}: {source}")]
    Forget {
        /// The descriptor that could not be dropped.
        fd: RawFd,
        /// The backend error.
        #[source]
        source: io::Error,
    },

    /// The readiness wait itself failed. Interrupted waits are retried
    /// internally and never surface here.
    #[error("Readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

// ---------------------------------------------------------------------------
// Readiness — one backend wait result entry
// ---------------------------------------------------------------------------

/// Readiness state for one descriptor in one `review` round.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) token: Token,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) closed: bool,
}

/// Maximum descriptors surfaced per wait round.
pub(crate) const MAX_EVENTS: usize = 64;

/// One wait round's results; inline up to [`MAX_EVENTS`], so the hot path
/// never allocates.
pub(crate) type ReadinessBuf = smallvec::SmallVec<[Readiness; MAX_EVENTS]>;

// ---------------------------------------------------------------------------
// Backend — the platform contract
// ---------------------------------------------------------------------------

/// Contract every platform backend implements. Exactly one implementation is
/// compiled per target (no runtime branching); destruction is `Drop`.
pub(crate) trait Backend: Send + Sync + Sized {
    /// Creates the kernel object.
    fn new() -> Result<Self, ReactorError>;

    /// Arms one-shot, edge-triggered interest for `fd`.
    fn monitor(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), ReactorError>;

    /// Drops interest in `fd`; idempotent.
    fn forget(&self, fd: RawFd) -> Result<(), ReactorError>;

    /// Waits up to `timeout_ms` (`-1` blocks) for ready descriptors, one
    /// entry per descriptor. Interrupted waits surface as
    /// `ErrorKind::Interrupted` for the caller to retry.
    fn wait(&self, timeout_ms: libc::c_int) -> io::Result<ReadinessBuf>;
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

/// The readiness reactor.
///
/// Owns the platform backend (epoll or kqueue, selected at build time) and
/// the [`Events`] callback sink. The reactor does not own connection state —
/// only the interest and token it is given per descriptor.
pub struct Reactor<E: Events> {
    backend: Selector,
    events: E,
}

impl<E: Events> Reactor<E> {
    /// Creates the reactor and its backend kernel object.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::BackendCreation`] if the kernel object cannot
    /// be created. There is no recovery path: callers treat this as fatal.
    pub fn new(events: E) -> Result<Self, ReactorError> {
        let backend = Selector::new()?;
        Ok(Self { backend, events })
    }

    /// Arms one-shot, edge-triggered interest for a descriptor.
    ///
    /// After an event fires the registration reverts to unarmed; call
    /// `monitor` again to re-arm. Safe to call concurrently with `review`,
    /// but a registration submitted after a round has begun polling may not
    /// be observed until the next round.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Monitor`] if the backend rejects the
    /// registration. Never silently drops a registration.
    pub fn monitor(&self, fd: RawFd, token: Token, interest: Interest) -> Result<(), ReactorError> {
        self.backend.monitor(fd, token, interest)
    }

    /// Removes interest in a descriptor immediately.
    ///
    /// Idempotent on every platform: forgetting a descriptor that was never
    /// monitored, was already forgotten, or is already closed is success.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Forget`] only for genuine backend failures.
    pub fn forget(&self, fd: RawFd) -> Result<(), ReactorError> {
        self.backend.forget(fd)
    }

    /// Blocks up to `timeout` waiting for ready descriptors, then invokes
    /// exactly one callback per ready descriptor.
    ///
    /// Callback precedence per descriptor: `on_close` (EOF/error), then
    /// `on_data` (readable), then `on_ready` (writable). Returns the number
    /// of ready descriptors, `Ok(0)` on timeout. A `timeout` of `None`
    /// blocks until at least one descriptor is ready.
    ///
    /// Interrupted waits are retried internally with the remaining timeout
    /// and never surface as errors.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Wait`] on genuine backend failure.
    pub fn review(&self, timeout: Option<Duration>) -> Result<usize, ReactorError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            match self.backend.wait(wait_millis(deadline)) {
                Ok(ready) => {
                    for r in &ready {
                        if r.closed {
                            self.events.on_close(r.token);
                        } else if r.readable {
                            self.events.on_data(r.token);
                        } else if r.writable {
                            self.events.on_ready(r.token);
                        }
                    }
                    return Ok(ready.len());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(0);
                    }
                }
                Err(e) => {
                    tracing::error!("readiness wait failed: {e}");
                    return Err(ReactorError::Wait(e));
                }
            }
        }
    }

    /// Returns the callback sink.
    #[must_use]
    pub fn events(&self) -> &E {
        &self.events
    }
}

/// Converts an absolute deadline into the backend's millisecond timeout
/// (`-1` blocks indefinitely).
#[allow(clippy::cast_possible_truncation)] // Clamped to i32::MAX below
fn wait_millis(deadline: Option<Instant>) -> libc::c_int {
    match deadline {
        None => -1,
        Some(d) => {
            let remaining = d.saturating_duration_since(Instant::now()).as_millis();
            if remaining > libc::c_int::MAX as u128 {
                libc::c_int::MAX
            } else {
                remaining as libc::c_int
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
