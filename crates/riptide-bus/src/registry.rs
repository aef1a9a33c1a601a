//! Subscription registry.
//!
//! Stores exact-channel and glob-pattern subscriptions and answers match
//! queries for the dispatch engine.
//!
//! # Indices
//!
//! ```text
//! exact:    filter → channel → [subscriptions, registration order]   O(1)
//! patterns: [subscriptions, registration order]                      O(n)
//! ```
//!
//! Exact lookups are amortized O(1); pattern lookups are linear in the
//! (expected small) pattern count. Both indices sit behind `RwLock`s — reads
//! (match queries) proceed concurrently, mutation excludes them because an
//! insert can resize the backing map.
//!
//! # Lifecycle invariants
//!
//! - A subscription's on-unsubscribe callback fires exactly once: on explicit
//!   removal, at [`Registry::teardown`], or when the registry is dropped.
//!   `Option::take` behind a lock makes "more than once" unrepresentable;
//!   registry ownership makes "never" unreachable.
//! - Removal racing an in-flight delivery resolves via reference counting:
//!   the delivery task holds its own `Arc` and consults the subscription's
//!   active flag, so it either runs against a still-valid object or skips —
//!   never a partial invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::envelope::Envelope;

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// Delivery callback: invoked once per matching publish with a read-only view
/// of the envelope. State travels inside the closure.
pub type OnMessage = Box<dyn Fn(&Subscription, &Envelope) + Send + Sync>;

/// Teardown-notification callback. `FnOnce`: the type system already forbids
/// a double call; the registry guarantees it is never skipped.
pub type OnUnsubscribe = Box<dyn FnOnce() + Send>;

/// Match results for one publish: exact matches in registration order, then
/// patterns in registration order.
pub type Matches = SmallVec<[Arc<Subscription>; 4]>;

// ---------------------------------------------------------------------------
// SubscribeArgs
// ---------------------------------------------------------------------------

/// Arguments for [`Registry::subscribe`].
pub struct SubscribeArgs {
    /// Channel name, or glob pattern when `is_pattern` is set.
    pub channel: String,
    /// Filter value; a subscription only sees envelopes with an equal filter.
    pub filter: i8,
    /// Whether `channel` is a glob pattern.
    pub is_pattern: bool,
    /// Delivery callback.
    pub on_message: OnMessage,
    /// Optional teardown notification.
    pub on_unsubscribe: Option<OnUnsubscribe>,
}

impl SubscribeArgs {
    /// Arguments for an exact-channel subscription.
    pub fn exact<F>(channel: impl Into<String>, filter: i8, on_message: F) -> Self
    where
        F: Fn(&Subscription, &Envelope) + Send + Sync + 'static,
    {
        Self {
            channel: channel.into(),
            filter,
            is_pattern: false,
            on_message: Box::new(on_message),
            on_unsubscribe: None,
        }
    }

    /// Arguments for a glob-pattern subscription.
    pub fn pattern<F>(pattern: impl Into<String>, filter: i8, on_message: F) -> Self
    where
        F: Fn(&Subscription, &Envelope) + Send + Sync + 'static,
    {
        Self {
            channel: pattern.into(),
            filter,
            is_pattern: true,
            on_message: Box::new(on_message),
            on_unsubscribe: None,
        }
    }

    /// Attaches a teardown notification.
    #[must_use]
    pub fn on_unsubscribe<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_unsubscribe = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SubscribeArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeArgs")
            .field("channel", &self.channel)
            .field("filter", &self.filter)
            .field("is_pattern", &self.is_pattern)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A registered subscription.
///
/// `Arc`-held by the registry and by every in-flight delivery task; the
/// object outlives removal until the last task releases it.
pub struct Subscription {
    channel: String,
    filter: i8,
    /// Compiled glob, present iff this is a pattern subscription.
    matcher: Option<glob::Pattern>,
    on_message: OnMessage,
    on_unsubscribe: Mutex<Option<OnUnsubscribe>>,
    active: AtomicBool,
}

impl Subscription {
    /// Channel name or glob pattern.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Filter value.
    #[must_use]
    pub fn filter(&self) -> i8 {
        self.filter
    }

    /// Returns `true` if this is a pattern subscription.
    #[must_use]
    pub fn is_pattern(&self) -> bool {
        self.matcher.is_some()
    }

    /// Returns `false` once the subscription has been removed or torn down.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns `true` if this subscription matches `(channel, filter)`:
    /// equal filter, and an exact channel match or a glob accept.
    #[must_use]
    pub fn matches(&self, channel: &str, filter: i8) -> bool {
        if self.filter != filter {
            return false;
        }
        match &self.matcher {
            Some(pattern) => pattern.matches(channel),
            None => self.channel == channel,
        }
    }

    /// Runs the delivery callback if the subscription is still active.
    ///
    /// Returns `true` if the callback ran. A subscription removed while this
    /// delivery was queued is skipped entirely.
    pub(crate) fn deliver(&self, envelope: &Envelope) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        (self.on_message)(self, envelope);
        true
    }

    /// Deactivates and fires the on-unsubscribe callback. `take` makes a
    /// second call a no-op, so the callback fires exactly once no matter
    /// which removal path got here first.
    fn retire(&self) {
        self.active.store(false, Ordering::Release);
        let on_unsubscribe = self.on_unsubscribe.lock().take();
        if let Some(f) = on_unsubscribe {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("filter", &self.filter)
            .field("is_pattern", &self.is_pattern())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors from the subscription registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The pattern did not compile in the glob matcher.
    #[error("Invalid glob pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The matcher's own diagnosis.
        #[source]
        source: glob::PatternError,
    },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The subscription registry.
///
/// Thread-safe; match queries take read locks and proceed concurrently,
/// subscribe/unsubscribe/teardown take write locks.
#[derive(Default)]
pub struct Registry {
    /// filter → channel → subscriptions in registration order.
    exact: RwLock<FxHashMap<i8, FxHashMap<String, Vec<Arc<Subscription>>>>>,
    /// Pattern subscriptions in registration order.
    patterns: RwLock<Vec<Arc<Subscription>>>,
    torn_down: AtomicBool,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a subscription and returns its handle.
    ///
    /// The handle only becomes observable here, after the insert completed
    /// under the write lock — there is no window where a caller holds a
    /// handle that is not yet matchable. Dropping the handle cancels the
    /// subscription; call [`SubscriptionHandle::detach`] to keep it alive
    /// until explicit unsubscribe or teardown.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPattern`] if a pattern subscription's
    /// glob does not compile.
    pub fn subscribe(
        self: &Arc<Self>,
        args: SubscribeArgs,
    ) -> Result<SubscriptionHandle, RegistryError> {
        debug_assert!(
            !self.torn_down.load(Ordering::Acquire),
            "subscribe on a torn-down registry"
        );

        let matcher = if args.is_pattern {
            Some(
                glob::Pattern::new(&args.channel).map_err(|source| {
                    RegistryError::InvalidPattern {
                        pattern: args.channel.clone(),
                        source,
                    }
                })?,
            )
        } else {
            None
        };

        let sub = Arc::new(Subscription {
            channel: args.channel,
            filter: args.filter,
            matcher,
            on_message: args.on_message,
            on_unsubscribe: Mutex::new(args.on_unsubscribe),
            active: AtomicBool::new(true),
        });

        if sub.is_pattern() {
            self.patterns.write().push(Arc::clone(&sub));
        } else {
            self.exact
                .write()
                .entry(sub.filter)
                .or_default()
                .entry(sub.channel.clone())
                .or_default()
                .push(Arc::clone(&sub));
        }

        Ok(SubscriptionHandle {
            registry: Arc::clone(self),
            sub,
            detached: false,
        })
    }

    /// Removes every subscription matching the selector and synchronously
    /// fires each one's on-unsubscribe exactly once.
    ///
    /// Returns the number removed; `0` is the non-error "nothing matched"
    /// signal.
    pub fn unsubscribe(&self, channel: &str, filter: i8, is_pattern: bool) -> usize {
        let mut removed: Vec<Arc<Subscription>> = Vec::new();

        if is_pattern {
            let mut patterns = self.patterns.write();
            let mut i = 0;
            while i < patterns.len() {
                if patterns[i].channel == channel && patterns[i].filter == filter {
                    removed.push(patterns.remove(i));
                } else {
                    i += 1;
                }
            }
        } else {
            let mut exact = self.exact.write();
            if let Some(by_channel) = exact.get_mut(&filter) {
                if let Some(subs) = by_channel.remove(channel) {
                    removed.extend(subs);
                }
                if by_channel.is_empty() {
                    exact.remove(&filter);
                }
            }
        }

        for sub in &removed {
            sub.retire();
        }
        removed.len()
    }

    /// Returns the subscriptions matching `(channel, filter)`: exact matches
    /// in registration order, then pattern matches in registration order.
    #[must_use]
    pub fn subscribers(&self, channel: &str, filter: i8) -> Matches {
        debug_assert!(
            !self.torn_down.load(Ordering::Acquire),
            "match query on a torn-down registry"
        );

        let mut out = Matches::new();
        {
            let exact = self.exact.read();
            if let Some(subs) = exact.get(&filter).and_then(|m| m.get(channel)) {
                out.extend(subs.iter().cloned());
            }
        }
        {
            let patterns = self.patterns.read();
            for sub in patterns.iter() {
                if sub.matches(channel, filter) {
                    out.push(Arc::clone(sub));
                }
            }
        }
        out
    }

    /// Removes one specific subscription (handle path). Fires its
    /// on-unsubscribe iff it was still registered.
    fn remove_subscription(&self, target: &Arc<Subscription>) -> bool {
        let mut found = false;

        if target.is_pattern() {
            let mut patterns = self.patterns.write();
            if let Some(at) = patterns.iter().position(|s| Arc::ptr_eq(s, target)) {
                patterns.remove(at);
                found = true;
            }
        } else {
            let mut exact = self.exact.write();
            if let Some(by_channel) = exact.get_mut(&target.filter) {
                if let Some(subs) = by_channel.get_mut(&target.channel) {
                    if let Some(at) = subs.iter().position(|s| Arc::ptr_eq(s, target)) {
                        subs.remove(at);
                        found = true;
                    }
                    if subs.is_empty() {
                        by_channel.remove(&target.channel);
                    }
                }
                if by_channel.is_empty() {
                    exact.remove(&target.filter);
                }
            }
        }

        if found {
            target.retire();
        }
        found
    }

    /// Removes every subscription, firing each on-unsubscribe exactly once.
    ///
    /// Holds both index write locks for the drain, so no concurrent match
    /// query can observe a half-torn registry. Idempotent; also runs on
    /// `Drop`.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let removed: Vec<Arc<Subscription>> = {
            let mut exact = self.exact.write();
            let mut patterns = self.patterns.write();
            let mut all = Vec::new();
            for (_, by_channel) in exact.drain() {
                for (_, subs) in by_channel {
                    all.extend(subs);
                }
            }
            all.extend(patterns.drain(..));
            all
        };

        for sub in &removed {
            sub.retire();
        }
    }

    /// Total registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let exact: usize = self
            .exact
            .read()
            .values()
            .flat_map(|by_channel| by_channel.values())
            .map(Vec::len)
            .sum();
        exact + self.patterns.read().len()
    }

    /// Registered pattern subscriptions.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.patterns.read().len()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("subscriptions", &self.subscription_count())
            .field("patterns", &self.pattern_count())
            .field("torn_down", &self.torn_down.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SubscriptionHandle
// ---------------------------------------------------------------------------

/// Owner handle for one subscription.
///
/// Dropping the handle cancels the subscription; [`SubscriptionHandle::detach`]
/// opts out, leaving the subscription alive until explicit unsubscribe or
/// registry teardown.
#[derive(Debug)]
pub struct SubscriptionHandle {
    registry: Arc<Registry>,
    sub: Arc<Subscription>,
    detached: bool,
}

impl SubscriptionHandle {
    /// Cancels the subscription now, firing its on-unsubscribe if this
    /// handle got there first.
    pub fn cancel(mut self) {
        self.detached = true;
        self.registry.remove_subscription(&self.sub);
    }

    /// Consumes the handle without cancelling; the subscription lives until
    /// explicit unsubscribe or teardown.
    pub fn detach(mut self) {
        self.detached = true;
    }

    /// Channel name or glob pattern.
    #[must_use]
    pub fn channel(&self) -> &str {
        self.sub.channel()
    }

    /// Filter value.
    #[must_use]
    pub fn filter(&self) -> i8 {
        self.sub.filter()
    }

    /// Returns `false` once the subscription has been removed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.sub.is_active()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.detached {
            self.registry.remove_subscription(&self.sub);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
