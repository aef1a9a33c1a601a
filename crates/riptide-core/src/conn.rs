//! Connection handle.
//!
//! Ties a monitored descriptor and its [`EnvStore`] together. Created by the
//! owning protocol layer on accept/open and dropped on detected close/error
//! or explicit forget; dropping drains the environment store, firing every
//! entry's disposer.
//!
//! The reactor never owns a `Connection` — it only sees the
//! `(descriptor, token, interest)` triple the owner hands to
//! [`Reactor::monitor`](crate::reactor::Reactor::monitor).

use std::os::fd::RawFd;

use crate::env::EnvStore;
use crate::reactor::Token;

/// One monitored connection: descriptor identity plus attached environment.
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    token: Token,
    env: EnvStore,
}

impl Connection {
    /// Creates a connection handle for an accepted/opened descriptor.
    ///
    /// The descriptor itself stays owned by the caller; this handle only
    /// carries its identity.
    #[must_use]
    pub fn new(fd: RawFd, token: Token) -> Self {
        Self {
            fd,
            token,
            env: EnvStore::new(),
        }
    }

    /// Returns the underlying descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the reactor token for this connection.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Returns the attached environment store.
    #[must_use]
    pub fn env(&self) -> &EnvStore {
        &self.env
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvEntry, SetPolicy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_connection_accessors() {
        let conn = Connection::new(12, Token(99));
        assert_eq!(conn.fd(), 12);
        assert_eq!(conn.token(), Token(99));
        assert!(conn.env().is_empty());
    }

    #[test]
    fn test_drop_drains_environment() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let conn = Connection::new(12, Token(99));
            let f = Arc::clone(&fired);
            let entry = EnvEntry::with_disposer(Box::new(0u8), move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
            conn.env().set("session", 0, entry, SetPolicy::Replace).unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
