//! Linux epoll backend.
//!
//! One-shot is `EPOLLONESHOT`, edge-triggering is `EPOLLET`; both are set on
//! every registration. Re-arming uses `EPOLL_CTL_MOD` first (the common case)
//! and falls back to `EPOLL_CTL_ADD` for a descriptor the instance has never
//! seen. `EPOLLRDHUP` is always requested so a half-closed peer surfaces as a
//! close event rather than an endless readable edge.

use std::io;
use std::os::fd::RawFd;

use super::{Backend, Interest, Readiness, ReadinessBuf, ReactorError, Token, MAX_EVENTS};

/// Wrapper around one epoll instance.
pub(crate) struct Epoll {
    epfd: RawFd,
}

impl std::fmt::Debug for Epoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoll").field("epfd", &self.epfd).finish()
    }
}

impl Backend for Epoll {
    /// Creates the epoll instance.
    #[allow(unsafe_code)]
    fn new() -> Result<Self, ReactorError> {
        // SAFETY: epoll_create1 takes no pointers; the return value is
        // checked before use.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(ReactorError::BackendCreation(io::Error::last_os_error()));
        }
        Ok(Self { epfd })
    }

    /// Arms one-shot, edge-triggered interest for `fd`.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_sign_loss)] // EPOLL* constants are c_int bit patterns
    fn monitor(
        &self,
        fd: RawFd,
        token: Token,
        interest: Interest,
    ) -> Result<(), ReactorError> {
        let mut flags =
            libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32 | libc::EPOLLRDHUP as u32;
        if interest.is_readable() {
            flags |= libc::EPOLLIN as u32;
        }
        if interest.is_writable() {
            flags |= libc::EPOLLOUT as u32;
        }

        let mut ev = libc::epoll_event {
            events: flags,
            u64: token.0,
        };

        // Re-arm is the common case: MOD first, ADD on ENOENT.
        // SAFETY: `ev` is a valid epoll_event for the duration of each call.
        let mut rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc != 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT) {
            // SAFETY: as above.
            rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        }
        if rc != 0 {
            return Err(ReactorError::Monitor {
                fd,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Drops interest in `fd`. Removing a descriptor epoll no longer knows
    /// (or that is already closed) is success.
    #[allow(unsafe_code)]
    fn forget(&self, fd: RawFd) -> Result<(), ReactorError> {
        // Kernels before 2.6.9 insist on a non-null event pointer for DEL.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };

        // SAFETY: `ev` is a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOENT | libc::EBADF) => Ok(()),
                _ => Err(ReactorError::Forget { fd, source: err }),
            };
        }
        Ok(())
    }

    /// Waits up to `timeout_ms` (`-1` blocks) for ready descriptors.
    ///
    /// Interrupted waits surface as `ErrorKind::Interrupted`; the caller
    /// retries with the remaining timeout.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn wait(&self, timeout_ms: libc::c_int) -> io::Result<ReadinessBuf> {
        // SAFETY: epoll_event is plain data; an all-zero value is valid.
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        // SAFETY: `events` outlives the call and MAX_EVENTS matches its length.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let closed_mask =
            libc::EPOLLHUP as u32 | libc::EPOLLERR as u32 | libc::EPOLLRDHUP as u32;

        let mut out = ReadinessBuf::new();
        for ev in &events[..n as usize] {
            let bits = ev.events;
            let token = Token(ev.u64);
            out.push(Readiness {
                token,
                readable: bits & libc::EPOLLIN as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                closed: bits & closed_mask != 0,
            });
        }
        Ok(out)
    }
}

impl Drop for Epoll {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: `epfd` is owned by this instance and closed exactly once.
        unsafe {
            libc::close(self.epfd);
        }
    }
}
