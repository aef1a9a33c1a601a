//! BSD/macOS kqueue backend.
//!
//! kqueue keys registrations by `(ident, filter)`, so one `monitor` call
//! turns into a changelist touching both `EVFILT_READ` and `EVFILT_WRITE`:
//! requested filters get `EV_ADD | EV_ONESHOT | EV_CLEAR`, unrequested ones
//! get `EV_DELETE` so a previous round's interest cannot linger. `EV_RECEIPT`
//! makes the kernel report per-entry results instead of failing the whole
//! changelist; `ENOENT` on a delete entry is the idempotent no-op.
//!
//! A wait round can surface two entries for one descriptor (read and write
//! filters); they are coalesced so the caller sees one readiness record per
//! descriptor, preserving the one-callback contract.

use std::io;
use std::os::fd::RawFd;
use std::ptr;

use smallvec::SmallVec;

use super::{Backend, Interest, Readiness, ReadinessBuf, ReactorError, Token, MAX_EVENTS};

/// Wrapper around one kqueue instance.
pub(crate) struct Kqueue {
    kq: RawFd,
}

impl std::fmt::Debug for Kqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kqueue").field("kq", &self.kq).finish()
    }
}

/// Extracts the errno from an `EV_RECEIPT` result entry (`0` = success).
#[allow(clippy::cast_possible_truncation)]
fn receipt_errno(receipt: &libc::kevent) -> i32 {
    if receipt.flags & libc::EV_ERROR != 0 {
        receipt.data as i32
    } else {
        0
    }
}

/// Builds a zeroed change entry for `(fd, filter)`.
#[allow(unsafe_code)]
fn change(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    // SAFETY: kevent is plain data; an all-zero value is valid.
    let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
    kev.ident = fd as libc::uintptr_t;
    kev.filter = filter;
    kev.flags = flags;
    kev.udata = token.0 as usize as *mut libc::c_void;
    kev
}

impl Kqueue {
    /// Submits a changelist and returns the per-entry receipts.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn submit(&self, changes: &[libc::kevent; 2]) -> io::Result<[libc::kevent; 2]> {
        // SAFETY: kevent is plain data; an all-zero value is valid.
        let mut receipts: [libc::kevent; 2] = unsafe { std::mem::zeroed() };

        // SAFETY: both arrays outlive the call and the counts match their
        // lengths; a null timeout with EV_RECEIPT entries does not block.
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                receipts.as_mut_ptr(),
                receipts.len() as libc::c_int,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(receipts)
    }
}

impl Backend for Kqueue {
    /// Creates the kqueue instance.
    #[allow(unsafe_code)]
    fn new() -> Result<Self, ReactorError> {
        // SAFETY: kqueue takes no arguments; the return value is checked
        // before use.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(ReactorError::BackendCreation(io::Error::last_os_error()));
        }
        // SAFETY: `kq` is a valid descriptor owned by this instance.
        if unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: as above; creation failed, close before returning.
            unsafe {
                libc::close(kq);
            }
            return Err(ReactorError::BackendCreation(err));
        }
        Ok(Self { kq })
    }

    /// Arms one-shot interest for `fd`, replacing any previous interest.
    fn monitor(
        &self,
        fd: RawFd,
        token: Token,
        interest: Interest,
    ) -> Result<(), ReactorError> {
        let arm = libc::EV_ADD | libc::EV_ONESHOT | libc::EV_CLEAR | libc::EV_RECEIPT;
        let disarm = libc::EV_DELETE | libc::EV_RECEIPT;

        let changes = [
            change(
                fd,
                libc::EVFILT_READ,
                if interest.is_readable() { arm } else { disarm },
                token,
            ),
            change(
                fd,
                libc::EVFILT_WRITE,
                if interest.is_writable() { arm } else { disarm },
                token,
            ),
        ];

        let receipts = self.submit(&changes).map_err(|source| ReactorError::Monitor { fd, source })?;

        for (entry, receipt) in changes.iter().zip(&receipts) {
            let errno = receipt_errno(receipt);
            if errno == 0 {
                continue;
            }
            // Deleting a filter that was never armed is the idempotent no-op.
            if entry.flags & libc::EV_DELETE != 0 && errno == libc::ENOENT {
                continue;
            }
            return Err(ReactorError::Monitor {
                fd,
                source: io::Error::from_raw_os_error(errno),
            });
        }
        Ok(())
    }

    /// Drops interest in `fd`. Removing a descriptor kqueue no longer knows
    /// (or that is already closed) is success.
    fn forget(&self, fd: RawFd) -> Result<(), ReactorError> {
        let disarm = libc::EV_DELETE | libc::EV_RECEIPT;
        let changes = [
            change(fd, libc::EVFILT_READ, disarm, Token(0)),
            change(fd, libc::EVFILT_WRITE, disarm, Token(0)),
        ];

        let receipts = self.submit(&changes).map_err(|source| ReactorError::Forget { fd, source })?;

        for receipt in &receipts {
            let errno = receipt_errno(receipt);
            if errno == 0 || errno == libc::ENOENT || errno == libc::EBADF {
                continue;
            }
            return Err(ReactorError::Forget {
                fd,
                source: io::Error::from_raw_os_error(errno),
            });
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
        let ts = libc::timespec {
            tv_sec: (i64::from(timeout_ms) / 1000) as libc::time_t,
            tv_nsec: ((i64::from(timeout_ms) % 1000) * 1_000_000) as libc::c_long,
        };
        let ts_ptr = if timeout_ms < 0 { ptr::null() } else { &ts };

        // SAFETY: kevent is plain data; an all-zero value is valid.
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        // SAFETY: `events` outlives the call, MAX_EVENTS matches its length,
        // and `ts_ptr` is either null or points at a live timespec.
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                ts_ptr,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        // Coalesce read/write filter entries for the same descriptor so the
        // caller sees exactly one readiness record per descriptor.
        let mut idents: SmallVec<[libc::uintptr_t; MAX_EVENTS]> = SmallVec::new();
        let mut out: SmallVec<[Readiness; MAX_EVENTS]> = SmallVec::new();
        for ev in &events[..n as usize] {
            let readable = ev.filter == libc::EVFILT_READ;
            let writable = ev.filter == libc::EVFILT_WRITE;
            let closed = ev.flags & (libc::EV_EOF | libc::EV_ERROR) != 0;
            let token = Token(ev.udata as usize as u64);

            if let Some(at) = idents.iter().position(|&id| id == ev.ident) {
                out[at].readable |= readable;
                out[at].writable |= writable;
                out[at].closed |= closed;
            } else {
                idents.push(ev.ident);
                out.push(Readiness {
                    token,
                    readable,
                    writable,
                    closed,
                });
            }
        }
        Ok(out)
    }
}

impl Drop for Kqueue {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: `kq` is owned by this instance and closed exactly once.
        unsafe {
            libc::close(self.kq);
        }
    }
}
