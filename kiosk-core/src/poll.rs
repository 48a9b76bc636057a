//! Readiness Polling
//!
//! Thin wrapper over `poll(2)` used by the server and client to multiplex
//! every socket they own in one bounded wait.

use std::os::unix::io::RawFd;
use std::time::Duration;

/// Interest registered for one descriptor
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

/// Readiness reported for one descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error, hangup or invalid descriptor
    pub closed: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.closed
    }
}

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

/// Wait until at least one descriptor is ready or `timeout` expires.
///
/// Returns one [`Readiness`] per interest, in the same order. An interrupted
/// wait reports nothing ready rather than an error.
pub fn wait_for_readiness(
    interests: &[Interest],
    timeout: Duration,
) -> std::io::Result<Vec<Readiness>> {
    let mut pollfds: Vec<libc::pollfd> = interests
        .iter()
        .map(|interest| {
            let mut events = 0;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }
            libc::pollfd {
                fd: interest.fd,
                events,
                revents: 0,
            }
        })
        .collect();

    if pollfds.is_empty() {
        std::thread::sleep(timeout);
        return Ok(Vec::new());
    }

    // SAFETY: pollfds is a valid, exclusively borrowed array of nfds entries
    let result = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms(timeout),
        )
    };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(vec![Readiness::default(); interests.len()]);
        }
        return Err(err);
    }

    Ok(pollfds
        .iter()
        .map(|pfd| Readiness {
            readable: pfd.revents & libc::POLLIN != 0,
            writable: pfd.revents & libc::POLLOUT != 0,
            closed: pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
        })
        .collect())
}

/// Wait for a single descriptor to become writable
pub fn wait_writable(fd: RawFd, timeout: Duration) -> std::io::Result<Readiness> {
    let ready = wait_for_readiness(
        &[Interest {
            fd,
            read: false,
            write: true,
        }],
        timeout,
    )?;
    Ok(ready.into_iter().next().unwrap_or_default())
}
