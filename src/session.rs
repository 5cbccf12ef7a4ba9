//! A checked-out connection slot on one worker socket

use crate::process::Process;
use crate::socket::SocketAddress;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// One in-flight request's claim on a worker. Holding a Session keeps the
/// Process object alive even past the death of the OS process; closing it
/// (explicitly or by drop) returns the capacity to the pool and may wake
/// queued requests.
pub struct Session {
    process: Arc<Process>,
    pool: Weak<crate::pool::Pool>,
    socket_index: usize,
    address: SocketAddress,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        process: Arc<Process>,
        pool: Weak<crate::pool::Pool>,
        socket_index: usize,
    ) -> Self {
        let address = {
            let state = process.state.lock();
            state
                .sockets
                .get(socket_index)
                .expect("session socket index is valid")
                .address
                .clone()
        };
        Self {
            process,
            pool,
            socket_index,
            address,
            closed: AtomicBool::new(false),
        }
    }

    /// Address the request handler connects to for this session
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    pub fn pid(&self) -> i32 {
        self.process.pid
    }

    pub fn gupid(&self) -> &str {
        &self.process.gupid
    }

    pub fn connect_password(&self) -> &str {
        &self.process.connect_password
    }

    pub(crate) fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Called when a response carried the out-of-band-work hint: once this
    /// session count drains to zero the pool temporarily disables the
    /// worker and lets it run its maintenance hook.
    pub fn request_oobw(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.request_oobw(&self.process);
        }
    }

    /// Return the session to the pool. Safe to call more than once; only
    /// the first call does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.session_closed(&self.process, self.socket_index);
        } else {
            // Pool is gone; at least keep the process counters sane
            self.process.checkin_socket(self.socket_index);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.process.pid)
            .field("gupid", &self.process.gupid)
            .field("address", &self.address)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
