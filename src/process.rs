//! A single spawned worker process and its bookkeeping

use crate::metrics::{self, ProcessMetrics};
use crate::pqueue::{Handle, PQueue};
use crate::socket::{SocketAddress, SocketList};
use crate::util;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::{Child, ChildStdin};
use tracing::debug;

/// Coarse life-cycle of a Process object. A Process outlives its OS
/// process: it stays in `ShuttingDown` until the OS process is gone and
/// the last session has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeStatus {
    Alive,
    ShuttingDown,
    ShutDown,
}

impl LifeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifeStatus::Alive => "alive",
            LifeStatus::ShuttingDown => "shutting_down",
            LifeStatus::ShutDown => "shut_down",
        }
    }
}

/// Whether the process may receive new sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledStatus {
    Enabled,
    Disabling,
    Disabled,
}

impl EnabledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnabledStatus::Enabled => "enabled",
            EnabledStatus::Disabling => "disabling",
            EnabledStatus::Disabled => "disabled",
        }
    }
}

/// Write end of the worker's admin channel. Dropping it half-closes the
/// channel, which tells the worker to finish its work and exit.
#[derive(Debug)]
pub enum AdminChannel {
    /// Direct-spawned workers talk over their stdin pipe
    Pipe(ChildStdin),
    /// Preloader-spawned workers talk over a unix socket
    Stream(tokio::net::unix::OwnedWriteHalf),
}

/// Back-handle from a Process to the Group that owns it, resolved only
/// under the Pool lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub super_group: String,
    pub component: String,
}

/// Mutable part of a Process. Only ever touched while the Pool lock is
/// held; the lock on this struct exists because Sessions and background
/// tasks reach the Process without going through Pool fields.
#[derive(Debug)]
pub(crate) struct ProcessState {
    pub admin: Option<AdminChannel>,
    /// Child handle for direct-spawned workers, kept for reaping
    pub child: Option<Child>,
    pub sockets: SocketList,
    /// Session sockets ordered by utilization
    pub session_pq: PQueue<usize>,
    /// Back-handles into `session_pq`, indexed by socket position
    session_pq_handles: Vec<Option<Handle>>,
    pub sessions: usize,
    pub processed: u64,
    pub spawn_end_time_us: u64,
    pub last_used_us: u64,
    pub enabled: EnabledStatus,
    pub oobw_requested: bool,
    pub metrics: Option<ProcessMetrics>,
    pub group: Option<GroupRef>,
    /// Back-handle into the owning Group's process queue
    pub pq_handle: Option<Handle>,
}

/// Arguments for building a Process after successful negotiation
pub(crate) struct NewProcess {
    pub pid: i32,
    pub gupid: String,
    pub connect_password: String,
    pub admin: Option<AdminChannel>,
    pub child: Option<Child>,
    pub sockets: SocketList,
    pub spawner_creation_time_us: u64,
    pub spawn_start_time_us: u64,
    pub now_us: u64,
}

/// One worker OS process. Read-only fields are set at construction;
/// everything mutable lives in [`ProcessState`] under the Pool lock.
#[derive(Debug)]
pub struct Process {
    pub pid: i32,
    /// Globally unique id, shows up in logs and admin commands
    pub gupid: String,
    pub connect_password: String,
    /// Fake process used by the dummy spawner; has no OS process behind it
    pub dummy: bool,
    pub spawner_creation_time_us: u64,
    pub spawn_start_time_us: u64,
    /// Aggregate concurrency of the session sockets; 0 means unlimited
    pub concurrency: usize,
    /// Caches a negative liveness probe so a recycled PID is never pinged
    os_exists: AtomicBool,
    life: Mutex<LifeStatus>,
    pub(crate) state: Mutex<ProcessState>,
}

impl Process {
    pub(crate) fn new(args: NewProcess) -> Self {
        let concurrency = args.sockets.total_concurrency();
        let mut session_pq = PQueue::new();
        let mut session_pq_handles = vec![None; args.sockets.len()];
        for index in args.sockets.session_socket_indexes() {
            let key = args.sockets.get(index).map(|s| s.utilization()).unwrap_or(0);
            session_pq_handles[index] = Some(session_pq.push(index, key));
        }
        Self {
            pid: args.pid,
            gupid: args.gupid,
            connect_password: args.connect_password,
            dummy: false,
            spawner_creation_time_us: args.spawner_creation_time_us,
            spawn_start_time_us: args.spawn_start_time_us,
            concurrency,
            os_exists: AtomicBool::new(true),
            life: Mutex::new(LifeStatus::Alive),
            state: Mutex::new(ProcessState {
                admin: args.admin,
                child: args.child,
                sockets: args.sockets,
                session_pq,
                session_pq_handles,
                sessions: 0,
                processed: 0,
                spawn_end_time_us: args.now_us,
                last_used_us: args.now_us,
                enabled: EnabledStatus::Enabled,
                oobw_requested: false,
                metrics: None,
                group: None,
                pq_handle: None,
            }),
        }
    }

    /// Build a fake process for the dummy spawner: one session socket with
    /// the given concurrency, no OS process behind it
    pub(crate) fn dummy(args: NewProcess, concurrency: usize) -> Self {
        let mut sockets = SocketList::new();
        sockets.add(crate::socket::Socket {
            name: "main".to_string(),
            address: SocketAddress::Unix(format!("/tmp/dummy.{}", args.pid).into()),
            protocol: "session".to_string(),
            concurrency,
            sessions: 0,
        });
        let mut process = Process::new(NewProcess {
            sockets,
            admin: None,
            child: None,
            ..args
        });
        process.dummy = true;
        process
    }

    // Life status, readable from any thread

    pub fn is_alive(&self) -> bool {
        *self.life.lock() == LifeStatus::Alive
    }

    pub fn is_shut_down(&self) -> bool {
        *self.life.lock() == LifeStatus::ShutDown
    }

    pub fn life_status(&self) -> LifeStatus {
        *self.life.lock()
    }

    /// Mark the process as shutting down and half-close the admin channel,
    /// the signal for the worker to exit gracefully.
    pub(crate) fn set_shutting_down(&self) {
        {
            let mut life = self.life.lock();
            assert_eq!(*life, LifeStatus::Alive);
            *life = LifeStatus::ShuttingDown;
        }
        if !self.dummy {
            let mut state = self.state.lock();
            state.admin.take();
            if let Some(mut child) = state.child.take() {
                // Reap in the background; the worker exits on its own once
                // the admin channel closes
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let pid = self.pid;
                    handle.spawn(async move {
                        let status = child.wait().await;
                        debug!(pid, ?status, "Worker process reaped");
                    });
                }
            }
        }
    }

    /// Final teardown. May only run when no sessions are open; removes
    /// unix socket files the worker left behind.
    pub(crate) fn shutdown(&self) {
        let life = self.life_status();
        if life == LifeStatus::ShutDown {
            return;
        }
        if life == LifeStatus::Alive {
            self.set_shutting_down();
        }
        let state = self.state.lock();
        assert_eq!(state.sessions, 0);
        if !self.dummy {
            for socket in state.sockets.iter() {
                if let SocketAddress::Unix(path) = &socket.address {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        drop(state);
        *self.life.lock() = LifeStatus::ShutDown;
    }

    pub(crate) fn can_be_shut_down(&self) -> bool {
        self.state.lock().sessions == 0 && !self.os_process_exists()
    }

    /// Whether the OS process still exists. A negative result sticks, so
    /// a recycled PID is never probed again.
    pub fn os_process_exists(&self) -> bool {
        if self.dummy || !self.os_exists.load(Ordering::Relaxed) {
            return false;
        }
        let exists = metrics::os_process_exists(self.pid);
        if !exists {
            self.os_exists.store(false, Ordering::Relaxed);
        }
        exists
    }

    /// Saturation in [0, i32::MAX]: 0 is idle, i32::MAX is at capacity.
    /// Unlimited-concurrency processes report 1 when busy so idle ones
    /// still win the priority queue.
    pub fn utilization(&self) -> u64 {
        let sessions = self.state.lock().sessions;
        self.utilization_for(sessions)
    }

    fn utilization_for(&self, sessions: usize) -> u64 {
        if self.concurrency == 0 {
            if sessions == 0 {
                0
            } else {
                1
            }
        } else {
            (sessions as u64 * i32::MAX as u64) / self.concurrency as u64
        }
    }

    pub fn at_full_utilization(&self) -> bool {
        self.concurrency != 0 && self.state.lock().sessions >= self.concurrency
    }

    /// Check out the least-utilized session socket. Returns the socket
    /// index, or None if every session socket is saturated. Counters and
    /// both priority queues are updated; the caller wraps the result in a
    /// Session.
    pub(crate) fn checkout_socket(&self, now_us: u64) -> Option<usize> {
        let mut state = self.state.lock();
        let index = *state.session_pq.top()?;
        let socket = state.sockets.get(index)?;
        if socket.at_full_capacity() {
            return None;
        }
        let socket = state.sockets.get_mut(index).expect("index from session_pq");
        socket.sessions += 1;
        let key = socket.utilization();
        let handle = state.session_pq_handles[index].expect("session socket has a handle");
        state.session_pq.update(handle, key);
        state.sessions += 1;
        state.processed += 1;
        state.last_used_us = now_us;
        Some(index)
    }

    /// Undo one `checkout_socket`
    pub(crate) fn checkin_socket(&self, index: usize) {
        let mut state = self.state.lock();
        assert!(state.sessions > 0);
        let socket = state
            .sockets
            .get_mut(index)
            .expect("socket index from an open session");
        assert!(socket.sessions > 0);
        socket.sessions -= 1;
        let key = socket.utilization();
        let handle = state.session_pq_handles[index].expect("session socket has a handle");
        state.session_pq.update(handle, key);
        state.sessions -= 1;
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions
    }

    pub fn processed_count(&self) -> u64 {
        self.state.lock().processed
    }

    pub fn last_used_us(&self) -> u64 {
        self.state.lock().last_used_us
    }

    pub(crate) fn group_ref(&self) -> Option<GroupRef> {
        self.state.lock().group.clone()
    }

    pub fn enabled_status(&self) -> EnabledStatus {
        self.state.lock().enabled
    }

    pub fn uptime(&self, now_us: u64) -> String {
        util::distance_of_time_in_words(self.state.lock().spawn_end_time_us, now_us)
    }

    /// Short log representation
    pub fn describe(&self) -> String {
        match self.group_ref() {
            Some(group) => format!("(pid={}, group={})", self.pid, group.super_group),
            None => format!("(pid={})", self.pid),
        }
    }

    pub(crate) fn inspect_xml(&self, out: &mut String, now_us: u64, include_sockets: bool) {
        let state = self.state.lock();
        let _ = write!(out, "<pid>{}</pid>", self.pid);
        let _ = write!(out, "<gupid>{}</gupid>", util::escape_for_xml(&self.gupid));
        let _ = write!(out, "<concurrency>{}</concurrency>", self.concurrency);
        let _ = write!(out, "<sessions>{}</sessions>", state.sessions);
        let _ = write!(
            out,
            "<utilization>{}</utilization>",
            self.utilization_for(state.sessions)
        );
        let _ = write!(out, "<processed>{}</processed>", state.processed);
        let _ = write!(
            out,
            "<spawner_creation_time>{}</spawner_creation_time>",
            self.spawner_creation_time_us
        );
        let _ = write!(
            out,
            "<spawn_start_time>{}</spawn_start_time>",
            self.spawn_start_time_us
        );
        let _ = write!(
            out,
            "<spawn_end_time>{}</spawn_end_time>",
            state.spawn_end_time_us
        );
        let _ = write!(out, "<last_used>{}</last_used>", state.last_used_us);
        let _ = write!(
            out,
            "<uptime>{}</uptime>",
            util::distance_of_time_in_words(state.spawn_end_time_us, now_us)
        );
        let _ = write!(
            out,
            "<life_status>{}</life_status>",
            self.life_status().as_str()
        );
        let _ = write!(out, "<enabled>{}</enabled>", state.enabled.as_str());
        if let Some(metrics) = &state.metrics {
            let _ = write!(out, "<cpu>{:.1}</cpu>", metrics.cpu_percent);
            let _ = write!(out, "<rss>{}</rss>", metrics.rss_kb);
        }
        if include_sockets {
            out.push_str("<sockets>");
            for socket in state.sockets.iter() {
                out.push_str("<socket>");
                let _ = write!(out, "<name>{}</name>", util::escape_for_xml(&socket.name));
                let _ = write!(
                    out,
                    "<address>{}</address>",
                    util::escape_for_xml(&socket.address.to_string())
                );
                let _ = write!(
                    out,
                    "<protocol>{}</protocol>",
                    util::escape_for_xml(&socket.protocol)
                );
                let _ = write!(out, "<concurrency>{}</concurrency>", socket.concurrency);
                let _ = write!(out, "<sessions>{}</sessions>", socket.sessions);
                out.push_str("</socket>");
            }
            out.push_str("</sockets>");
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // Catch leaks of un-shut-down processes in debug builds
        debug_assert!(
            self.is_shut_down() || self.dummy,
            "Process dropped without shutdown()"
        );
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::dummy_process;
    use super::*;

    #[test]
    fn test_checkout_and_checkin() {
        let process = dummy_process(100, 2, 1_000);
        assert_eq!(process.utilization(), 0);

        let s1 = process.checkout_socket(2_000).unwrap();
        assert_eq!(process.session_count(), 1);
        assert_eq!(process.processed_count(), 1);
        assert_eq!(process.last_used_us(), 2_000);
        assert!(!process.at_full_utilization());

        let _s2 = process.checkout_socket(3_000).unwrap();
        assert!(process.at_full_utilization());
        assert_eq!(process.utilization(), i32::MAX as u64);

        // Saturated: no third checkout
        assert!(process.checkout_socket(4_000).is_none());

        process.checkin_socket(s1);
        assert_eq!(process.session_count(), 1);
        assert!(!process.at_full_utilization());
        assert!(process.checkout_socket(5_000).is_some());
    }

    #[test]
    fn test_unlimited_concurrency_utilization() {
        let process = dummy_process(101, 0, 0);
        assert_eq!(process.utilization(), 0);
        let _s = process.checkout_socket(1).unwrap();
        assert_eq!(process.utilization(), 1);
        assert!(!process.at_full_utilization());
    }

    #[test]
    fn test_dummy_has_no_os_process() {
        let process = dummy_process(102, 1, 0);
        assert!(!process.os_process_exists());
        assert!(process.can_be_shut_down());
    }

    #[test]
    fn test_life_status_transitions() {
        let process = dummy_process(103, 1, 0);
        assert!(process.is_alive());
        process.set_shutting_down();
        assert_eq!(process.life_status(), LifeStatus::ShuttingDown);
        process.shutdown();
        assert!(process.is_shut_down());
        // Idempotent
        process.shutdown();
        assert!(process.is_shut_down());
    }

    #[test]
    fn test_inspect_xml_contains_counters() {
        let process = dummy_process(104, 4, 0);
        let _s = process.checkout_socket(10).unwrap();
        let mut out = String::new();
        process.inspect_xml(&mut out, 20, true);
        assert!(out.contains("<pid>104</pid>"));
        assert!(out.contains("<sessions>1</sessions>"));
        assert!(out.contains("<life_status>alive</life_status>"));
        assert!(out.contains("<enabled>enabled</enabled>"));
        assert!(out.contains("<protocol>session</protocol>"));
        process.shutdown();
    }
}
