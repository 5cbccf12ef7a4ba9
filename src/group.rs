//! Group: all worker processes serving one application identity, plus the
//! per-group wait list, load balancer, restart and disable state machines

use crate::error::{DisableResult, PoolError, SpawnError, SpawnErrorKind};
use crate::options::Options;
use crate::pool::{Actions, DisableCallback, GetWaiter, Pool};
use crate::pqueue::PQueue;
use crate::process::{EnabledStatus, GroupRef, Process};
use crate::session::Session;
use crate::spawner::Spawner;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Group life-cycle, guarded by the Pool lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupLifeStatus {
    Alive,
    ShuttingDown,
    ShutDown,
}

/// Pool-level facts a Group needs while making scheduling decisions under
/// the lock
pub(crate) struct SchedulingContext<'a> {
    pub pool: &'a Arc<Pool>,
    pub super_group: &'a str,
    pub pool_at_full_capacity: bool,
    pub now_us: u64,
}

/// Pending disable command; completes when the process drains
pub(crate) struct DisableWaiter {
    pub gupid: String,
    pub callback: DisableCallback,
}

/// Stat-throttled watcher for restart.txt / always_restart.txt.
/// `restart.txt` triggers once per mtime change; `always_restart.txt`
/// triggers on every (unthrottled) check while it exists.
pub(crate) struct RestartFileChecker {
    restart_file: PathBuf,
    always_restart_file: PathBuf,
    last_mtime: Option<SystemTime>,
    last_check_us: u64,
}

impl RestartFileChecker {
    pub fn new(restart_dir: &PathBuf) -> Self {
        let restart_file = restart_dir.join("restart.txt");
        let last_mtime = mtime_of(&restart_file);
        Self {
            restart_file,
            always_restart_file: restart_dir.join("always_restart.txt"),
            last_mtime,
            last_check_us: 0,
        }
    }

    pub fn changed(&mut self, now_us: u64, throttle_secs: u64) -> bool {
        if throttle_secs > 0 && now_us < self.last_check_us + throttle_secs * 1_000_000 {
            return false;
        }
        self.last_check_us = now_us;
        if self.always_restart_file.exists() {
            return true;
        }
        let mtime = mtime_of(&self.restart_file);
        if mtime != self.last_mtime {
            self.last_mtime = mtime;
            return true;
        }
        false
    }
}

fn mtime_of(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub(crate) struct Group {
    /// Unique within the pool: `<super group name>#<component name>`
    pub name: String,
    pub component_name: String,
    /// Shared token for intra-group process communication
    pub secret: String,
    /// Most recently merged options for this identity
    pub options: Options,

    pub enabled: Vec<Arc<Process>>,
    pub disabling: Vec<Arc<Process>>,
    pub disabled: Vec<Arc<Process>>,
    /// Processes waiting for their OS process to die and sessions to drain
    pub detached: Vec<Arc<Process>>,
    /// Enabled processes ordered by utilization, least-utilized on top
    pub pqueue: PQueue<Arc<Process>>,

    pub get_waitlist: VecDeque<GetWaiter>,
    pub disable_waitlist: VecDeque<DisableWaiter>,

    pub spawner: Arc<Spawner>,
    pub spawning: bool,
    pub restarting: bool,
    /// Bumped on every restart; running spawn loops compare it and bail
    pub restarts_initiated: u64,

    pub life: GroupLifeStatus,
    restart_checker: RestartFileChecker,
    pub detached_checker_active: bool,
    /// Resolved when shutdown fully completes
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Group {
    pub fn new(
        super_group: &str,
        component_name: &str,
        options: Options,
        spawner: Arc<Spawner>,
        secret: String,
    ) -> Self {
        let restart_checker = RestartFileChecker::new(&options.restart_dir());
        Self {
            name: format!("{}#{}", super_group, component_name),
            component_name: component_name.to_string(),
            secret,
            options,
            enabled: Vec::new(),
            disabling: Vec::new(),
            disabled: Vec::new(),
            detached: Vec::new(),
            pqueue: PQueue::new(),
            get_waitlist: VecDeque::new(),
            disable_waitlist: VecDeque::new(),
            spawner,
            spawning: false,
            restarting: false,
            restarts_initiated: 0,
            life: GroupLifeStatus::Alive,
            restart_checker,
            detached_checker_active: false,
            shutdown_tx: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.life == GroupLifeStatus::Alive
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }

    pub fn process_count(&self) -> usize {
        self.enabled.len() + self.disabling.len() + self.disabled.len()
    }

    /// Capacity this group occupies in the pool; an in-flight spawn
    /// reserves one slot
    pub fn capacity_used(&self) -> usize {
        self.process_count() + if self.spawning { 1 } else { 0 }
    }

    /// Whether every enabled process is saturated
    pub fn all_enabled_at_full_utilization(&self) -> bool {
        match self.pqueue.top() {
            Some(process) => process.at_full_utilization(),
            None => true,
        }
    }

    /// Whether this group has queued demand it cannot serve and is not
    /// doing anything about it (used for capacity hand-off decisions)
    pub fn is_waiting_for_capacity(&self) -> bool {
        self.enabled.is_empty()
            && !self.spawning
            && !self.restarting
            && !self.get_waitlist.is_empty()
    }

    /// Spawn admission: below the minimum, or everyone saturated and both
    /// the group and pool ceilings leave room
    pub fn should_spawn(&self, pool_at_full_capacity: bool) -> bool {
        if self.spawning || self.restarting || !self.is_alive() || pool_at_full_capacity {
            return false;
        }
        if self.enabled_count() < self.options.min_processes {
            return true;
        }
        let below_group_ceiling =
            self.options.max_processes == 0 || self.enabled_count() < self.options.max_processes;
        !self.enabled.is_empty() && self.all_enabled_at_full_utilization() && below_group_ceiling
    }

    fn should_spawn_for_get(&self, pool_at_full_capacity: bool) -> bool {
        self.enabled.is_empty() || self.should_spawn(pool_at_full_capacity)
    }

    /// Lazily observed restart trigger
    fn needs_restart(&mut self, now_us: u64) -> bool {
        if self.restarting {
            return false;
        }
        let throttle = self.options.stat_throttle_rate_secs;
        self.restart_checker.changed(now_us, throttle)
    }

    /// The load balancer: hand out a session now (scheduling the callback
    /// to fire after the lock drops), or enqueue the caller and make sure
    /// something is being done about it. Returns whether a session was
    /// checked out synchronously.
    pub fn get(
        &mut self,
        new_options: &Options,
        callback: crate::pool::GetCallback,
        ctx: &SchedulingContext<'_>,
        actions: &mut Actions,
    ) -> bool {
        assert!(self.is_alive());

        if !self.restarting {
            if self.needs_restart(ctx.now_us) {
                info!(group = %self.name, "Restart file changed; restarting group");
                self.restart(self.options.clone(), ctx.pool, ctx.super_group);
            } else {
                self.options.merge(new_options);
            }
            if !self.restarting && self.should_spawn_for_get(ctx.pool_at_full_capacity) {
                self.spawn(ctx.pool, ctx.super_group);
            }
        }

        if self.enabled.is_empty() {
            // Processes are on the way. Disabling processes may stand in,
            // except during a restart (they run old code).
            if !self.disabling.is_empty() && !self.restarting {
                let candidate = least_utilized(&self.disabling)
                    .filter(|p| !p.at_full_utilization())
                    .cloned();
                if let Some(process) = candidate {
                    if let Some(session) = self.new_session_on(&process, ctx) {
                        actions.push(move || callback(Ok(session)));
                        return true;
                    }
                }
            }
            debug!(group = %self.name, "Queueing request: group is spawning or restarting");
            self.get_waitlist.push_back(GetWaiter {
                options: new_options.clone(),
                callback,
            });
            false
        } else {
            let top = Arc::clone(self.pqueue.top().expect("enabled processes exist"));
            if top.at_full_utilization() {
                debug!(group = %self.name, "Queueing request: all processes saturated");
                self.get_waitlist.push_back(GetWaiter {
                    options: new_options.clone(),
                    callback,
                });
                false
            } else {
                match self.new_session_on(&top, ctx) {
                    Some(session) => {
                        actions.push(move || callback(Ok(session)));
                        true
                    }
                    None => {
                        self.get_waitlist.push_back(GetWaiter {
                            options: new_options.clone(),
                            callback,
                        });
                        false
                    }
                }
            }
        }
    }

    /// Check out a session from the given process and refresh its place in
    /// the priority queue
    fn new_session_on(
        &mut self,
        process: &Arc<Process>,
        ctx: &SchedulingContext<'_>,
    ) -> Option<Session> {
        let socket_index = process.checkout_socket(ctx.now_us)?;
        self.refresh_priority(process);
        Some(Session::new(
            Arc::clone(process),
            Arc::downgrade(ctx.pool),
            socket_index,
        ))
    }

    /// Re-key a process in the queue after its utilization changed
    pub fn refresh_priority(&mut self, process: &Arc<Process>) {
        let state = process.state.lock();
        if state.enabled == EnabledStatus::Enabled {
            if let Some(handle) = state.pq_handle {
                let sessions = state.sessions;
                drop(state);
                let key = if process.concurrency == 0 {
                    if sessions == 0 {
                        0
                    } else {
                        1
                    }
                } else {
                    (sessions as u64 * i32::MAX as u64) / process.concurrency as u64
                };
                self.pqueue.update(handle, key);
            }
        }
    }

    fn add_to_enabled(&mut self, process: &Arc<Process>) {
        let handle = self.pqueue.push(Arc::clone(process), process.utilization());
        let mut state = process.state.lock();
        state.enabled = EnabledStatus::Enabled;
        state.pq_handle = Some(handle);
        drop(state);
        self.enabled.push(Arc::clone(process));
    }

    fn remove_from_list(list: &mut Vec<Arc<Process>>, process: &Arc<Process>) -> bool {
        match list.iter().position(|p| Arc::ptr_eq(p, process)) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    fn remove_from_current_list(&mut self, process: &Arc<Process>) {
        let status = process.enabled_status();
        match status {
            EnabledStatus::Enabled => {
                assert!(Self::remove_from_list(&mut self.enabled, process));
                let mut state = process.state.lock();
                if let Some(handle) = state.pq_handle.take() {
                    drop(state);
                    self.pqueue.remove(handle);
                }
            }
            EnabledStatus::Disabling => {
                assert!(Self::remove_from_list(&mut self.disabling, process));
            }
            EnabledStatus::Disabled => {
                assert!(Self::remove_from_list(&mut self.disabled, process));
            }
        }
    }

    /// Attach a freshly spawned process as enabled. Completes pending
    /// disable commands that the new capacity unblocks.
    pub fn attach(
        &mut self,
        process: &Arc<Process>,
        super_group: &str,
        actions: &mut Actions,
    ) {
        assert!(process.is_alive());
        assert!(self.is_alive());
        {
            let mut state = process.state.lock();
            state.group = Some(GroupRef {
                super_group: super_group.to_string(),
                component: self.component_name.clone(),
            });
        }
        debug!(group = %self.name, process = %process.describe(), "Attaching process");
        self.add_to_enabled(process);

        // Now that there is fresh capacity, drained DISABLING processes
        // can complete their disable
        let waiters: Vec<DisableWaiter> = self.disable_waitlist.drain(..).collect();
        for waiter in waiters {
            let target = self.find_process_anywhere(&waiter.gupid);
            match target {
                Some(p) if p.session_count() == 0 => {
                    if p.enabled_status() == EnabledStatus::Disabling {
                        self.remove_from_current_list(&p);
                        p.state.lock().enabled = EnabledStatus::Disabled;
                        self.disabled.push(Arc::clone(&p));
                    }
                    let callback = waiter.callback;
                    actions.push(move || callback(DisableResult::Success));
                }
                _ => self.disable_waitlist.push_back(waiter),
            }
        }
    }

    fn find_process_anywhere(&self, gupid: &str) -> Option<Arc<Process>> {
        self.enabled
            .iter()
            .chain(self.disabling.iter())
            .chain(self.disabled.iter())
            .find(|p| p.gupid == gupid)
            .cloned()
    }

    /// Detach a process: it stops receiving sessions, its admin channel is
    /// half-closed, and it is destroyed once drained and dead. The caller
    /// fixes pool-level waitlist invariants afterwards.
    pub fn detach(&mut self, process: &Arc<Process>, pool: &Arc<Pool>, actions: &mut Actions) {
        assert!(process.is_alive());
        assert!(self.is_alive());
        debug!(group = %self.name, process = %process.describe(), "Detaching process");

        let status = process.enabled_status();
        self.remove_from_current_list(process);
        if status == EnabledStatus::Disabling {
            self.complete_disable_waiters_for(&process.gupid, DisableResult::Noop, actions);
        }

        self.detached.push(Arc::clone(process));
        process.set_shutting_down();
        if process.can_be_shut_down() {
            self.shutdown_and_remove(process);
        } else {
            self.start_detached_checker(pool);
        }
    }

    /// Detach every process in the group (restart and shutdown paths)
    pub fn detach_all(&mut self, pool: &Arc<Pool>, actions: &mut Actions) {
        assert!(self.is_alive() || self.life == GroupLifeStatus::ShuttingDown);
        debug!(group = %self.name, "Detaching all processes");
        for process in self
            .enabled
            .drain(..)
            .chain(self.disabling.drain(..))
            .chain(self.disabled.drain(..))
            .collect::<Vec<_>>()
        {
            process.state.lock().pq_handle = None;
            process.set_shutting_down();
            self.detached.push(process);
        }
        self.pqueue.clear();
        self.clear_disable_waitlist(DisableResult::Noop, actions);
        self.reap_detached_processes();
        if !self.detached.is_empty() {
            self.start_detached_checker(pool);
        }
    }

    /// Re-enable a disabling or disabled process
    pub fn enable(&mut self, process: &Arc<Process>, actions: &mut Actions) {
        assert!(process.is_alive());
        assert!(self.is_alive());
        match process.enabled_status() {
            EnabledStatus::Disabling => {
                self.remove_from_current_list(process);
                self.add_to_enabled(process);
                self.complete_disable_waiters_for(
                    &process.gupid,
                    DisableResult::Canceled,
                    actions,
                );
            }
            EnabledStatus::Disabled => {
                self.remove_from_current_list(process);
                self.add_to_enabled(process);
            }
            EnabledStatus::Enabled => {}
        }
    }

    /// Disable a process: move it out of rotation once its sessions drain.
    /// Deferred completions land on the disable waitlist.
    pub fn disable(
        &mut self,
        process: &Arc<Process>,
        callback: DisableCallback,
        ctx: &SchedulingContext<'_>,
    ) -> DisableResult {
        assert!(process.is_alive());
        assert!(self.is_alive());
        match process.enabled_status() {
            EnabledStatus::Enabled => {
                if self.enabled_count() <= 1 || process.session_count() > 0 {
                    self.remove_from_current_list(process);
                    process.state.lock().enabled = EnabledStatus::Disabling;
                    self.disabling.push(Arc::clone(process));
                    self.disable_waitlist.push_back(DisableWaiter {
                        gupid: process.gupid.clone(),
                        callback,
                    });
                    if self.enabled.is_empty() {
                        // The last enabled process is going away; spawn a
                        // replacement so requests keep flowing
                        debug!(group = %self.name, "Spawning replacement for disabling process");
                        self.spawn(ctx.pool, ctx.super_group);
                    }
                    DisableResult::Deferred
                } else {
                    // Immediate completion: the caller reads the return
                    // value, the callback is only for deferred results
                    self.remove_from_current_list(process);
                    process.state.lock().enabled = EnabledStatus::Disabled;
                    self.disabled.push(Arc::clone(process));
                    drop(callback);
                    DisableResult::Success
                }
            }
            EnabledStatus::Disabling => {
                self.disable_waitlist.push_back(DisableWaiter {
                    gupid: process.gupid.clone(),
                    callback,
                });
                DisableResult::Deferred
            }
            EnabledStatus::Disabled => {
                drop(callback);
                DisableResult::Noop
            }
        }
    }

    /// A DISABLING process finished its last session while enabled
    /// processes remain: complete its transition to DISABLED
    pub fn remove_disabling_process_that_drained(
        &mut self,
        process: &Arc<Process>,
        actions: &mut Actions,
    ) {
        assert_eq!(process.enabled_status(), EnabledStatus::Disabling);
        assert_eq!(process.session_count(), 0);
        self.remove_from_current_list(process);
        process.state.lock().enabled = EnabledStatus::Disabled;
        self.disabled.push(Arc::clone(process));
        self.complete_disable_waiters_for(&process.gupid, DisableResult::Success, actions);
    }

    /// Fire the queued disable callbacks for one process
    pub fn complete_disable_waiters_for(
        &mut self,
        gupid: &str,
        result: DisableResult,
        actions: &mut Actions,
    ) {
        let mut remaining = VecDeque::new();
        for waiter in self.disable_waitlist.drain(..) {
            if waiter.gupid == gupid {
                let callback = waiter.callback;
                actions.push(move || callback(result));
            } else {
                remaining.push_back(waiter);
            }
        }
        self.disable_waitlist = remaining;
    }

    pub fn clear_disable_waitlist(&mut self, result: DisableResult, actions: &mut Actions) {
        for waiter in self.disable_waitlist.drain(..) {
            let callback = waiter.callback;
            actions.push(move || callback(result));
        }
    }

    /// After a failed spawn with no enabled processes, put every disabling
    /// process back into rotation
    pub fn enable_all_disabling_processes(&mut self, actions: &mut Actions) {
        let processes: Vec<Arc<Process>> = self.disabling.clone();
        for process in processes {
            self.remove_from_current_list(&process);
            self.add_to_enabled(&process);
        }
        self.clear_disable_waitlist(DisableResult::Error, actions);
    }

    /// Hand out sessions to as many queued callers as current capacity
    /// allows. Runs after a spawn completes, a session closes, or
    /// processes get re-enabled.
    pub fn assign_sessions_to_get_waiters(
        &mut self,
        ctx: &SchedulingContext<'_>,
        actions: &mut Actions,
    ) {
        if !self.enabled.is_empty() {
            while !self.get_waitlist.is_empty() {
                let top = match self.pqueue.top() {
                    Some(process) if !process.at_full_utilization() => Arc::clone(process),
                    _ => break,
                };
                let waiter = self.get_waitlist.pop_front().expect("waitlist is non-empty");
                match self.new_session_on(&top, ctx) {
                    Some(session) => {
                        let callback = waiter.callback;
                        actions.push(move || callback(Ok(session)));
                    }
                    None => {
                        self.get_waitlist.push_front(waiter);
                        break;
                    }
                }
            }
        } else if !self.disabling.is_empty() {
            while !self.get_waitlist.is_empty() {
                let process = match least_utilized(&self.disabling) {
                    Some(process) if !process.at_full_utilization() => Arc::clone(process),
                    _ => break,
                };
                let waiter = self.get_waitlist.pop_front().expect("waitlist is non-empty");
                match self.new_session_on(&process, ctx) {
                    Some(session) => {
                        let callback = waiter.callback;
                        actions.push(move || callback(Ok(session)));
                    }
                    None => {
                        self.get_waitlist.push_front(waiter);
                        break;
                    }
                }
            }
        }
    }

    /// Fail only the caller at the head of the queue, the one whose get
    /// triggered the failed spawn; callers behind it may still be retried
    pub fn fail_first_get_waiter(&mut self, error: &SpawnError, actions: &mut Actions) {
        if let Some(waiter) = self.get_waitlist.pop_front() {
            let callback = waiter.callback;
            let err = error.clone();
            actions.push(move || callback(Err(PoolError::Spawn(err))));
        }
    }

    /// Fail every queued caller (spawn error, shutdown)
    pub fn assign_error_to_get_waiters(&mut self, error: &SpawnError, actions: &mut Actions) {
        for waiter in self.get_waitlist.drain(..) {
            let callback = waiter.callback;
            let err = error.clone();
            actions.push(move || callback(Err(PoolError::Spawn(err))));
        }
    }

    pub fn abort_get_waiters(&mut self, reason: &str, actions: &mut Actions) {
        for waiter in self.get_waitlist.drain(..) {
            let callback = waiter.callback;
            let reason = reason.to_string();
            actions.push(move || callback(Err(PoolError::GetAborted(reason))));
        }
    }

    /// Kick off the background spawn loop unless one is already running or
    /// the group is restarting
    pub fn spawn(&mut self, pool: &Arc<Pool>, super_group: &str) {
        if self.spawning || self.restarting || !self.is_alive() {
            return;
        }
        debug!(group = %self.name, "Starting spawn loop");
        self.spawning = true;
        let pool = Arc::clone(pool);
        let super_group = super_group.to_string();
        let component = self.component_name.clone();
        let spawner = Arc::clone(&self.spawner);
        let options = self.options.clone();
        let generation = self.restarts_initiated;
        tokio::spawn(crate::pool::spawn_loop(
            pool,
            super_group,
            component,
            spawner,
            options,
            generation,
        ));
    }

    /// Enter RESTARTING: drop every current process, build a fresh spawner
    /// in the background, and leave RESTARTING once it is in place. Queued
    /// and new callers wait on the get waitlist meanwhile.
    pub fn restart(&mut self, options: Options, pool: &Arc<Pool>, super_group: &str) {
        assert!(self.is_alive());
        assert!(!self.restarting);
        info!(group = %self.name, "Restarting group");
        self.restarts_initiated += 1;
        self.spawning = false;
        self.restarting = true;
        self.options = options.clone();
        let mut actions = Actions::new();
        self.detach_all(pool, &mut actions);
        let pool_arc = Arc::clone(pool);
        let super_group = super_group.to_string();
        let component = self.component_name.clone();
        let generation = self.restarts_initiated;
        let old_spawner = Arc::clone(&self.spawner);
        tokio::spawn(async move {
            actions.run();
            old_spawner.cleanup().await;
            crate::pool::finalize_restart(pool_arc, super_group, component, options, generation)
                .await;
        });
    }

    /// Begin shutting the group down: abort waiters, detach everything and
    /// schedule the spawner cleanup. Returns a receiver that resolves once
    /// every detached process is gone.
    pub fn begin_shutdown(
        &mut self,
        pool: &Arc<Pool>,
        actions: &mut Actions,
    ) -> oneshot::Receiver<()> {
        assert!(self.is_alive());
        debug!(group = %self.name, "Shutting down group");
        let (tx, rx) = oneshot::channel();
        self.shutdown_tx = Some(tx);
        self.abort_get_waiters("The containing group is being shut down", actions);
        self.detach_all(pool, actions);
        let spawner = Arc::clone(&self.spawner);
        actions.push(move || {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { spawner.cleanup().await });
            }
        });
        self.life = GroupLifeStatus::ShuttingDown;
        self.try_finish_shutdown();
        rx
    }

    /// Destroy detached processes that are drained and dead
    pub fn reap_detached_processes(&mut self) {
        let mut index = 0;
        while index < self.detached.len() {
            if self.detached[index].can_be_shut_down() {
                let process = self.detached.remove(index);
                debug!(process = %process.describe(), "Detached process has exited");
                process.shutdown();
            } else {
                index += 1;
            }
        }
    }

    fn shutdown_and_remove(&mut self, process: &Arc<Process>) {
        assert!(process.can_be_shut_down());
        if Self::remove_from_list(&mut self.detached, process) {
            process.shutdown();
        }
    }

    /// Complete shutdown once nothing references a live worker anymore
    pub fn try_finish_shutdown(&mut self) {
        if self.life == GroupLifeStatus::ShuttingDown
            && self.process_count() == 0
            && self.detached.is_empty()
        {
            debug!(group = %self.name, "Group shutdown finished");
            self.life = GroupLifeStatus::ShutDown;
            if let Some(tx) = self.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    fn start_detached_checker(&mut self, pool: &Arc<Pool>) {
        if self.detached_checker_active || self.detached.is_empty() {
            return;
        }
        self.detached_checker_active = true;
        let sg = match self.name.split_once('#') {
            Some((sg, _)) => sg.to_string(),
            None => self.name.clone(),
        };
        tokio::spawn(crate::pool::detached_processes_checker(
            Arc::clone(pool),
            sg,
            self.component_name.clone(),
        ));
    }

    pub(crate) fn inspect_xml(&self, out: &mut String, now_us: u64, include_secrets: bool) {
        use crate::util::escape_for_xml;
        use std::fmt::Write as _;
        let _ = write!(out, "<name>{}</name>", escape_for_xml(&self.name));
        let _ = write!(
            out,
            "<component_name>{}</component_name>",
            escape_for_xml(&self.component_name)
        );
        let _ = write!(
            out,
            "<app_root>{}</app_root>",
            escape_for_xml(&self.options.app_root)
        );
        let _ = write!(
            out,
            "<app_type>{}</app_type>",
            self.options.app_type.as_str()
        );
        let _ = write!(
            out,
            "<environment>{}</environment>",
            escape_for_xml(&self.options.environment)
        );
        let _ = write!(
            out,
            "<enabled_process_count>{}</enabled_process_count>",
            self.enabled.len()
        );
        let _ = write!(
            out,
            "<disabling_process_count>{}</disabling_process_count>",
            self.disabling.len()
        );
        let _ = write!(
            out,
            "<disabled_process_count>{}</disabled_process_count>",
            self.disabled.len()
        );
        let _ = write!(out, "<utilization>{}</utilization>", self.capacity_used());
        let _ = write!(
            out,
            "<get_wait_list_size>{}</get_wait_list_size>",
            self.get_waitlist.len()
        );
        let _ = write!(
            out,
            "<disable_wait_list_size>{}</disable_wait_list_size>",
            self.disable_waitlist.len()
        );
        if self.spawning {
            out.push_str("<spawning/>");
        }
        if self.restarting {
            out.push_str("<restarting/>");
        }
        if include_secrets {
            let _ = write!(out, "<secret>{}</secret>", escape_for_xml(&self.secret));
        }
        let life = match self.life {
            GroupLifeStatus::Alive => "alive",
            GroupLifeStatus::ShuttingDown => "shutting_down",
            GroupLifeStatus::ShutDown => "shut_down",
        };
        let _ = write!(out, "<life_status>{}</life_status>", life);
        out.push_str("<processes>");
        for process in self
            .enabled
            .iter()
            .chain(self.disabling.iter())
            .chain(self.disabled.iter())
            .chain(self.detached.iter())
        {
            out.push_str("<process>");
            process.inspect_xml(out, now_us, true);
            out.push_str("</process>");
        }
        out.push_str("</processes>");
    }
}

/// Least-utilized process in a plain list (used for the disabling list,
/// which is not heap-ordered)
pub(crate) fn least_utilized(processes: &[Arc<Process>]) -> Option<&Arc<Process>> {
    processes.iter().min_by_key(|p| p.utilization())
}

/// Spawn-shaped error for failures that happen outside a negotiation
pub(crate) fn internal_spawn_error(message: &str) -> SpawnError {
    SpawnError::new(SpawnErrorKind::InternalError, message)
}
