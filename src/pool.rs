//! The pool: admission control, capacity accounting, eviction, wait-list
//! draining and the background garbage collector / metrics collector.
//!
//! One coarse mutex guards all scheduling state. Blocking work never
//! happens under it: callbacks and I/O collected during a lock-held
//! decision are stored on a post-lock action list and run after unlock.

use crate::config::{Config, ResourceLocator};
use crate::error::{DisableResult, PoolError, SpawnError};
use crate::group::{internal_spawn_error, Group, GroupLifeStatus, SchedulingContext};
use crate::metrics::{CollectError, ProcessMetricsCollector};
use crate::options::Options;
use crate::process::{EnabledStatus, GroupRef, LifeStatus, Process};
use crate::session::Session;
use crate::spawner::{Spawner, SpawnerConfig, SpawnerContext, SpawnerFactory};
use crate::supergroup::{SuperGroup, SuperGroupState};
use crate::util::{SystemTimeSource, TimeSource};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info, warn};

/// Continuation invoked with the outcome of an asynchronous get. Runs
/// strictly after the pool lock has been released and must never
/// reacquire it synchronously.
pub type GetCallback = Box<dyn FnOnce(Result<Session, PoolError>) + Send + 'static>;

/// Continuation for deferred disable commands
pub type DisableCallback = Box<dyn FnOnce(DisableResult) + Send + 'static>;

/// A queued get request
pub(crate) struct GetWaiter {
    pub options: Options,
    pub callback: GetCallback,
}

/// Closures scheduled during a lock-held decision, run after unlock
pub(crate) struct Actions {
    list: Vec<Box<dyn FnOnce() + Send>>,
}

impl Actions {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn push<F: FnOnce() + Send + 'static>(&mut self, f: F) {
        self.list.push(Box::new(f));
    }

    pub fn run(self) {
        for action in self.list {
            action();
        }
    }
}

/// Rendering options for `Pool::inspect`
#[derive(Debug, Clone, Copy, Default)]
pub struct InspectOptions {
    pub colorize: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolLifeStatus {
    Alive,
    ShuttingDown,
    ShutDown,
}

pub(crate) struct PoolInner {
    pub life: PoolLifeStatus,
    pub max: usize,
    pub max_idle_time: Duration,
    pub super_groups: HashMap<String, SuperGroup>,
    /// Requests whose app group is absent and for which no capacity could
    /// be freed. Invariants: non-empty implies the pool is at full
    /// capacity, and no entry's app group is present in `super_groups`.
    pub get_waitlist: VecDeque<GetWaiter>,
}

impl PoolInner {
    pub fn process_count(&self) -> usize {
        self.super_groups.values().map(|sg| sg.process_count()).sum()
    }

    /// Capacity in use: live processes plus in-flight spawns
    pub fn capacity_used(&self) -> usize {
        self.super_groups.values().map(|sg| sg.capacity_used()).sum()
    }

    pub fn at_full_capacity(&self) -> bool {
        self.capacity_used() >= self.max
    }

    pub fn find_group_mut(&mut self, super_group: &str, component: &str) -> Option<&mut Group> {
        self.super_groups
            .get_mut(super_group)
            .and_then(|sg| sg.groups.iter_mut().find(|g| g.component_name == component))
    }

    fn group_keys(&self) -> Vec<(String, String)> {
        let mut keys = Vec::new();
        for (name, sg) in &self.super_groups {
            for group in &sg.groups {
                keys.push((name.clone(), group.component_name.clone()));
            }
        }
        keys
    }

    fn for_each_process<F: FnMut(&Arc<Process>)>(&self, mut f: F) {
        for sg in self.super_groups.values() {
            for group in &sg.groups {
                for process in group
                    .enabled
                    .iter()
                    .chain(group.disabling.iter())
                    .chain(group.disabled.iter())
                {
                    f(process);
                }
            }
        }
    }

    pub fn find_process_by_gupid(&self, gupid: &str) -> Option<Arc<Process>> {
        let mut found = None;
        self.for_each_process(|process| {
            if found.is_none() && process.gupid == gupid {
                found = Some(Arc::clone(process));
            }
        });
        found
    }

    /// Oldest process that is idle and whose group can spare it
    fn find_oldest_idle_process(&self) -> Option<Arc<Process>> {
        let mut best: Option<Arc<Process>> = None;
        for sg in self.super_groups.values() {
            for group in &sg.groups {
                if group.enabled.len() <= group.options.min_processes {
                    continue;
                }
                for process in &group.enabled {
                    if process.session_count() != 0 {
                        continue;
                    }
                    if best
                        .as_ref()
                        .map(|b| process.last_used_us() < b.last_used_us())
                        .unwrap_or(true)
                    {
                        best = Some(Arc::clone(process));
                    }
                }
            }
        }
        best
    }

    /// Globally least-recently-used process, busy or not
    fn find_best_process_to_trash(&self) -> Option<Arc<Process>> {
        let mut best: Option<Arc<Process>> = None;
        self.for_each_process(|process| {
            if process.enabled_status() != EnabledStatus::Enabled {
                return;
            }
            if best
                .as_ref()
                .map(|b| process.last_used_us() < b.last_used_us())
                .unwrap_or(true)
            {
                best = Some(Arc::clone(process));
            }
        });
        best
    }

    /// Whether a group other than `exclude` has queued demand and nothing
    /// in flight to serve it
    fn another_group_is_waiting_for_capacity(&self, exclude: &GroupRef) -> bool {
        for (name, sg) in &self.super_groups {
            for group in &sg.groups {
                if name == &exclude.super_group && group.component_name == exclude.component {
                    continue;
                }
                if group.is_waiting_for_capacity() {
                    return true;
                }
            }
        }
        false
    }

    fn scheduling_context<'a>(
        &self,
        pool: &'a Arc<Pool>,
        super_group: &'a str,
        now_us: u64,
    ) -> SchedulingContext<'a> {
        SchedulingContext {
            pool,
            super_group,
            pool_at_full_capacity: self.at_full_capacity(),
            now_us,
        }
    }

    /// Insert a new SuperGroup in INITIALIZING state, queue the caller on
    /// it and kick off background initialization
    fn create_super_group_and_get(
        &mut self,
        pool: &Arc<Pool>,
        options: Options,
        callback: GetCallback,
        actions: &mut Actions,
    ) {
        let name = options.app_group_name();
        debug!(app_group = %name, "Creating SuperGroup");
        let secret = uuid::Uuid::new_v4().to_string();
        let sg = SuperGroup::new(name.clone(), secret, options.clone());
        let generation = sg.generation;
        self.super_groups.insert(name.clone(), sg);

        let now_us = pool.time.now_us();
        let ctx = self.scheduling_context(pool, &name, now_us);
        let sg = self
            .super_groups
            .get_mut(&name)
            .expect("SuperGroup was just inserted");
        let got_session = sg.get(&options, callback, &ctx, actions);
        assert!(!got_session, "an INITIALIZING SuperGroup cannot hand out sessions");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(initialize_super_group(
                Arc::clone(pool),
                name,
                options,
                generation,
            ));
        }
    }

    /// Drain the pool-level waitlist in FIFO order, as far as existing
    /// SuperGroups and free capacity allow
    pub fn assign_sessions_to_get_waiters(&mut self, pool: &Arc<Pool>, actions: &mut Actions) {
        let waiters: Vec<GetWaiter> = self.get_waitlist.drain(..).collect();
        let mut remaining = VecDeque::new();
        let now_us = pool.time.now_us();
        for waiter in waiters {
            let name = waiter.options.app_group_name();
            if self.super_groups.contains_key(&name) {
                let ctx = self.scheduling_context(pool, &name, now_us);
                let sg = self
                    .super_groups
                    .get_mut(&name)
                    .expect("key was just checked");
                sg.get(&waiter.options, waiter.callback, &ctx, actions);
            } else if !self.at_full_capacity() {
                self.create_super_group_and_get(pool, waiter.options, waiter.callback, actions);
            } else {
                remaining.push_back(waiter);
            }
        }
        // Anything the drain itself queued stays in front of the leftovers
        remaining.extend(self.get_waitlist.drain(..));
        self.get_waitlist = remaining;
    }

    /// Give groups with pent-up demand a chance to use newly freed
    /// capacity, then let under-provisioned groups top up
    pub fn possibly_spawn_more_processes(&mut self, pool: &Arc<Pool>) {
        for (sg_name, component) in self.group_keys() {
            if self.at_full_capacity() {
                return;
            }
            if let Some(group) = self.find_group_mut(&sg_name, &component) {
                if group.is_waiting_for_capacity() {
                    debug!(group = %group.name, "Group is waiting for capacity");
                    group.spawn(pool, &sg_name);
                }
            }
        }
        for (sg_name, component) in self.group_keys() {
            if self.at_full_capacity() {
                return;
            }
            if let Some(group) = self.find_group_mut(&sg_name, &component) {
                if group.should_spawn(false) {
                    debug!(group = %group.name, "Group requests more processes");
                    group.spawn(pool, &sg_name);
                }
            }
        }
    }

    /// Forcibly remove one process and repair pool-level invariants
    pub fn detach_process_locked(
        &mut self,
        pool: &Arc<Pool>,
        process: &Arc<Process>,
        actions: &mut Actions,
    ) -> bool {
        if !process.is_alive() {
            return false;
        }
        let Some(group_ref) = process.group_ref() else {
            return false;
        };
        let Some(group) = self.find_group_mut(&group_ref.super_group, &group_ref.component)
        else {
            return false;
        };
        group.detach(process, pool, actions);
        self.assign_sessions_to_get_waiters(pool, actions);
        self.possibly_spawn_more_processes(pool);
        true
    }

    fn verify_invariants(&self) {
        debug_assert!(self.get_waitlist.is_empty() || self.at_full_capacity());
        #[cfg(debug_assertions)]
        for waiter in &self.get_waitlist {
            debug_assert!(!self
                .super_groups
                .contains_key(&waiter.options.app_group_name()));
        }
    }
}

/// The application-process pool. Construct with [`Pool::new`]; the
/// returned `Arc` is the handle everything else hangs off.
pub struct Pool {
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) spawner_factory: SpawnerFactory,
    pub(crate) time: Arc<dyn TimeSource>,
    pub(crate) gc_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl Pool {
    /// Create a pool with the default spawner configuration and system
    /// clock, and start its background tasks
    pub fn new(config: &Config) -> Arc<Self> {
        Self::with_spawner_config(config, SpawnerConfig::default(), Arc::new(SystemTimeSource))
    }

    /// Create a pool with injected spawner configuration and time source
    /// (tests freeze the clock and tune the dummy spawner through this)
    pub fn with_spawner_config(
        config: &Config,
        spawner_config: SpawnerConfig,
        time: Arc<dyn TimeSource>,
    ) -> Arc<Self> {
        let locator = ResourceLocator::new(&config.spawn);
        let (shutdown_tx, _) = watch::channel(false);
        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner {
                life: PoolLifeStatus::Alive,
                max: config.pool.max,
                max_idle_time: config.pool.max_idle_time(),
                super_groups: HashMap::new(),
                get_waitlist: VecDeque::new(),
            }),
            spawner_factory: SpawnerFactory::new(
                locator,
                Arc::new(spawner_config),
                Arc::clone(&time),
            ),
            time,
            gc_notify: Notify::new(),
            shutdown_tx,
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(garbage_collector_task(
                Arc::clone(&pool),
                pool.shutdown_tx.subscribe(),
            ));
            handle.spawn(metrics_collector_task(
                Arc::clone(&pool),
                pool.shutdown_tx.subscribe(),
            ));
        }
        pool
    }

    pub(crate) fn spawner_context(&self) -> SpawnerContext {
        self.spawner_factory.context()
    }

    /// Access to the shared spawner config (tests use the dummy knobs)
    pub fn spawner_config(&self) -> &Arc<SpawnerConfig> {
        self.spawner_factory.config()
    }

    /// Resolve a session for `options` without blocking: hand out an
    /// existing idle worker, start a spawn, evict to make room, or queue
    /// the request. `callback` fires exactly once, after the internal
    /// lock has been released.
    pub fn async_get(self: &Arc<Self>, options: &Options, callback: GetCallback) {
        let mut actions = Actions::new();
        {
            let mut inner = self.inner.lock();
            assert_eq!(inner.life, PoolLifeStatus::Alive, "async_get on a destroyed pool");
            let name = options.app_group_name();
            let now_us = self.time.now_us();

            if inner.super_groups.contains_key(&name) {
                // Best case: the app group is already pooled
                let ctx = inner.scheduling_context(self, &name, now_us);
                let sg = inner
                    .super_groups
                    .get_mut(&name)
                    .expect("key was just checked");
                sg.get(options, callback, &ctx, &mut actions);
            } else if !inner.at_full_capacity() {
                inner.create_super_group_and_get(self, options.clone(), callback, &mut actions);
            } else {
                // At capacity and the app group is absent: free a slot
                debug!(app_group = %name, "Pool is at full capacity; trying to free a process");
                let victim = inner.find_oldest_idle_process().or_else(|| {
                    if options.allow_trashing_non_idle_processes {
                        inner.find_best_process_to_trash()
                    } else {
                        None
                    }
                });
                match victim {
                    Some(process) => {
                        debug!(process = %process.describe(), "Evicting process");
                        if let Some(group_ref) = process.group_ref() {
                            if let Some(group) =
                                inner.find_group_mut(&group_ref.super_group, &group_ref.component)
                            {
                                group.detach(&process, self, &mut actions);
                            }
                        }
                        inner.create_super_group_and_get(
                            self,
                            options.clone(),
                            callback,
                            &mut actions,
                        );
                        // The eviction freed a slot; older pool waiters get
                        // a chance at it before the invariant check
                        inner.assign_sessions_to_get_waiters(self, &mut actions);
                    }
                    None => {
                        debug!(app_group = %name, "No process is evictable; queueing on the pool waitlist");
                        inner.get_waitlist.push_back(GetWaiter {
                            options: options.clone(),
                            callback,
                        });
                    }
                }
            }
            inner.verify_invariants();
        }
        actions.run();
    }

    /// Blocking convenience built on [`Pool::async_get`]
    pub async fn get(self: &Arc<Self>, options: &Options) -> Result<Session, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.async_get(
            options,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::GetAborted(
                "The pool was destroyed before the request could be served".to_string(),
            )),
        }
    }

    /// Session bookkeeping on close: counters, priority queues, capacity
    /// hand-back, disable completion and OOBW advancement
    pub(crate) fn session_closed(self: &Arc<Self>, process: &Arc<Process>, socket_index: usize) {
        let mut actions = Actions::new();
        {
            let mut inner = self.inner.lock();
            let now_us = self.time.now_us();
            process.checkin_socket(socket_index);

            let group_ref = process.group_ref();
            let life = process.life_status();

            if life == LifeStatus::ShuttingDown {
                // Detached process: destroy it once drained and dead
                if let Some(group_ref) = &group_ref {
                    if let Some(group) =
                        inner.find_group_mut(&group_ref.super_group, &group_ref.component)
                    {
                        group.reap_detached_processes();
                        group.try_finish_shutdown();
                        return;
                    }
                }
                if process.can_be_shut_down() {
                    process.shutdown();
                }
                return;
            }

            let Some(group_ref) = group_ref else {
                return;
            };
            let pool_waiters = !inner.get_waitlist.is_empty();
            let another_waiting = inner.another_group_is_waiting_for_capacity(&group_ref);
            let pool_at_full_capacity = inner.at_full_capacity();
            let Some(group) = inner.find_group_mut(&group_ref.super_group, &group_ref.component)
            else {
                return;
            };
            group.refresh_priority(process);

            let sessions = process.session_count();
            let status = process.enabled_status();
            let max_requests = group.options.max_requests;
            let reached_max_requests =
                max_requests > 0 && process.processed_count() >= max_requests as u64;
            let capacity_needed_elsewhere = sessions == 0
                && group.get_waitlist.is_empty()
                && (pool_waiters || another_waiting);
            let should_disable =
                status == EnabledStatus::Disabling && sessions == 0 && !group.enabled.is_empty();

            if reached_max_requests || capacity_needed_elsewhere {
                if reached_max_requests {
                    info!(
                        process = %process.describe(),
                        max_requests,
                        "Process reached its request limit; detaching"
                    );
                } else {
                    debug!(
                        process = %process.describe(),
                        "Detaching idle process to free capacity for other groups"
                    );
                }
                inner.detach_process_locked(self, process, &mut actions);
            } else if should_disable {
                group.remove_disabling_process_that_drained(process, &mut actions);
                self.oobw_request_if_needed(&mut inner, process, &group_ref, now_us, &mut actions);
            } else {
                self.oobw_request_if_needed(&mut inner, process, &group_ref, now_us, &mut actions);
                if process.enabled_status() == EnabledStatus::Enabled {
                    let ctx = SchedulingContext {
                        pool: self,
                        super_group: &group_ref.super_group,
                        pool_at_full_capacity,
                        now_us,
                    };
                    if let Some(group) =
                        inner.find_group_mut(&group_ref.super_group, &group_ref.component)
                    {
                        if !group.get_waitlist.is_empty() {
                            group.assign_sessions_to_get_waiters(&ctx, &mut actions);
                        }
                    }
                }
            }
            inner.verify_invariants();
        }
        actions.run();
    }

    /// Mark that the worker asked for out-of-band work after its current
    /// response. Acted upon when its session count drains to zero.
    pub(crate) fn request_oobw(self: &Arc<Self>, process: &Arc<Process>) {
        let inner = self.inner.lock();
        if process.is_alive() {
            process.state.lock().oobw_requested = true;
        }
        drop(inner);
    }

    /// Advance the OOBW state machine: disable the process, run the hook,
    /// re-enable afterwards
    fn oobw_request_if_needed(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        process: &Arc<Process>,
        group_ref: &GroupRef,
        now_us: u64,
        actions: &mut Actions,
    ) {
        let requested = process.state.lock().oobw_requested;
        if !requested || !process.is_alive() {
            return;
        }
        match process.enabled_status() {
            EnabledStatus::Enabled => {
                // Disabling may complete asynchronously; when it does, come
                // back here through the callback
                let pool = Arc::clone(self);
                let process_for_cb = Arc::clone(process);
                let callback: DisableCallback = Box::new(move |result| {
                    if result == DisableResult::Success || result == DisableResult::Canceled {
                        pool.oobw_continue(&process_for_cb);
                    }
                });
                let ctx = inner.scheduling_context(self, &group_ref.super_group, now_us);
                let Some(group) =
                    inner.find_group_mut(&group_ref.super_group, &group_ref.component)
                else {
                    return;
                };
                let result = group.disable(process, callback, &ctx);
                if result == DisableResult::Deferred {
                    return;
                }
                if result != DisableResult::Success {
                    return;
                }
                // Disabled immediately; fall through to start the work
            }
            EnabledStatus::Disabling => return,
            EnabledStatus::Disabled => {}
        }
        if process.session_count() == 0 {
            debug!(process = %process.describe(), "Starting out-of-band work");
            let pool = Arc::clone(self);
            let process = Arc::clone(process);
            actions.push(move || {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(perform_oobw(pool, process));
                }
            });
        }
    }

    /// Re-entry point for the OOBW machine after an asynchronous disable
    fn oobw_continue(self: &Arc<Self>, process: &Arc<Process>) {
        let mut actions = Actions::new();
        {
            let mut inner = self.inner.lock();
            if !process.is_alive() {
                return;
            }
            let Some(group_ref) = process.group_ref() else {
                return;
            };
            let now_us = self.time.now_us();
            self.oobw_request_if_needed(&mut inner, process, &group_ref, now_us, &mut actions);
        }
        actions.run();
    }

    /// Forcibly remove the process with the given gupid. Returns whether
    /// anything was detached.
    pub fn detach_process(self: &Arc<Self>, gupid: &str) -> bool {
        let mut actions = Actions::new();
        let result = {
            let mut inner = self.inner.lock();
            match inner.find_process_by_gupid(gupid) {
                Some(process) => inner.detach_process_locked(self, &process, &mut actions),
                None => false,
            }
        };
        actions.run();
        result
    }

    /// Forcibly remove a whole SuperGroup. Queued callers receive
    /// `GetAborted`; resolves once every worker is drained and gone.
    pub async fn detach_super_group(self: &Arc<Self>, name: &str) -> bool {
        let mut actions = Actions::new();
        let group_shutdowns;
        {
            let mut inner = self.inner.lock();
            let Some(mut sg) = inner.super_groups.remove(name) else {
                return false;
            };
            info!(app_group = %name, "Detaching SuperGroup");
            group_shutdowns = sg.destroy(self, &mut actions);
            inner.assign_sessions_to_get_waiters(self, &mut actions);
            inner.possibly_spawn_more_processes(self);
            inner.verify_invariants();
        }
        actions.run();
        for (group, receiver) in group_shutdowns {
            if group.life == GroupLifeStatus::ShutDown {
                continue;
            }
            tokio::spawn(finalize_group_shutdown(group));
            let _ = receiver.await;
        }
        true
    }

    /// Detach a SuperGroup addressed by its secret
    pub async fn detach_super_group_by_secret(self: &Arc<Self>, secret: &str) -> bool {
        let name = {
            let inner = self.inner.lock();
            inner
                .super_groups
                .values()
                .find(|sg| sg.secret == secret)
                .map(|sg| sg.name.clone())
        };
        match name {
            Some(name) => self.detach_super_group(&name).await,
            None => false,
        }
    }

    /// Take a process out of rotation, waiting for its sessions to drain
    pub async fn disable_process(self: &Arc<Self>, gupid: &str) -> DisableResult {
        let (tx, rx) = oneshot::channel();
        let result = {
            let mut inner = self.inner.lock();
            let Some(process) = inner.find_process_by_gupid(gupid) else {
                return DisableResult::Noop;
            };
            let Some(group_ref) = process.group_ref() else {
                return DisableResult::Noop;
            };
            let now_us = self.time.now_us();
            let ctx = inner.scheduling_context(self, &group_ref.super_group, now_us);
            let Some(group) = inner.find_group_mut(&group_ref.super_group, &group_ref.component)
            else {
                return DisableResult::Noop;
            };
            group.disable(
                &process,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
                &ctx,
            )
        };
        if result == DisableResult::Deferred {
            rx.await.unwrap_or(DisableResult::Error)
        } else {
            result
        }
    }

    /// Flip every group with the given app root into RESTARTING. Returns
    /// how many matched.
    pub fn restart_groups_by_app_root(self: &Arc<Self>, app_root: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys = inner.group_keys();
        let mut count = 0;
        for (sg_name, component) in keys {
            if let Some(group) = inner.find_group_mut(&sg_name, &component) {
                if group.options.app_root == app_root {
                    count += 1;
                    if !group.restarting && group.is_alive() {
                        let options = group.options.clone();
                        group.restart(options, self, &sg_name);
                    }
                }
            }
        }
        count
    }

    /// Restart whole SuperGroups by app root (components reload together).
    /// Returns how many matched.
    pub fn restart_super_groups_by_app_root(self: &Arc<Self>, app_root: &str) -> usize {
        let mut actions = Actions::new();
        let count;
        {
            let mut inner = self.inner.lock();
            let names: Vec<String> = inner
                .super_groups
                .values()
                .filter(|sg| sg.options.app_root == app_root)
                .map(|sg| sg.name.clone())
                .collect();
            count = names.len();
            let now_us = self.time.now_us();
            for name in names {
                let ctx = inner.scheduling_context(self, &name, now_us);
                let Some(sg) = inner.super_groups.get_mut(&name) else {
                    continue;
                };
                if sg.is_ready() {
                    let options = sg.options.clone();
                    sg.restart(options, &ctx, &mut actions);
                }
            }
        }
        actions.run();
        count
    }

    /// Raise or lower the capacity ceiling. Raising it drains the pool
    /// waitlist and lets starved groups spawn.
    pub fn set_max(self: &Arc<Self>, max: usize) {
        assert!(max > 0);
        let mut actions = Actions::new();
        {
            let mut inner = self.inner.lock();
            let bigger = max > inner.max;
            inner.max = max;
            if bigger {
                // Waiters on the pool get first pick over groups wanting
                // to grow; they have nothing yet
                inner.assign_sessions_to_get_waiters(self, &mut actions);
                inner.possibly_spawn_more_processes(self);
            }
            inner.verify_invariants();
        }
        actions.run();
    }

    pub fn set_max_idle_time(&self, value: Duration) {
        self.inner.lock().max_idle_time = value;
        self.gc_notify.notify_waiters();
    }

    pub fn max(&self) -> usize {
        self.inner.lock().max
    }

    /// Live worker processes (enabled + disabling + disabled)
    pub fn process_count(&self) -> usize {
        self.inner.lock().process_count()
    }

    /// Capacity in use, counting in-flight spawns
    pub fn capacity_used(&self) -> usize {
        self.inner.lock().capacity_used()
    }

    pub fn at_full_capacity(&self) -> bool {
        self.inner.lock().at_full_capacity()
    }

    pub fn super_group_count(&self) -> usize {
        self.inner.lock().super_groups.len()
    }

    pub fn get_wait_list_size(&self) -> usize {
        self.inner.lock().get_waitlist.len()
    }

    /// Whether any group is currently spawning
    pub fn is_spawning(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .super_groups
            .values()
            .any(|sg| sg.groups.iter().any(|g| g.spawning))
    }

    /// Tear the pool down: every SuperGroup is detached (aborting queued
    /// callers), background tasks stop. The pool is unusable afterwards.
    pub async fn destroy(self: &Arc<Self>) {
        let names: Vec<String> = {
            let mut inner = self.inner.lock();
            assert_eq!(inner.life, PoolLifeStatus::Alive);
            inner.life = PoolLifeStatus::ShuttingDown;
            inner.super_groups.keys().cloned().collect()
        };
        for name in names {
            self.detach_super_group(&name).await;
        }
        let _ = self.shutdown_tx.send(true);
        self.gc_notify.notify_waiters();
        let mut inner = self.inner.lock();
        // Abort anything still parked on the pool waitlist
        let mut actions = Actions::new();
        for waiter in inner.get_waitlist.drain(..) {
            let callback = waiter.callback;
            actions.push(move || {
                callback(Err(PoolError::GetAborted(
                    "The pool is shutting down".to_string(),
                )))
            });
        }
        inner.life = PoolLifeStatus::ShutDown;
        drop(inner);
        actions.run();
    }

    /// Plain-text snapshot of the pool state
    pub fn inspect(&self, options: &InspectOptions) -> String {
        let inner = self.inner.lock();
        let now_us = self.time.now_us();
        let mut out = String::new();
        let (header, reset) = if options.colorize {
            ("\x1b[33;44;1m", "\x1b[0m")
        } else {
            ("", "")
        };

        let _ = writeln!(out, "{}----------- General information -----------{}", header, reset);
        let _ = writeln!(out, "Max pool size : {}", inner.max);
        let _ = writeln!(out, "Processes     : {}", inner.process_count());
        let _ = writeln!(out, "Requests in top-level queue : {}", inner.get_waitlist.len());
        if options.verbose {
            for (index, waiter) in inner.get_waitlist.iter().enumerate() {
                let _ = writeln!(out, "  {}: {}", index, waiter.options.app_group_name());
            }
        }
        out.push('\n');

        let _ = writeln!(out, "{}----------- Application groups -----------{}", header, reset);
        let mut names: Vec<&String> = inner.super_groups.keys().collect();
        names.sort();
        for name in names {
            let sg = &inner.super_groups[name];
            let Some(group) = sg.default_group() else {
                let _ = writeln!(out, "{}:", name);
                let _ = writeln!(out, "  (initializing...)");
                out.push('\n');
                continue;
            };
            let _ = writeln!(out, "{}:", group.name);
            let _ = writeln!(out, "  App root: {}", group.options.app_root);
            if group.restarting {
                let _ = writeln!(out, "  (restarting...)");
            }
            if group.spawning {
                let _ = writeln!(out, "  (spawning new process...)");
            }
            let _ = writeln!(out, "  Requests in queue: {}", group.get_waitlist.len());
            for process in group
                .enabled
                .iter()
                .chain(group.disabling.iter())
                .chain(group.disabled.iter())
            {
                let _ = writeln!(
                    out,
                    "  * PID: {:<5}   Sessions: {:<2}   Processed: {:<5}   Uptime: {}",
                    process.pid,
                    process.session_count(),
                    process.processed_count(),
                    process.uptime(now_us)
                );
                match process.enabled_status() {
                    EnabledStatus::Disabling => {
                        let _ = writeln!(out, "    Disabling...");
                    }
                    EnabledStatus::Disabled => {
                        let _ = writeln!(out, "    DISABLED");
                    }
                    EnabledStatus::Enabled => {}
                }
            }
            out.push('\n');
        }
        out
    }

    /// XML snapshot of the pool state
    pub fn to_xml(&self, include_secrets: bool) -> String {
        let inner = self.inner.lock();
        let now_us = self.time.now_us();
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<info version=\"2\">");
        let _ = write!(out, "<process_count>{}</process_count>", inner.process_count());
        let _ = write!(out, "<max>{}</max>", inner.max);
        let _ = write!(out, "<utilization>{}</utilization>", inner.capacity_used());
        let _ = write!(
            out,
            "<get_wait_list_size>{}</get_wait_list_size>",
            inner.get_waitlist.len()
        );
        if include_secrets {
            out.push_str("<get_wait_list>");
            for waiter in &inner.get_waitlist {
                let _ = write!(
                    out,
                    "<item><app_group_name>{}</app_group_name></item>",
                    crate::util::escape_for_xml(&waiter.options.app_group_name())
                );
            }
            out.push_str("</get_wait_list>");
        }
        out.push_str("<supergroups>");
        let mut names: Vec<&String> = inner.super_groups.keys().collect();
        names.sort();
        for name in names {
            out.push_str("<supergroup>");
            inner.super_groups[name].inspect_xml(&mut out, now_us, include_secrets);
            out.push_str("</supergroup>");
        }
        out.push_str("</supergroups>");
        out.push_str("</info>");
        out
    }

    /// One garbage-collection pass: detach workers idle past the deadline
    /// (respecting each group's minimum) and reap idle preloaders.
    /// Returns how long to sleep until the next deadline.
    fn garbage_collect(self: &Arc<Self>) -> Duration {
        let mut actions = Actions::new();
        let sleep_us;
        {
            let mut inner = self.inner.lock();
            if inner.life != PoolLifeStatus::Alive {
                return Duration::from_secs(3600);
            }
            debug!("Garbage collection pass");
            let now_us = self.time.now_us();
            let max_idle_us = inner.max_idle_time.as_micros() as u64;
            let mut next_deadline_us: Option<u64> = None;
            let mut detached_any = false;

            for (sg_name, component) in inner.group_keys() {
                let candidates: Vec<Arc<Process>> = {
                    let Some(group) = inner.find_group_mut(&sg_name, &component) else {
                        continue;
                    };
                    let min = group.options.min_processes;
                    let mut surviving = group.enabled.len();
                    let mut candidates = Vec::new();
                    for process in &group.enabled {
                        let deadline = process.last_used_us() + max_idle_us;
                        if process.session_count() == 0 && now_us >= deadline && surviving > min {
                            candidates.push(Arc::clone(process));
                            surviving -= 1;
                        } else if next_deadline_us.map(|t| deadline < t).unwrap_or(true) {
                            next_deadline_us = Some(deadline);
                        }
                    }
                    if group.spawner.cleanable() {
                        let spawner_deadline = group.spawner.last_used_us()
                            + group.options.max_preloader_idle_time().as_micros() as u64;
                        if now_us >= spawner_deadline {
                            debug!(group = %group.name, "Reaping idle preloader");
                            let spawner = Arc::clone(&group.spawner);
                            actions.push(move || {
                                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                                    handle.spawn(async move { spawner.cleanup().await });
                                }
                            });
                        } else if next_deadline_us.map(|t| spawner_deadline < t).unwrap_or(true)
                        {
                            next_deadline_us = Some(spawner_deadline);
                        }
                    }
                    candidates
                };
                for process in candidates {
                    debug!(process = %process.describe(), "Garbage collecting idle process");
                    let Some(group) = inner.find_group_mut(&sg_name, &component) else {
                        continue;
                    };
                    group.detach(&process, self, &mut actions);
                    detached_any = true;
                }
            }
            if detached_any {
                inner.assign_sessions_to_get_waiters(self, &mut actions);
                inner.possibly_spawn_more_processes(self);
            }
            inner.verify_invariants();
            sleep_us = match next_deadline_us {
                Some(deadline) if deadline > now_us => deadline - now_us,
                _ => max_idle_us.max(1_000_000),
            };
        }
        actions.run();
        Duration::from_micros(sleep_us)
    }

    /// One metrics pass: probe `ps` for every live PID, store the results
    /// and detach workers whose OS process is gone
    async fn collect_metrics(self: &Arc<Self>) {
        let pids: Vec<i32> = {
            let inner = self.inner.lock();
            let mut pids = Vec::new();
            inner.for_each_process(|process| {
                if !process.dummy {
                    pids.push(process.pid);
                }
            });
            pids
        };
        let metrics = match ProcessMetricsCollector.collect(&pids).await {
            Ok(metrics) => metrics,
            Err(CollectError::Parse(e)) => {
                // Transient: log and try again next cycle
                warn!(error = %e, "Cannot collect process metrics");
                return;
            }
            Err(CollectError::Exec(e)) => {
                warn!(error = %e, "Cannot run the process metrics probe");
                return;
            }
        };

        let mut actions = Actions::new();
        {
            let mut inner = self.inner.lock();
            if inner.life != PoolLifeStatus::Alive {
                return;
            }
            let mut dead = Vec::new();
            inner.for_each_process(|process| {
                if process.dummy {
                    return;
                }
                match metrics.get(&process.pid) {
                    Some(sample) => {
                        process.state.lock().metrics = Some(*sample);
                    }
                    // Missing from ps: double-check with a null signal
                    // before concluding the worker is dead
                    None => {
                        if !process.os_process_exists() {
                            dead.push(Arc::clone(process));
                        }
                    }
                }
            });
            for process in dead {
                warn!(
                    process = %process.describe(),
                    "Worker process no longer exists; detaching it from the pool"
                );
                inner.detach_process_locked(self, &process, &mut actions);
            }
        }
        actions.run();
    }
}

/// Spawn loop for one group: keep producing workers until the group has
/// its minimum, the waitlist is drained, the pool fills up, or a spawn
/// fails. Mirrors the group's `spawning` flag.
pub(crate) async fn spawn_loop(
    pool: Arc<Pool>,
    super_group: String,
    component: String,
    spawner: Arc<Spawner>,
    options: Options,
    generation: u64,
) {
    let spawner_ctx = pool.spawner_context();
    // Callers queued behind a failed spawn get exactly one more attempt
    // before the whole waitlist is failed
    let mut retried_after_failure = false;
    loop {
        let result = spawner.spawn(&options, &spawner_ctx).await;
        let mut actions = Actions::new();
        let mut finished = false;
        {
            let mut inner = pool.inner.lock();
            let now_us = pool.time.now_us();
            let at_full_capacity = inner.at_full_capacity();

            let alive = inner
                .find_group_mut(&super_group, &component)
                .map(|g| g.is_alive() && g.restarts_initiated == generation)
                .unwrap_or(false);
            if !alive {
                debug!(group = %super_group, "Group gone or restarted; abandoning spawn loop");
                if let Ok(process) = result {
                    process.shutdown();
                }
                return;
            }

            let failed = {
                let ctx = SchedulingContext {
                    pool: &pool,
                    super_group: &super_group,
                    pool_at_full_capacity: at_full_capacity,
                    now_us,
                };
                let group = inner
                    .find_group_mut(&super_group, &component)
                    .expect("checked above");
                assert!(group.spawning);
                match result {
                    Ok(process) => {
                        let process = Arc::new(process);
                        group.attach(&process, &super_group, &mut actions);
                        if !group.get_waitlist.is_empty() {
                            group.assign_sessions_to_get_waiters(&ctx, &mut actions);
                        }
                        debug!(
                            group = %group.name,
                            enabled = group.enabled.len(),
                            waiting = group.get_waitlist.len(),
                            "Process attached"
                        );
                        false
                    }
                    Err(e) => {
                        warn!(group = %group.name, error = %e, "Could not spawn a process");
                        if group.enabled.is_empty() {
                            group.enable_all_disabling_processes(&mut actions);
                        }
                        // The caller that triggered this spawn gets the
                        // error; anyone queued behind it is retried once
                        group.fail_first_get_waiter(&e, &mut actions);
                        if !retried_after_failure && !group.get_waitlist.is_empty() {
                            retried_after_failure = true;
                            debug!(
                                group = %group.name,
                                waiting = group.get_waitlist.len(),
                                "Retrying spawn for the remaining queued callers"
                            );
                            false
                        } else {
                            group.assign_error_to_get_waiters(&e, &mut actions);
                            true
                        }
                    }
                }
            };

            // Clear the spawning reservation before measuring capacity
            let group = inner
                .find_group_mut(&super_group, &component)
                .expect("checked above");
            group.spawning = false;
            let satisfied = group.enabled.len() >= group.options.min_processes
                && group.get_waitlist.is_empty();
            let at_full_capacity_now = inner.at_full_capacity();
            let group = inner
                .find_group_mut(&super_group, &component)
                .expect("checked above");
            finished = failed || satisfied || at_full_capacity_now;
            group.spawning = !finished;

            // Local demand is satisfied or failed; freed capacity may now
            // serve pool-level waiters
            inner.assign_sessions_to_get_waiters(&pool, &mut actions);
            if failed {
                inner.possibly_spawn_more_processes(&pool);
            }
            inner.verify_invariants();
        }
        actions.run();
        if finished {
            debug!(group = %super_group, "Spawn loop done");
            return;
        }
    }
}

/// Swap in the fresh spawner after a restart and leave RESTARTING
pub(crate) async fn finalize_restart(
    pool: Arc<Pool>,
    super_group: String,
    component: String,
    options: Options,
    generation: u64,
) {
    let new_spawner = pool.spawner_factory.create(&options);
    {
        let mut inner = pool.inner.lock();
        let Some(group) = inner.find_group_mut(&super_group, &component) else {
            return;
        };
        if !group.is_alive() || group.restarts_initiated != generation {
            return;
        }
        assert!(group.restarting);
        group.options = options;
        group.spawner = new_spawner;
        group.restarting = false;
        // Begin the replacement population right away: a restart is only
        // complete once min_processes workers are enabled again, whether
        // or not anyone is queued
        if !group.get_waitlist.is_empty()
            || group.enabled.len() < group.options.min_processes
        {
            group.spawn(&pool, &super_group);
        }
        debug!(group = %group.name, "Restart finalized");
    }
}

/// Background initialization of a freshly created SuperGroup: check that
/// the app root exists, build the component groups, drain the waitlist
async fn initialize_super_group(
    pool: Arc<Pool>,
    name: String,
    options: Options,
    generation: u64,
) {
    let app_root_exists = tokio::fs::metadata(&options.app_root)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    let mut actions = Actions::new();
    {
        let mut inner = pool.inner.lock();
        let now_us = pool.time.now_us();
        let state = inner
            .super_groups
            .get(&name)
            .filter(|sg| sg.generation == generation)
            .map(|sg| sg.state);
        if state != Some(SuperGroupState::Initializing) {
            return;
        }

        if !app_root_exists {
            // Initialization failed: fail the queued callers, drop the
            // SuperGroup, and let the freed capacity serve others
            let error: SpawnError = internal_spawn_error(&format!(
                "The directory {} does not seem to contain a web application",
                options.app_root
            ));
            let mut sg = inner
                .super_groups
                .remove(&name)
                .expect("presence was just checked");
            warn!(app_group = %name, "SuperGroup initialization failed");
            for waiter in sg.get_waitlist.drain(..) {
                let callback = waiter.callback;
                let err = error.clone();
                actions.push(move || callback(Err(PoolError::Spawn(err))));
            }
            inner.assign_sessions_to_get_waiters(&pool, &mut actions);
            inner.possibly_spawn_more_processes(&pool);
        } else {
            let component = crate::supergroup::ComponentInfo::default_component();
            let spawner = pool.spawner_factory.create(&options);
            let secret = uuid::Uuid::new_v4().to_string();
            let group = Group::new(&name, &component.name, options, spawner, secret);
            let ctx = inner.scheduling_context(&pool, &name, now_us);
            let sg = inner
                .super_groups
                .get_mut(&name)
                .expect("presence was just checked");
            sg.finish_initialization(vec![component], vec![group], &ctx, &mut actions);
            debug!(app_group = %name, "SuperGroup initialized");
        }
        inner.verify_invariants();
    }
    actions.run();
}

/// Poll a live group's detached processes until they can be destroyed
pub(crate) async fn detached_processes_checker(
    pool: Arc<Pool>,
    super_group: String,
    component: String,
) {
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut inner = pool.inner.lock();
        let Some(group) = inner.find_group_mut(&super_group, &component) else {
            // The group was torn down; its own finalizer takes over
            return;
        };
        group.reap_detached_processes();
        if group.detached.is_empty() {
            group.detached_checker_active = false;
            group.try_finish_shutdown();
            return;
        }
    }
}

/// Drive a shut-down group (already removed from the pool) until its last
/// detached process is drained and dead
async fn finalize_group_shutdown(mut group: Group) {
    loop {
        group.reap_detached_processes();
        group.try_finish_shutdown();
        if group.life == GroupLifeStatus::ShutDown {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// The garbage collector: sleeps until the next idle deadline, wakes
/// early when prodded (`set_max_idle_time`, shutdown)
async fn garbage_collector_task(pool: Arc<Pool>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut sleep = Duration::from_secs(5);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = pool.gc_notify.notified() => {}
            _ = shutdown_rx.changed() => {}
        }
        if *shutdown_rx.borrow() {
            debug!("Garbage collector shutting down");
            return;
        }
        sleep = pool.garbage_collect();
        debug!(next_in_secs = sleep.as_secs(), "Garbage collection done");
    }
}

/// The metrics collector: every ~4 seconds, aligned to the second
/// boundary to batch wakeups
async fn metrics_collector_task(pool: Arc<Pool>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut sleep = Duration::from_secs(3);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown_rx.changed() => {}
        }
        if *shutdown_rx.borrow() {
            debug!("Metrics collector shutting down");
            return;
        }
        pool.collect_metrics().await;
        // Sleep for about 4 seconds, aligned to the second boundary to
        // save power on laptops
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let now_us = now.as_micros() as u64;
        let deadline_us = (now.as_secs() + 1) * 1_000_000 + 4_000_000;
        sleep = Duration::from_micros(deadline_us.saturating_sub(now_us));
    }
}

/// Run one worker's out-of-band work cycle: poke it over its session
/// socket, then put it back into rotation
async fn perform_oobw(pool: Arc<Pool>, process: Arc<Process>) {
    let address = {
        let state = process.state.lock();
        state
            .session_pq
            .top()
            .and_then(|&index| state.sockets.get(index))
            .map(|socket| socket.address.clone())
    };
    if !process.dummy {
        if let Some(address) = address {
            match tokio::time::timeout(
                Duration::from_secs(60),
                send_oobw_trigger(&address, &process.connect_password),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(process = %process.describe(), error = %e,
                          "Out-of-band work trigger failed");
                }
                Err(_) => {
                    warn!(process = %process.describe(),
                          "Out-of-band work trigger timed out");
                }
            }
        }
    }

    let mut actions = Actions::new();
    {
        let mut inner = pool.inner.lock();
        if !process.is_alive() {
            return;
        }
        process.state.lock().oobw_requested = false;
        let Some(group_ref) = process.group_ref() else {
            return;
        };
        let now_us = pool.time.now_us();
        let ctx = inner.scheduling_context(&pool, &group_ref.super_group, now_us);
        let Some(group) = inner.find_group_mut(&group_ref.super_group, &group_ref.component)
        else {
            return;
        };
        if process.enabled_status() == EnabledStatus::Disabled {
            debug!(process = %process.describe(), "Out-of-band work done; re-enabling");
            group.enable(&process, &mut actions);
            group.assign_sessions_to_get_waiters(&ctx, &mut actions);
        }
    }
    actions.run();
}

async fn send_oobw_trigger(
    address: &crate::socket::SocketAddress,
    password: &str,
) -> std::io::Result<()> {
    use crate::socket::SocketAddress;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let request = format!("OOBW {}\n", password);
    match address {
        SocketAddress::Unix(path) => {
            let mut stream = tokio::net::UnixStream::connect(path).await?;
            stream.write_all(request.as_bytes()).await?;
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await?;
            Ok(())
        }
        SocketAddress::Tcp { host, port } => {
            let mut stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
            stream.write_all(request.as_bytes()).await?;
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await?;
            Ok(())
        }
    }
}
