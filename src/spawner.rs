//! Spawner variants and the factory that picks one per app identity

use crate::config::ResourceLocator;
use crate::direct_spawner::DirectSpawner;
use crate::error::SpawnError;
use crate::options::{Options, SpawnMethod};
use crate::process::{NewProcess, Process};
use crate::smart_spawner::SmartSpawner;
use crate::util::{RandomGenerator, TimeSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Knobs shared by all spawners of one pool
pub struct SpawnerConfig {
    /// Forward worker stdout to the log sink at info level
    pub forward_stdout: bool,
    /// Forward worker stderr to the log sink at info level
    pub forward_stderr: bool,
    pub random: RandomGenerator,
    /// Concurrency the dummy spawner gives its fake processes
    pub dummy_concurrency: usize,
    /// How long a dummy spawn pretends to take
    pub dummy_spawn_delay: Duration,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            forward_stdout: true,
            forward_stderr: true,
            random: RandomGenerator::new(),
            dummy_concurrency: 1,
            dummy_spawn_delay: Duration::ZERO,
        }
    }
}

/// Per-pool services a spawner needs at spawn time
pub(crate) struct SpawnerContext {
    pub config: Arc<SpawnerConfig>,
    pub clock: Arc<dyn TimeSource>,
}

impl Clone for SpawnerContext {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
        }
    }
}

/// Test spawner: produces fake processes with no OS process behind them.
/// One instance is shared by every group so tests can tune it centrally.
pub(crate) struct DummySpawner {
    creation_time_us: u64,
    last_used_us: AtomicU64,
    next_pid: AtomicI32,
    /// Total fake processes produced, visible to tests
    pub spawn_count: AtomicU64,
}

impl DummySpawner {
    fn new(creation_time_us: u64) -> Self {
        Self {
            creation_time_us,
            last_used_us: AtomicU64::new(creation_time_us),
            next_pid: AtomicI32::new(1000),
            spawn_count: AtomicU64::new(0),
        }
    }

    async fn spawn(&self, _options: &Options, ctx: &SpawnerContext) -> Result<Process, SpawnError> {
        if !ctx.config.dummy_spawn_delay.is_zero() {
            tokio::time::sleep(ctx.config.dummy_spawn_delay).await;
        }
        let now_us = ctx.clock.now_us();
        self.last_used_us.store(now_us, Ordering::Relaxed);
        self.spawn_count.fetch_add(1, Ordering::Relaxed);
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        Ok(Process::dummy(
            NewProcess {
                pid,
                gupid: crate::util::generate_gupid(ctx.clock.as_ref(), &ctx.config.random),
                connect_password: ctx.config.random.ascii_string(43),
                admin: None,
                child: None,
                sockets: crate::socket::SocketList::new(),
                spawner_creation_time_us: self.creation_time_us,
                spawn_start_time_us: now_us,
                now_us,
            },
            ctx.config.dummy_concurrency,
        ))
    }
}

/// The spawn strategies share one contract: `spawn(options) -> Process`.
/// The set is closed, so a tagged enum stands in for a trait object.
pub(crate) enum Spawner {
    Direct(DirectSpawner),
    Smart(SmartSpawner),
    Dummy(Arc<DummySpawner>),
}

impl Spawner {
    pub async fn spawn(
        &self,
        options: &Options,
        ctx: &SpawnerContext,
    ) -> Result<Process, SpawnError> {
        match self {
            Spawner::Direct(spawner) => spawner.spawn(options, ctx).await,
            Spawner::Smart(spawner) => spawner.spawn(options, ctx).await,
            Spawner::Dummy(spawner) => spawner.spawn(options, ctx).await,
        }
    }

    /// Whether this spawner holds resources the GC should reap when idle
    pub fn cleanable(&self) -> bool {
        matches!(self, Spawner::Smart(_))
    }

    pub async fn cleanup(&self) {
        if let Spawner::Smart(spawner) = self {
            spawner.cleanup().await;
        }
    }

    pub fn last_used_us(&self) -> u64 {
        match self {
            Spawner::Smart(spawner) => spawner.last_used_us(),
            Spawner::Dummy(spawner) => spawner.last_used_us.load(Ordering::Relaxed),
            Spawner::Direct(_) => 0,
        }
    }
}

/// Chooses and builds the spawn strategy for an app identity:
/// smart for app types with preloader support, direct otherwise, dummy
/// for tests. All created spawners share one config.
pub(crate) struct SpawnerFactory {
    locator: ResourceLocator,
    config: Arc<SpawnerConfig>,
    clock: Arc<dyn TimeSource>,
    dummy: Mutex<Option<Arc<DummySpawner>>>,
}

impl SpawnerFactory {
    pub fn new(
        locator: ResourceLocator,
        config: Arc<SpawnerConfig>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            locator,
            config,
            clock,
            dummy: Mutex::new(None),
        }
    }

    pub fn context(&self) -> SpawnerContext {
        SpawnerContext {
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
        }
    }

    pub fn config(&self) -> &Arc<SpawnerConfig> {
        &self.config
    }

    pub fn create(&self, options: &Options) -> Arc<Spawner> {
        let now_us = self.clock.now_us();
        match options.spawn_method {
            SpawnMethod::Smart => {
                match self.locator.preloader_command(options.app_type) {
                    Some(command) => Arc::new(Spawner::Smart(SmartSpawner::new(
                        self.locator.clone(),
                        command,
                        options.clone(),
                        now_us,
                    ))),
                    // App type without preloader support: spawn directly
                    None => Arc::new(Spawner::Direct(DirectSpawner::new(
                        self.locator.clone(),
                        now_us,
                    ))),
                }
            }
            SpawnMethod::Direct => Arc::new(Spawner::Direct(DirectSpawner::new(
                self.locator.clone(),
                now_us,
            ))),
            SpawnMethod::Dummy => Arc::new(Spawner::Dummy(self.dummy_spawner())),
        }
    }

    /// The dummy spawner is a singleton so tests can reach the instance
    /// the pool is using
    pub fn dummy_spawner(&self) -> Arc<DummySpawner> {
        let mut dummy = self.dummy.lock();
        if dummy.is_none() {
            *dummy = Some(Arc::new(DummySpawner::new(self.clock.now_us())));
        }
        Arc::clone(dummy.as_ref().expect("just initialized"))
    }
}
