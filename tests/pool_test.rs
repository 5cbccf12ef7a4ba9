//! Integration tests for the pool scheduler, driven by the dummy spawner
//! (and a shell-script loader where a real OS process is required)

use spawnpool::config::Config;
use spawnpool::pool::Pool;
use spawnpool::{
    ManualTimeSource, Options, PoolError, RandomGenerator, Session, SpawnErrorKind, SpawnMethod,
    SpawnerConfig, SystemTimeSource, TimeSource,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Opt-in tracing output for debugging test failures: RUST_LOG=debug
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn test_spawner_config(concurrency: usize, delay_ms: u64) -> SpawnerConfig {
    SpawnerConfig {
        forward_stdout: false,
        forward_stderr: false,
        random: RandomGenerator::seeded(42),
        dummy_concurrency: concurrency,
        dummy_spawn_delay: Duration::from_millis(delay_ms),
    }
}

fn test_pool(max: usize, concurrency: usize, delay_ms: u64) -> Arc<Pool> {
    init_logging();
    let mut config = Config::default();
    config.pool.max = max;
    Pool::with_spawner_config(
        &config,
        test_spawner_config(concurrency, delay_ms),
        Arc::new(SystemTimeSource),
    )
}

fn test_pool_with_clock(
    max: usize,
    concurrency: usize,
    clock: Arc<dyn TimeSource>,
) -> Arc<Pool> {
    init_logging();
    let mut config = Config::default();
    config.pool.max = max;
    Pool::with_spawner_config(&config, test_spawner_config(concurrency, 0), clock)
}

fn dummy_options(app_root: &Path) -> Options {
    let mut options = Options::for_app_root(app_root.to_string_lossy());
    options.spawn_method = SpawnMethod::Dummy;
    options
}

async fn eventually<F: Fn() -> bool>(what: &str, deadline: Duration, condition: F) {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time: {}", what);
}

/// Write an executable shell script into `dir` and return its path
fn write_script(dir: &Path, name: &str, contents: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// A loader that speaks the startup protocol, then idles until the pool
/// half-closes its admin channel (stdin EOF means exit)
const WELL_BEHAVED_LOADER: &str = r#"#!/bin/sh
sock="${TMPDIR:-/tmp}/spawnpool-test-$$.socket"
: > "$sock"
printf '!> I have control 1.0\n'
while IFS= read -r line; do
  [ -z "$line" ] && break
done
printf '!> Ready\n'
printf '!> socket: main;unix:%s;session;5\n' "$sock"
printf '!> \n'
while IFS= read -r line; do :; done
exit 0
"#;

// ============================================================================
// Cold start and basic dispatch
// ============================================================================

#[tokio::test]
async fn test_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let options = dummy_options(dir.path());

    let session = pool.get(&options).await.unwrap();
    assert_eq!(pool.process_count(), 1);
    assert_eq!(pool.super_group_count(), 1);
    assert_eq!(pool.get_wait_list_size(), 0);
    assert!(session.pid() >= 1000);
    drop(session);

    // The worker stays warm for the next request
    let session = pool.get(&options).await.unwrap();
    assert_eq!(pool.process_count(), 1);
    drop(session);
}

#[tokio::test]
async fn test_same_app_group_reuses_worker() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let options = dummy_options(dir.path());

    let first = pool.get(&options).await.unwrap();
    let gupid = first.gupid().to_string();
    drop(first);

    // Different tunables, same identity: same worker
    let mut other = dummy_options(dir.path());
    other.max_requests = 500;
    let second = pool.get(&other).await.unwrap();
    assert_eq!(second.gupid(), gupid);
    assert_eq!(pool.process_count(), 1);
}

#[tokio::test]
async fn test_two_app_groups_get_two_workers() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);

    let session_a = pool.get(&dummy_options(dir_a.path())).await.unwrap();
    let session_b = pool.get(&dummy_options(dir_b.path())).await.unwrap();
    assert_ne!(session_a.pid(), session_b.pid());
    assert_eq!(pool.process_count(), 2);
    assert_eq!(pool.super_group_count(), 2);
}

// ============================================================================
// Queueing under spawn
// ============================================================================

#[tokio::test]
async fn test_queueing_under_spawn_is_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 10, 100);
    let options = dummy_options(dir.path());

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sessions: Arc<Mutex<Vec<Session>>> = Arc::new(Mutex::new(Vec::new()));
    for index in 0..6 {
        let order = Arc::clone(&order);
        let sessions = Arc::clone(&sessions);
        pool.async_get(
            &options,
            Box::new(move |result| {
                let session = result.expect("all six requests are served");
                order.lock().unwrap().push(index);
                sessions.lock().unwrap().push(session);
            }),
        );
    }

    eventually("all six callers served", Duration::from_secs(5), || {
        order.lock().unwrap().len() == 6
    })
    .await;

    // One spawned process served everyone, in submission order
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(pool.process_count(), 1);

    // All six sessions are open concurrently on it
    let held = sessions.lock().unwrap();
    assert_eq!(held.len(), 6);
    let pid = held[0].pid();
    assert!(held.iter().all(|s| s.pid() == pid));
}

#[tokio::test]
async fn test_saturated_worker_triggers_second_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 1, 0);
    let options = dummy_options(dir.path());

    // Hold the only slot of the first worker, then ask again
    let first = pool.get(&options).await.unwrap();
    let second = pool.get(&options).await.unwrap();
    assert_ne!(first.pid(), second.pid());
    assert_eq!(pool.process_count(), 2);
}

// ============================================================================
// Eviction
// ============================================================================

#[tokio::test]
async fn test_eviction_of_oldest_idle_process() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let pool = test_pool(1, 4, 0);

    let mut options_a = dummy_options(dir_a.path());
    options_a.min_processes = 0;
    let session_a = pool.get(&options_a).await.unwrap();
    let gupid_a = session_a.gupid().to_string();
    drop(session_a); // A is now idle

    // B's arrival evicts A's worker instead of queueing
    let session_b = pool.get(&dummy_options(dir_b.path())).await.unwrap();
    assert_ne!(session_b.gupid(), gupid_a);
    assert_eq!(pool.get_wait_list_size(), 0);
    eventually("A's worker is destroyed", Duration::from_secs(2), || {
        pool.process_count() == 1
    })
    .await;
}

#[tokio::test]
async fn test_busy_processes_are_not_evicted_without_opt_in() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let pool = test_pool(1, 4, 0);

    let mut options_a = dummy_options(dir_a.path());
    options_a.min_processes = 0;
    let session_a = pool.get(&options_a).await.unwrap();

    // A is busy; B must wait on the pool-level list
    let served = Arc::new(Mutex::new(false));
    let served_clone = Arc::clone(&served);
    pool.async_get(
        &dummy_options(dir_b.path()),
        Box::new(move |result| {
            result.expect("served after capacity frees");
            *served_clone.lock().unwrap() = true;
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!*served.lock().unwrap());
    assert_eq!(pool.get_wait_list_size(), 1);
    assert!(pool.at_full_capacity());

    // Closing A's session frees the capacity and serves B by eviction
    drop(session_a);
    eventually("B is served", Duration::from_secs(5), || {
        *served.lock().unwrap()
    })
    .await;
    assert_eq!(pool.get_wait_list_size(), 0);
}

#[tokio::test]
async fn test_trashing_busy_process_with_opt_in() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let pool = test_pool(1, 4, 0);

    let mut options_a = dummy_options(dir_a.path());
    options_a.min_processes = 0;
    let session_a = pool.get(&options_a).await.unwrap();

    let mut options_b = dummy_options(dir_b.path());
    options_b.allow_trashing_non_idle_processes = true;
    let session_b = pool.get(&options_b).await.unwrap();
    assert_ne!(session_b.gupid(), session_a.gupid());
    // The trashed worker survives until its session closes
    drop(session_a);
}

// ============================================================================
// Wait-list drain triggers
// ============================================================================

#[tokio::test]
async fn test_set_max_increase_drains_pool_waitlist() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let pool = test_pool(1, 4, 0);

    let _session_a = pool.get(&dummy_options(dir_a.path())).await.unwrap();

    let served = Arc::new(Mutex::new(false));
    let served_clone = Arc::clone(&served);
    pool.async_get(
        &dummy_options(dir_b.path()),
        Box::new(move |result| {
            result.expect("served after set_max");
            *served_clone.lock().unwrap() = true;
        }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.get_wait_list_size(), 1);

    pool.set_max(2);
    eventually("waiter served after raise", Duration::from_secs(5), || {
        *served.lock().unwrap()
    })
    .await;

    // Idempotent: a second identical call changes nothing
    pool.set_max(2);
    assert_eq!(pool.max(), 2);
    assert_eq!(pool.get_wait_list_size(), 0);
}

#[tokio::test]
async fn test_detach_super_group_aborts_waiters() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(1, 4, 300);
    let options = dummy_options(dir.path());
    let name = options.app_group_name();

    let outcome: Arc<Mutex<Option<Result<(), String>>>> = Arc::new(Mutex::new(None));
    let outcome_clone = Arc::clone(&outcome);
    pool.async_get(
        &options,
        Box::new(move |result| {
            *outcome_clone.lock().unwrap() = Some(match result {
                Ok(_) => Ok(()),
                Err(e) => Err(e.code().to_string()),
            });
        }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(pool.detach_super_group(&name).await);
    eventually("waiter aborted", Duration::from_secs(2), || {
        outcome.lock().unwrap().is_some()
    })
    .await;
    assert_eq!(
        outcome.lock().unwrap().clone().unwrap(),
        Err("GET_ABORTED".to_string())
    );
    assert_eq!(pool.super_group_count(), 0);

    // Second detach of the same name is a clean false
    assert!(!pool.detach_super_group(&name).await);
}

// ============================================================================
// Detach by gupid
// ============================================================================

#[tokio::test]
async fn test_detach_process_twice() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let mut options = dummy_options(dir.path());
    options.min_processes = 0;

    let session = pool.get(&options).await.unwrap();
    let gupid = session.gupid().to_string();
    drop(session);

    assert!(pool.detach_process(&gupid));
    assert!(!pool.detach_process(&gupid));
    eventually("worker destroyed", Duration::from_secs(2), || {
        pool.process_count() == 0
    })
    .await;
}

// ============================================================================
// min_processes and the spawn loop
// ============================================================================

#[tokio::test]
async fn test_spawn_loop_reaches_min_processes() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let mut options = dummy_options(dir.path());
    options.min_processes = 3;

    let session = pool.get(&options).await.unwrap();
    drop(session);
    eventually("group reaches min processes", Duration::from_secs(5), || {
        pool.process_count() == 3
    })
    .await;
    assert!(!pool.is_spawning());
}

#[tokio::test]
async fn test_gc_respects_min_processes() {
    let clock = ManualTimeSource::new(1_000_000);
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool_with_clock(6, 4, clock.clone());
    let mut options = dummy_options(dir.path());
    options.min_processes = 2;

    let session = pool.get(&options).await.unwrap();
    drop(session);
    eventually("two workers", Duration::from_secs(5), || {
        pool.process_count() == 2
    })
    .await;

    // Way past any idle deadline
    clock.advance_us(3_600_000_000);
    pool.set_max_idle_time(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.process_count(), 2);
}

#[tokio::test]
async fn test_gc_reaps_idle_processes_above_min() {
    let clock = ManualTimeSource::new(1_000_000);
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool_with_clock(6, 1, clock.clone());
    let mut options = dummy_options(dir.path());
    options.min_processes = 1;

    // Saturate the first worker so a second one spawns
    let first = pool.get(&options).await.unwrap();
    let second = pool.get(&options).await.unwrap();
    assert_eq!(pool.process_count(), 2);
    drop(first);
    drop(second);

    clock.advance_us(3_600_000_000);
    pool.set_max_idle_time(Duration::from_secs(60));
    eventually("shrunk back to min", Duration::from_secs(3), || {
        pool.process_count() == 1
    })
    .await;
}

// ============================================================================
// Restart via restart.txt
// ============================================================================

#[tokio::test]
async fn test_restart_file_replaces_workers() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let options = dummy_options(dir.path());

    let first = pool.get(&options).await.unwrap();
    let old_gupid = first.gupid().to_string();
    drop(first);

    std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
    std::fs::write(dir.path().join("tmp/restart.txt"), "1").unwrap();

    // The next get notices the file, restarts the group and is served by
    // a fresh worker
    let second = pool.get(&options).await.unwrap();
    assert_ne!(second.gupid(), old_gupid);
    drop(second);

    // No second restart without another touch
    let third = pool.get(&options).await.unwrap();
    eventually("old worker destroyed", Duration::from_secs(2), || {
        pool.process_count() == 1
    })
    .await;
    drop(third);
}

#[tokio::test]
async fn test_restart_refills_min_processes_without_demand() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let mut options = dummy_options(dir.path());
    options.min_processes = 2;

    let session = pool.get(&options).await.unwrap();
    let old_gupid = session.gupid().to_string();
    drop(session);
    eventually("two workers before restart", Duration::from_secs(5), || {
        pool.process_count() == 2
    })
    .await;

    // Restart with nothing queued and no follow-up get: the group must
    // still be repopulated to min_processes on its own
    assert_eq!(
        pool.restart_groups_by_app_root(&dir.path().to_string_lossy()),
        1
    );
    eventually("replacements spawned", Duration::from_secs(5), || {
        pool.process_count() == 2
    })
    .await;
    let marker = format!("<gupid>{}</gupid>", old_gupid);
    eventually("old workers are gone", Duration::from_secs(5), || {
        !pool.to_xml(false).contains(&marker)
    })
    .await;
    assert!(!pool.is_spawning());
}

#[tokio::test]
async fn test_restart_groups_by_app_root() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let options = dummy_options(dir.path());

    let session = pool.get(&options).await.unwrap();
    let old_gupid = session.gupid().to_string();
    drop(session);

    let restarted = pool.restart_groups_by_app_root(&dir.path().to_string_lossy());
    assert_eq!(restarted, 1);
    assert_eq!(pool.restart_groups_by_app_root("/nonexistent-root"), 0);

    let session = pool.get(&options).await.unwrap();
    assert_ne!(session.gupid(), old_gupid);
}

// ============================================================================
// Disable / enable
// ============================================================================

#[tokio::test]
async fn test_disable_idle_process_among_several() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 1, 0);
    let options = dummy_options(dir.path());

    // Two workers, both idle afterwards
    let first = pool.get(&options).await.unwrap();
    let second = pool.get(&options).await.unwrap();
    let gupid = first.gupid().to_string();
    drop(first);
    drop(second);

    let result = pool.disable_process(&gupid).await;
    assert_eq!(result, spawnpool::DisableResult::Success);

    // Unknown gupid is a noop
    let result = pool.disable_process("missing").await;
    assert_eq!(result, spawnpool::DisableResult::Noop);
}

#[tokio::test]
async fn test_disable_busy_process_defers_until_drained() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 2, 0);
    let options = dummy_options(dir.path());

    let first = pool.get(&options).await.unwrap();
    let second = pool.get(&options).await.unwrap();
    assert_eq!(first.pid(), second.pid());
    let gupid = first.gupid().to_string();

    let pool_clone = Arc::clone(&pool);
    let gupid_clone = gupid.clone();
    let disable = tokio::spawn(async move { pool_clone.disable_process(&gupid_clone).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!disable.is_finished());

    drop(first);
    drop(second);
    let result = disable.await.unwrap();
    assert_eq!(result, spawnpool::DisableResult::Success);
}

// ============================================================================
// Out-of-band work
// ============================================================================

#[tokio::test]
async fn test_oobw_cycle_disables_and_reenables() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let options = dummy_options(dir.path());

    let session = pool.get(&options).await.unwrap();
    session.request_oobw();
    drop(session);

    // The machine disables the worker, runs the (trivial) hook, and puts
    // it back; requests keep working throughout
    tokio::time::sleep(Duration::from_millis(200)).await;
    let session = pool.get(&options).await.unwrap();
    drop(session);
}

// ============================================================================
// max_requests recycling
// ============================================================================

#[tokio::test]
async fn test_max_requests_recycles_worker() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let mut options = dummy_options(dir.path());
    options.max_requests = 2;

    let first = pool.get(&options).await.unwrap();
    let gupid = first.gupid().to_string();
    drop(first);
    let second = pool.get(&options).await.unwrap();
    assert_eq!(second.gupid(), gupid);
    drop(second);

    // The second close crossed the limit; the worker is recycled
    eventually("worker replaced", Duration::from_secs(5), || {
        pool.process_count() == 1
    })
    .await;
    let third = pool.get(&options).await.unwrap();
    assert_ne!(third.gupid(), gupid);
}

// ============================================================================
// SuperGroup initialization failure
// ============================================================================

#[tokio::test]
async fn test_missing_app_root_fails_the_get() {
    let pool = test_pool(6, 4, 0);
    let options = dummy_options(Path::new("/nonexistent-spawnpool-app"));

    let err = pool.get(&options).await.unwrap_err();
    match err {
        PoolError::Spawn(e) => {
            assert_eq!(e.kind, SpawnErrorKind::InternalError);
            assert!(e.message.contains("does not seem to contain"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(pool.super_group_count(), 0);
    assert_eq!(pool.process_count(), 0);
}

// ============================================================================
// Inspection
// ============================================================================

#[tokio::test]
async fn test_inspect_and_xml_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let options = dummy_options(dir.path());
    let session = pool.get(&options).await.unwrap();
    let gupid = session.gupid().to_string();

    let text = pool.inspect(&spawnpool::InspectOptions::default());
    assert!(text.contains("Max pool size : 6"));
    assert!(text.contains("Processes     : 1"));
    assert!(text.contains("Sessions: 1"));
    assert!(text.contains(&dir.path().to_string_lossy().into_owned()));

    let xml = pool.to_xml(true);
    assert!(xml.contains("<info version=\"2\">"));
    assert!(xml.contains("<process_count>1</process_count>"));
    assert!(xml.contains("<max>6</max>"));
    assert!(xml.contains(&format!("<gupid>{}</gupid>", gupid)));
    assert!(xml.contains("<life_status>alive</life_status>"));
    assert!(xml.contains("<enabled>enabled</enabled>"));
    assert!(xml.contains("<secret>"));

    let without_secrets = pool.to_xml(false);
    assert!(!without_secrets.contains("<secret>"));
    drop(session);
}

// ============================================================================
// Destroy
// ============================================================================

#[tokio::test]
async fn test_destroy_tears_everything_down() {
    let dir = tempfile::tempdir().unwrap();
    let pool = test_pool(6, 4, 0);
    let options = dummy_options(dir.path());
    let session = pool.get(&options).await.unwrap();
    drop(session);

    pool.destroy().await;
    assert_eq!(pool.super_group_count(), 0);
    assert_eq!(pool.process_count(), 0);
}

// ============================================================================
// Real processes: direct spawner end to end
// ============================================================================

#[tokio::test]
async fn test_direct_spawn_with_shell_loader() {
    let dir = tempfile::tempdir().unwrap();
    let loader = write_script(dir.path(), "loader.sh", WELL_BEHAVED_LOADER);
    let pool = test_pool(6, 4, 0);

    let mut options = Options::for_app_root(dir.path().to_string_lossy());
    options.spawn_method = SpawnMethod::Direct;
    options.start_command = Some(loader);
    options.start_timeout_ms = 10_000;

    let session = pool.get(&options).await.unwrap();
    assert!(session.pid() > 0);
    assert!(session.address().to_string().starts_with("unix:"));
    assert_eq!(pool.process_count(), 1);
    drop(session);

    pool.destroy().await;
}

#[tokio::test]
async fn test_dead_worker_is_detached_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let loader = write_script(dir.path(), "loader.sh", WELL_BEHAVED_LOADER);
    let pool = test_pool(6, 4, 0);

    let mut options = Options::for_app_root(dir.path().to_string_lossy());
    options.spawn_method = SpawnMethod::Direct;
    options.start_command = Some(loader);
    options.start_timeout_ms = 10_000;
    options.min_processes = 1;

    let session = pool.get(&options).await.unwrap();
    let old_pid = session.pid();
    drop(session);

    // An external agent SIGKILLs the worker behind our back
    unsafe {
        libc::kill(old_pid, libc::SIGKILL);
    }

    // The metrics collector notices within one cycle and detaches it
    let old_marker = format!("<pid>{}</pid>", old_pid);
    eventually("dead worker detached", Duration::from_secs(15), || {
        !pool.to_xml(false).contains(&old_marker)
    })
    .await;

    // A replacement comes up because the group dropped below
    // min_processes
    eventually("replacement spawned", Duration::from_secs(15), || {
        pool.process_count() == 1
    })
    .await;
    let session = pool.get(&options).await.unwrap();
    assert_ne!(session.pid(), old_pid);
    drop(session);

    pool.destroy().await;
}

#[tokio::test]
async fn test_spawn_error_surfaces_to_caller() {
    let dir = tempfile::tempdir().unwrap();
    let loader = write_script(
        dir.path(),
        "broken.sh",
        "#!/bin/sh\n\
         printf '!> Error\\n'\n\
         printf '!> html: true\\n'\n\
         printf '!> \\n'\n\
         printf '<html>boom</html>'\n",
    );
    let pool = test_pool(6, 4, 0);

    let mut options = Options::for_app_root(dir.path().to_string_lossy());
    options.spawn_method = SpawnMethod::Direct;
    options.start_command = Some(loader);
    options.start_timeout_ms = 10_000;

    let err = pool.get(&options).await.unwrap_err();
    match err {
        PoolError::Spawn(e) => {
            assert_eq!(e.kind, SpawnErrorKind::AppStartupExplainableError);
            assert!(e.html);
            assert_eq!(e.error_page.as_deref(), Some("<html>boom</html>"));
        }
        other => panic!("unexpected error: {}", other),
    }
    // No worker was added; capacity is unchanged
    assert_eq!(pool.process_count(), 0);
    assert_eq!(pool.capacity_used(), 0);
}

#[tokio::test]
async fn test_spawn_error_retries_remaining_queued_callers_once() {
    let dir = tempfile::tempdir().unwrap();
    let attempts_log = dir.path().join("attempts.log");
    let loader = write_script(
        dir.path(),
        "broken.sh",
        "#!/bin/sh\n\
         echo attempt >> \"$ATTEMPTS\"\n\
         printf '!> Error\\n'\n\
         printf '!> html: false\\n'\n\
         printf '!> \\n'\n\
         printf 'boom'\n",
    );
    let pool = test_pool(6, 4, 0);

    let mut options = Options::for_app_root(dir.path().to_string_lossy());
    options.spawn_method = SpawnMethod::Direct;
    options.start_command = Some(loader);
    options.start_timeout_ms = 10_000;
    options.environment_variables = vec![(
        "ATTEMPTS".to_string(),
        attempts_log.to_string_lossy().into_owned(),
    )];

    // Two callers queue behind the same failing spawn. The first one gets
    // the error of the first attempt; the second is retried exactly once
    // before it is failed as well.
    let outcomes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let outcomes = Arc::clone(&outcomes);
        pool.async_get(
            &options,
            Box::new(move |result| {
                let code = match result {
                    Ok(_) => "session".to_string(),
                    Err(e) => e.code().to_string(),
                };
                outcomes.lock().unwrap().push(code);
            }),
        );
    }

    eventually("both callers failed", Duration::from_secs(10), || {
        outcomes.lock().unwrap().len() == 2
    })
    .await;
    let outcomes = outcomes.lock().unwrap();
    assert!(outcomes
        .iter()
        .all(|code| code == "APP_STARTUP_EXPLAINABLE_ERROR"));

    // One attempt for the first caller, one bounded retry for the second
    let attempts = std::fs::read_to_string(&attempts_log).unwrap();
    assert_eq!(attempts.lines().count(), 2);
    assert_eq!(pool.process_count(), 0);
}

#[tokio::test]
async fn test_startup_timeout_kills_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let loader = write_script(dir.path(), "slow.sh", "#!/bin/sh\nsleep 60\n");
    let pool = test_pool(6, 4, 0);

    let mut options = Options::for_app_root(dir.path().to_string_lossy());
    options.spawn_method = SpawnMethod::Direct;
    options.start_command = Some(loader);
    options.start_timeout_ms = 500;

    let err = pool.get(&options).await.unwrap_err();
    match err {
        PoolError::Spawn(e) => assert_eq!(e.kind, SpawnErrorKind::AppStartupTimeout),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(pool.process_count(), 0);
}

#[tokio::test]
async fn test_stderr_is_captured_into_spawn_errors() {
    let dir = tempfile::tempdir().unwrap();
    let loader = write_script(
        dir.path(),
        "crasher.sh",
        "#!/bin/sh\n\
         echo 'undefined method `boom`' >&2\n\
         sleep 1\n\
         exit 1\n",
    );
    let pool = test_pool(6, 4, 0);

    let mut options = Options::for_app_root(dir.path().to_string_lossy());
    options.spawn_method = SpawnMethod::Direct;
    options.start_command = Some(loader);
    options.start_timeout_ms = 10_000;

    let err = pool.get(&options).await.unwrap_err();
    match err {
        PoolError::Spawn(e) => {
            assert_eq!(e.kind, SpawnErrorKind::AppStartupProtocolError);
            assert!(
                e.error_page.unwrap_or_default().contains("undefined method"),
                "stderr output should be attached to the error"
            );
        }
        other => panic!("unexpected error: {}", other),
    }
}
