//! Direct spawner: fork and exec a fresh loader for every worker

use crate::config::ResourceLocator;
use crate::error::{SpawnError, SpawnErrorKind};
use crate::negotiation::{watch_pipe, DebugDir, NegotiationContext, StderrCapture};
use crate::options::Options;
use crate::prepare::{self, SpawnPreparation};
use crate::process::{AdminChannel, NewProcess, Process};
use crate::spawner::SpawnerContext;
use crate::util;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

/// Spawns one worker per invocation by executing the language loader
/// directly. The child inherits a pipe pair on stdin/stdout as its admin
/// channel plus a separate stderr pipe.
pub(crate) struct DirectSpawner {
    locator: ResourceLocator,
    creation_time_us: u64,
}

impl DirectSpawner {
    pub fn new(locator: ResourceLocator, creation_time_us: u64) -> Self {
        Self {
            locator,
            creation_time_us,
        }
    }

    fn command_for(&self, options: &Options) -> Result<Vec<String>, SpawnError> {
        if let Some(command) = &options.start_command {
            let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return Err(SpawnError::new(
                    SpawnErrorKind::InternalError,
                    "The start command is empty",
                ));
            }
            return Ok(parts);
        }
        self.locator
            .loader_command(options.app_type)
            .ok_or_else(|| {
                SpawnError::new(
                    SpawnErrorKind::InternalError,
                    format!(
                        "Generic applications need an explicit start command \
                         (app root: {})",
                        options.app_root
                    ),
                )
            })
    }

    fn build_command(
        &self,
        argv: &[String],
        options: &Options,
        prep: &SpawnPreparation,
        debug_dir: &DebugDir,
    ) -> Command {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd.env("IN_SPAWNPOOL", "1");
        cmd.env("PYTHONUNBUFFERED", "1");
        cmd.env("RAILS_ENV", &options.environment);
        cmd.env("RACK_ENV", &options.environment);
        cmd.env("WSGI_ENV", &options.environment);
        cmd.env("SPAWNPOOL_ENV", &options.environment);
        cmd.env("SPAWNPOOL_DEBUG_DIR", debug_dir.path());
        if !options.base_uri.is_empty() && options.base_uri != "/" {
            cmd.env("RAILS_RELATIVE_URL_ROOT", &options.base_uri);
            cmd.env("RACK_BASE_URI", &options.base_uri);
            cmd.env("SPAWNPOOL_BASE_URI", &options.base_uri);
        }
        for (key, value) in &options.environment_variables {
            cmd.env(key, value);
        }
        if prep.switch_user {
            cmd.env("USER", &prep.username);
            cmd.env("LOGNAME", &prep.username);
            cmd.env("SHELL", &prep.shell);
            cmd.env("HOME", &prep.home);
        }
        cmd.env("PWD", &prep.app_root_inside_chroot);

        let child_prep = prep.clone();
        unsafe {
            cmd.pre_exec(move || prepare::apply_in_child(&child_prep));
        }
        cmd
    }

    /// Start a worker and run the negotiation protocol with it
    pub async fn spawn(
        &self,
        options: &Options,
        ctx: &SpawnerContext,
    ) -> Result<Process, SpawnError> {
        let spawn_start_time_us = ctx.clock.now_us();
        let argv = self.command_for(options)?;
        let prep = prepare::prepare_spawn(options)?;
        prepare::check_directory_chain(&prep)?;

        let gupid = util::generate_gupid(ctx.clock.as_ref(), &ctx.config.random);
        let connect_password = ctx.config.random.ascii_string(43);
        let debug_dir = DebugDir::new(
            "spawnpool",
            std::process::id() as i32,
            &ctx.config.random.ascii_string(8),
        )
        .map_err(|e| {
            SpawnError::new(
                SpawnErrorKind::InternalError,
                format!("Cannot create debug directory: {}", e),
            )
        })?;

        debug!(app_root = %options.app_root, command = %argv.join(" "), "Spawning worker directly");
        let mut child = self
            .build_command(&argv, options, &prep, &debug_dir)
            .spawn()
            .map_err(|e| {
                SpawnError::new(
                    SpawnErrorKind::InternalError,
                    format!("Cannot execute \"{}\": {}", argv[0], e),
                )
            })?;

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let mut negotiation = NegotiationContext {
            pid,
            gupid: gupid.clone(),
            connect_password: connect_password.clone(),
            deadline: Instant::now() + options.start_timeout(),
            stderr: Some(StderrCapture::start(
                stderr,
                pid,
                ctx.config.forward_stderr,
            )),
            debug_dir: Some(debug_dir),
            expected_uid: Some(prep.uid),
            negotiating_preloader: false,
            forward_stdout: ctx.config.forward_stdout,
            root: self.locator.root().to_path_buf(),
        };

        let mut reader = BufReader::new(stdout);
        let sockets = match negotiation.negotiate(&mut reader, &mut stdin, options).await {
            Ok(sockets) => sockets,
            Err(e) => {
                // SIGKILL and reap; the error already carries the child's
                // stderr and debug dir
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                return Err(e);
            }
        };

        // Anything else the worker prints on stdout is diagnostics
        watch_pipe(reader, pid, "stdout", ctx.config.forward_stdout);

        info!(pid, gupid = %gupid, app_root = %options.app_root, "Worker spawned");
        Ok(Process::new(NewProcess {
            pid,
            gupid,
            connect_password,
            admin: Some(AdminChannel::Pipe(stdin)),
            child: Some(child),
            sockets,
            spawner_creation_time_us: self.creation_time_us,
            spawn_start_time_us,
            now_us: ctx.clock.now_us(),
        }))
    }
}
