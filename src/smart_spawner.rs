//! Smart spawner: a long-lived preloader loads the application once, then
//! forks a cheap session child per spawn request

use crate::config::ResourceLocator;
use crate::error::{SpawnError, SpawnErrorKind};
use crate::negotiation::{watch_pipe, NegotiationContext, StderrCapture};
use crate::options::Options;
use crate::prepare;
use crate::process::{AdminChannel, NewProcess, Process};
use crate::socket::SocketAddress;
use crate::spawner::SpawnerContext;
use crate::util;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A running preloader child
struct Preloader {
    pid: i32,
    child: Child,
    /// Keeping this open keeps the preloader alive; dropping it asks the
    /// preloader to exit
    _stdin: ChildStdin,
    /// Unix socket the preloader accepts `spawn` commands on
    command_socket: PathBuf,
}

/// Spawner that amortizes application startup cost across workers. The
/// preloader is started lazily on the first spawn and reaped by the pool's
/// garbage collector once idle for longer than the configured preloader
/// idle time.
pub(crate) struct SmartSpawner {
    locator: ResourceLocator,
    preloader_command: Vec<String>,
    /// Options the preloader was (or will be) started with
    options: Options,
    creation_time_us: u64,
    last_used_us: AtomicU64,
    state: tokio::sync::Mutex<Option<Preloader>>,
}

impl SmartSpawner {
    pub fn new(
        locator: ResourceLocator,
        preloader_command: Vec<String>,
        options: Options,
        creation_time_us: u64,
    ) -> Self {
        Self {
            locator,
            preloader_command,
            options,
            creation_time_us,
            last_used_us: AtomicU64::new(creation_time_us),
            state: tokio::sync::Mutex::new(None),
        }
    }

    pub fn last_used_us(&self) -> u64 {
        self.last_used_us.load(Ordering::Relaxed)
    }

    /// Whether a preloader is currently alive
    pub async fn has_preloader(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Kill the preloader if one is running. Called by the GC when the
    /// preloader has idled past its deadline, and on group shutdown.
    pub async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut preloader) = state.take() {
            info!(pid = preloader.pid, "Stopping idle preloader");
            let _ = preloader.child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), preloader.child.wait()).await;
        }
    }

    async fn start_preloader(
        &self,
        options: &Options,
        ctx: &SpawnerContext,
    ) -> Result<Preloader, SpawnError> {
        let prep = prepare::prepare_spawn(options)?;
        prepare::check_directory_chain(&prep)?;

        debug!(
            app_root = %options.app_root,
            command = %self.preloader_command.join(" "),
            "Starting preloader"
        );
        let mut cmd = Command::new(&self.preloader_command[0]);
        cmd.args(&self.preloader_command[1..]);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.env("IN_SPAWNPOOL", "1");
        cmd.env("RAILS_ENV", &options.environment);
        cmd.env("RACK_ENV", &options.environment);
        cmd.env("SPAWNPOOL_ENV", &options.environment);
        for (key, value) in &options.environment_variables {
            cmd.env(key, value);
        }
        if prep.switch_user {
            cmd.env("USER", &prep.username);
            cmd.env("LOGNAME", &prep.username);
            cmd.env("SHELL", &prep.shell);
            cmd.env("HOME", &prep.home);
        }
        let child_prep = prep.clone();
        unsafe {
            cmd.pre_exec(move || prepare::apply_in_child(&child_prep));
        }

        let mut child = cmd.spawn().map_err(|e| {
            SpawnError::new(
                SpawnErrorKind::PreloaderStartupProtocolError,
                format!(
                    "Cannot execute the preloader \"{}\": {}",
                    self.preloader_command[0], e
                ),
            )
        })?;
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let mut negotiation = NegotiationContext {
            pid,
            gupid: util::generate_gupid(ctx.clock.as_ref(), &ctx.config.random),
            connect_password: ctx.config.random.ascii_string(43),
            deadline: Instant::now() + options.start_timeout(),
            stderr: Some(StderrCapture::start(
                stderr,
                pid,
                ctx.config.forward_stderr,
            )),
            debug_dir: None,
            expected_uid: Some(prep.uid),
            negotiating_preloader: true,
            forward_stdout: ctx.config.forward_stdout,
            root: self.locator.root().to_path_buf(),
        };

        let mut reader = BufReader::new(stdout);
        let sockets = match negotiation.negotiate(&mut reader, &mut stdin, options).await {
            Ok(sockets) => sockets,
            Err(e) => {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                return Err(e);
            }
        };

        // The preloader advertises exactly one socket: its command socket
        let command_socket = sockets
            .iter()
            .find_map(|s| match &s.address {
                SocketAddress::Unix(path) => Some(path.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                SpawnError::new(
                    SpawnErrorKind::PreloaderStartupProtocolError,
                    "The preloader did not advertise a unix command socket",
                )
            })?;

        watch_pipe(reader, pid, "stdout", ctx.config.forward_stdout);
        info!(pid, app_root = %options.app_root, "Preloader started");
        Ok(Preloader {
            pid,
            child,
            _stdin: stdin,
            command_socket,
        })
    }

    /// Ask the preloader to fork a session child. Returns the child's PID
    /// and the unix address of its admin socket.
    async fn send_spawn_command(
        &self,
        preloader: &Preloader,
        options: &Options,
        deadline: Instant,
    ) -> Result<(i32, PathBuf), SpawnCommandFailure> {
        let io_err = |e: std::io::Error| SpawnCommandFailure::PreloaderDied(e);

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(SpawnCommandFailure::Timeout)?;
        let stream = tokio::time::timeout(remaining, UnixStream::connect(&preloader.command_socket))
            .await
            .map_err(|_| SpawnCommandFailure::Timeout)?
            .map_err(io_err)?;
        let (read_half, mut write_half) = stream.into_split();

        let mut request = String::from("spawn\n");
        for (key, value) in options.to_wire() {
            request.push_str(&format!("{}: {}\n", key, value));
        }
        request.push('\n');
        write_half.write_all(request.as_bytes()).await.map_err(io_err)?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(SpawnCommandFailure::Timeout)?;
        let result = tokio::time::timeout(remaining, async {
            reader.read_line(&mut line).await?;
            let status = line.trim_end().to_string();
            if status != "OK" && status != "Error" {
                return Ok::<_, std::io::Error>(SpawnCommandResult::Garbage(status));
            }
            // Both responses carry key: value lines up to a blank line
            let mut pid: Option<i32> = None;
            let mut admin_socket: Option<PathBuf> = None;
            let mut html = false;
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    break;
                }
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    break;
                }
                match trimmed.split_once(": ") {
                    Some(("pid", value)) => pid = value.parse().ok(),
                    Some(("admin-socket", value)) => {
                        if let Some(path) = value.strip_prefix("unix:") {
                            admin_socket = Some(PathBuf::from(path));
                        }
                    }
                    Some(("html", value)) => html = value == "true",
                    _ => {}
                }
            }
            if status == "Error" {
                let mut body = String::new();
                use tokio::io::AsyncReadExt;
                let _ = reader.read_to_string(&mut body).await;
                return Ok(SpawnCommandResult::Error { body, html });
            }
            Ok(SpawnCommandResult::Ok { pid, admin_socket })
        })
        .await
        .map_err(|_| SpawnCommandFailure::Timeout)?
        .map_err(io_err)?;

        match result {
            SpawnCommandResult::Ok {
                pid: Some(pid),
                admin_socket: Some(admin_socket),
            } => Ok((pid, admin_socket)),
            SpawnCommandResult::Ok { .. } => Err(SpawnCommandFailure::Protocol(
                "the preloader's spawn response was missing the pid or admin-socket"
                    .to_string(),
            )),
            SpawnCommandResult::Garbage(status) => Err(SpawnCommandFailure::Protocol(format!(
                "the preloader sent an unknown spawn response \"{}\"",
                status
            ))),
            SpawnCommandResult::Error { body, html } => Err(SpawnCommandFailure::App(
                SpawnError::new(
                    SpawnErrorKind::AppStartupExplainableError,
                    "An error occurred while starting the web application",
                )
                .with_error_page(body, html),
            )),
        }
    }

    /// Spawn one worker through the preloader, starting or restarting the
    /// preloader as needed. A dead preloader gets one restart attempt.
    pub async fn spawn(
        &self,
        options: &Options,
        ctx: &SpawnerContext,
    ) -> Result<Process, SpawnError> {
        let spawn_start_time_us = ctx.clock.now_us();
        self.last_used_us.store(spawn_start_time_us, Ordering::Relaxed);
        let deadline = Instant::now() + options.start_timeout();
        let mut state = self.state.lock().await;

        let mut attempts_left = 2;
        let (pid, admin_socket) = loop {
            if state.is_none() {
                *state = Some(self.start_preloader(&self.options, ctx).await?);
            }
            let preloader = state.as_ref().expect("preloader was just started");
            match self.send_spawn_command(preloader, options, deadline).await {
                Ok(result) => break result,
                Err(SpawnCommandFailure::App(e)) => return Err(e),
                Err(SpawnCommandFailure::Timeout) => {
                    return Err(SpawnError::new(
                        SpawnErrorKind::AppStartupTimeout,
                        "The preloader did not fork a worker in time",
                    ))
                }
                Err(SpawnCommandFailure::Protocol(msg)) => {
                    self.drop_preloader(&mut state).await;
                    return Err(SpawnError::new(
                        SpawnErrorKind::AppStartupProtocolError,
                        format!("An error occurred while starting the web application: {}", msg),
                    ));
                }
                Err(SpawnCommandFailure::PreloaderDied(e)) => {
                    // The preloader may have been killed behind our back;
                    // restart it once and retry
                    attempts_left -= 1;
                    warn!(error = %e, "Preloader connection failed; restarting it");
                    self.drop_preloader(&mut state).await;
                    if attempts_left == 0 {
                        return Err(SpawnError::new(
                            SpawnErrorKind::AppStartupProtocolError,
                            format!("Cannot talk to the preloader: {}", e),
                        ));
                    }
                }
            }
        };

        // Negotiate with the forked child over its admin socket
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        let stream = tokio::time::timeout(remaining, UnixStream::connect(&admin_socket))
            .await
            .map_err(|_| {
                SpawnError::new(
                    SpawnErrorKind::AppStartupTimeout,
                    "Timed out connecting to the forked worker's admin socket",
                )
            })?
            .map_err(|e| {
                SpawnError::new(
                    SpawnErrorKind::AppStartupProtocolError,
                    format!("Cannot connect to the forked worker's admin socket: {}", e),
                )
            })?;
        let (read_half, mut write_half) = stream.into_split();

        let gupid = util::generate_gupid(ctx.clock.as_ref(), &ctx.config.random);
        let connect_password = ctx.config.random.ascii_string(43);
        let mut negotiation = NegotiationContext {
            pid,
            gupid: gupid.clone(),
            connect_password: connect_password.clone(),
            deadline,
            stderr: None,
            debug_dir: None,
            expected_uid: None,
            negotiating_preloader: false,
            forward_stdout: ctx.config.forward_stdout,
            root: self.locator.root().to_path_buf(),
        };
        let mut reader = BufReader::new(read_half);
        let sockets = match negotiation.negotiate(&mut reader, &mut write_half, options).await {
            Ok(sockets) => sockets,
            Err(e) => {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
                return Err(e);
            }
        };
        watch_pipe(reader, pid, "admin", ctx.config.forward_stdout);

        self.last_used_us.store(ctx.clock.now_us(), Ordering::Relaxed);
        info!(pid, gupid = %gupid, app_root = %options.app_root, "Worker forked by preloader");
        Ok(Process::new(NewProcess {
            pid,
            gupid,
            connect_password,
            admin: Some(AdminChannel::Stream(write_half)),
            child: None,
            sockets,
            spawner_creation_time_us: self.creation_time_us,
            spawn_start_time_us,
            now_us: ctx.clock.now_us(),
        }))
    }

    async fn drop_preloader(&self, state: &mut Option<Preloader>) {
        if let Some(mut preloader) = state.take() {
            let _ = preloader.child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), preloader.child.wait()).await;
        }
    }
}

enum SpawnCommandResult {
    Ok {
        pid: Option<i32>,
        admin_socket: Option<PathBuf>,
    },
    Garbage(String),
    Error { body: String, html: bool },
}

enum SpawnCommandFailure {
    /// Connection-level failure; the preloader is probably dead
    PreloaderDied(std::io::Error),
    /// The preloader answered nonsense
    Protocol(String),
    /// The forked child reported a startup error
    App(SpawnError),
    Timeout,
}
