//! Admin message server: length-prefixed array-of-strings frames over a
//! unix socket, guarded by per-command rights.
//!
//! Frame layout: a big-endian u16 payload length, then the payload with
//! each element NUL-terminated. The first frame on a connection must be
//! `["auth", <username>, <password>]`.

use crate::error::DisableResult;
use crate::pool::{InspectOptions, Pool};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Maximum accepted frame payload
const MAX_FRAME_SIZE: usize = 60_000;

/// A named permission an account must hold for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Right {
    Inspect,
    Detach,
    Disable,
    Restart,
    SetMax,
    Exit,
}

/// One admin account
#[derive(Debug, Clone)]
pub struct Account {
    pub password: String,
    pub rights: HashSet<Right>,
}

impl Account {
    pub fn new(password: impl Into<String>, rights: impl IntoIterator<Item = Right>) -> Self {
        Self {
            password: password.into(),
            rights: rights.into_iter().collect(),
        }
    }

    pub fn with_all_rights(password: impl Into<String>) -> Self {
        Self::new(
            password,
            [
                Right::Inspect,
                Right::Detach,
                Right::Disable,
                Right::Restart,
                Right::SetMax,
                Right::Exit,
            ],
        )
    }
}

/// Read one array frame. Returns None on EOF.
pub(crate) async fn read_frame(stream: &mut UnixStream) -> anyhow::Result<Option<Vec<String>>> {
    let mut header = [0u8; 2];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = u16::from_be_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes", size);
    }
    let mut payload = vec![0u8; size];
    stream.read_exact(&mut payload).await?;
    let mut items = Vec::new();
    let mut start = 0;
    for (index, byte) in payload.iter().enumerate() {
        if *byte == 0 {
            items.push(String::from_utf8_lossy(&payload[start..index]).into_owned());
            start = index + 1;
        }
    }
    if start != payload.len() {
        anyhow::bail!("frame payload not NUL-terminated");
    }
    Ok(Some(items))
}

/// Write one array frame
pub(crate) async fn write_frame(stream: &mut UnixStream, items: &[&str]) -> anyhow::Result<()> {
    let mut payload = Vec::new();
    for item in items {
        payload.extend_from_slice(item.as_bytes());
        payload.push(0);
    }
    if payload.len() > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes", payload.len());
    }
    stream
        .write_all(&(payload.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(&payload).await?;
    Ok(())
}

/// The admin command server for one pool
pub struct AdminServer {
    socket_path: PathBuf,
    pool: Arc<Pool>,
    accounts: HashMap<String, Account>,
    shutdown_rx: watch::Receiver<bool>,
    exit_tx: watch::Sender<bool>,
}

impl AdminServer {
    pub fn new(
        socket_path: PathBuf,
        pool: Arc<Pool>,
        accounts: HashMap<String, Account>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (exit_tx, _) = watch::channel(false);
        Self {
            socket_path,
            pool,
            accounts,
            shutdown_rx,
            exit_tx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "Admin server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut exit_rx = self.exit_tx.subscribe();
        let accounts = Arc::new(self.accounts);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let pool = Arc::clone(&self.pool);
                            let accounts = Arc::clone(&accounts);
                            let exit_tx = self.exit_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_connection(stream, pool, accounts, exit_tx).await
                                {
                                    debug!(error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
                _ = exit_rx.changed() => {
                    if *exit_rx.borrow() {
                        info!("Admin server exiting on command");
                        break;
                    }
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    pool: Arc<Pool>,
    accounts: Arc<HashMap<String, Account>>,
    exit_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    // First frame must authenticate
    let auth = match read_frame(&mut stream).await? {
        Some(frame) => frame,
        None => return Ok(()),
    };
    let account = match auth.as_slice() {
        [command, username, password] if command == "auth" => {
            match accounts.get(username) {
                Some(account) if account.password == *password => account.clone(),
                _ => {
                    warn!(username = %username, "Admin authentication failed");
                    write_frame(&mut stream, &["SecurityException", "Invalid credentials"])
                        .await?;
                    return Ok(());
                }
            }
        }
        _ => {
            write_frame(&mut stream, &["SecurityException", "Authentication required"]).await?;
            return Ok(());
        }
    };
    write_frame(&mut stream, &["ok"]).await?;

    while let Some(frame) = read_frame(&mut stream).await? {
        if frame.is_empty() {
            continue;
        }
        let command = frame[0].as_str();
        let args = &frame[1..];
        debug!(command, "Admin command");

        let required = match command {
            "inspect" | "toXml" => Right::Inspect,
            "detach" | "detach_app_group" => Right::Detach,
            "disable" => Right::Disable,
            "restart_app_group" => Right::Restart,
            "setMax" | "setMaxIdleTime" => Right::SetMax,
            "exit" => Right::Exit,
            _ => {
                write_frame(&mut stream, &["error", "Unknown command"]).await?;
                continue;
            }
        };
        if !account.rights.contains(&required) {
            write_frame(
                &mut stream,
                &["SecurityException", "Insufficient rights for this command"],
            )
            .await?;
            continue;
        }

        match (command, args) {
            ("inspect", args) => {
                let options = InspectOptions {
                    colorize: args.iter().any(|a| a == "colorize"),
                    verbose: args.iter().any(|a| a == "verbose"),
                };
                let text = pool.inspect(&options);
                write_frame(&mut stream, &["ok", &text]).await?;
            }
            ("toXml", args) => {
                let include_secrets = args.first().map(|a| a == "true").unwrap_or(true);
                let xml = pool.to_xml(include_secrets);
                write_frame(&mut stream, &["ok", &xml]).await?;
            }
            ("detach", [gupid]) => {
                let detached = pool.detach_process(gupid);
                write_frame(&mut stream, &[if detached { "true" } else { "false" }]).await?;
            }
            ("detach_app_group", [name]) => {
                let detached = pool.detach_super_group(name).await;
                write_frame(&mut stream, &[if detached { "true" } else { "false" }]).await?;
            }
            ("disable", [gupid]) => {
                let result = pool.disable_process(gupid).await;
                let reply = match result {
                    DisableResult::Success => "success",
                    DisableResult::Canceled => "canceled",
                    DisableResult::Noop => "noop",
                    DisableResult::Error | DisableResult::Deferred => "error",
                };
                write_frame(&mut stream, &[reply]).await?;
            }
            ("restart_app_group", [app_root]) => {
                let count = pool.restart_groups_by_app_root(app_root);
                write_frame(&mut stream, &["ok", &count.to_string()]).await?;
            }
            ("setMax", [value]) => match value.parse::<usize>() {
                Ok(max) if max > 0 => {
                    pool.set_max(max);
                    write_frame(&mut stream, &["ok"]).await?;
                }
                _ => {
                    write_frame(&mut stream, &["error", "Invalid max value"]).await?;
                }
            },
            ("setMaxIdleTime", [value]) => match value.parse::<u64>() {
                Ok(secs) => {
                    pool.set_max_idle_time(std::time::Duration::from_secs(secs));
                    write_frame(&mut stream, &["ok"]).await?;
                }
                Err(_) => {
                    write_frame(&mut stream, &["error", "Invalid idle time"]).await?;
                }
            },
            ("exit", _) => {
                write_frame(&mut stream, &["Bye"]).await?;
                let _ = exit_tx.send(true);
                return Ok(());
            }
            _ => {
                write_frame(&mut stream, &["error", "Wrong number of arguments"]).await?;
            }
        }
    }
    Ok(())
}
