//! The startup negotiation protocol spoken with freshly spawned children.
//!
//! Line-based, UTF-8, LF-terminated, over the child's admin channel:
//!
//! 1. child: `I have control 1.0`
//! 2. parent: `You have control 1.0`, `key: value` lines, blank line
//! 3. child: `Ready` or `Error`
//! 4. on `Ready`: `socket: name;address;protocol;concurrency` lines, blank
//! 5. on `Error`: `key: value` metadata, blank, free-form body until EOF
//!
//! Child lines prefixed with `!> ` are protocol; everything else is
//! diagnostic output and goes to the log sink.

use crate::error::{SpawnError, SpawnErrorKind};
use crate::options::Options;
use crate::socket::{Socket, SocketList};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest protocol line a child may send
pub(crate) const MAX_LINE_LENGTH: usize = 4096;

const PROTOCOL_PREFIX: &str = "!> ";

/// Working state for one negotiation
pub(crate) struct NegotiationContext {
    pub pid: i32,
    pub gupid: String,
    pub connect_password: String,
    pub deadline: Instant,
    pub stderr: Option<StderrCapture>,
    pub debug_dir: Option<DebugDir>,
    /// UID the child's unix sockets must be owned by
    pub expected_uid: Option<u32>,
    /// Selects the PRELOADER_* error kinds
    pub negotiating_preloader: bool,
    pub forward_stdout: bool,
    /// Our own installation root, announced to the child
    pub root: PathBuf,
}

impl NegotiationContext {
    fn timeout_kind(&self) -> SpawnErrorKind {
        if self.negotiating_preloader {
            SpawnErrorKind::PreloaderStartupTimeout
        } else {
            SpawnErrorKind::AppStartupTimeout
        }
    }

    fn protocol_error_kind(&self) -> SpawnErrorKind {
        if self.negotiating_preloader {
            SpawnErrorKind::PreloaderStartupProtocolError
        } else {
            SpawnErrorKind::AppStartupProtocolError
        }
    }

    fn explainable_kind(&self) -> SpawnErrorKind {
        if self.negotiating_preloader {
            SpawnErrorKind::PreloaderStartupExplainableError
        } else {
            SpawnErrorKind::AppStartupExplainableError
        }
    }

    fn what(&self) -> &'static str {
        if self.negotiating_preloader {
            "preloader"
        } else {
            "web application"
        }
    }

    /// Build a SpawnError carrying captured stderr and debug-dir contents
    pub(crate) fn startup_error(&mut self, kind: SpawnErrorKind, message: String) -> SpawnError {
        let mut err = SpawnError::new(kind, message);
        if let Some(stderr) = &self.stderr {
            let captured = stderr.snapshot();
            if !captured.is_empty() {
                err.error_page = Some(captured);
            }
        }
        if let Some(debug_dir) = &self.debug_dir {
            for (name, contents) in debug_dir.read_all() {
                err.annotate(name, contents);
            }
        }
        err
    }

    fn timeout_error(&mut self, phase: &str) -> SpawnError {
        let kind = self.timeout_kind();
        self.startup_error(
            kind,
            format!(
                "An error occurred while starting the {}: it did not write a {} in time",
                self.what(),
                phase
            ),
        )
    }

    fn protocol_error(&mut self, detail: String) -> SpawnError {
        let kind = self.protocol_error_kind();
        self.startup_error(
            kind,
            format!(
                "An error occurred while starting the {}: {}",
                self.what(),
                detail
            ),
        )
    }

    fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline.checked_duration_since(Instant::now())
    }

    /// Read the next protocol line. Non-protocol lines are forwarded to
    /// the log sink and appended to the stderr capture. Returns None at
    /// EOF. The elapsed time of every read counts against the deadline.
    pub(crate) async fn read_message_line<R>(
        &mut self,
        reader: &mut R,
        phase: &str,
    ) -> Result<Option<String>, SpawnError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        loop {
            let remaining = match self.remaining() {
                Some(d) if !d.is_zero() => d,
                _ => return Err(self.timeout_error(phase)),
            };
            let mut line = String::new();
            let read = tokio::time::timeout(remaining, reader.read_line(&mut line)).await;
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    let kind = self.protocol_error_kind();
                    return Err(self.startup_error(
                        kind,
                        format!(
                            "An error occurred while starting the {}: I/O error while \
                             reading its {}: {}",
                            self.what(),
                            phase,
                            e
                        ),
                    ));
                }
                Err(_) => return Err(self.timeout_error(phase)),
            };
            if n == 0 {
                return Ok(None);
            }
            if n > MAX_LINE_LENGTH {
                return Err(
                    self.protocol_error(format!("it sent a line longer than {} bytes", n - 1))
                );
            }
            if !line.ends_with('\n') {
                return Err(self.protocol_error(
                    "it sent a line without a newline character in its startup response"
                        .to_string(),
                ));
            }
            let trimmed = line.trim_end_matches('\n');
            if let Some(payload) = trimmed.strip_prefix(PROTOCOL_PREFIX) {
                debug!(pid = self.pid, line = payload, "Child protocol line");
                return Ok(Some(payload.to_string()));
            }
            // Bare "!>" marks an empty protocol line (the blank separator)
            if trimmed == "!>" {
                return Ok(Some(String::new()));
            }
            if self.forward_stdout {
                info!(pid = self.pid, "[App stdout] {}", trimmed);
            } else {
                debug!(pid = self.pid, "[App stdout] {}", trimmed);
            }
            if let Some(stderr) = &self.stderr {
                stderr.append(trimmed);
            }
        }
    }

    /// Send the `You have control` header block with all spawn arguments
    async fn send_spawn_request<W>(
        &mut self,
        writer: &mut W,
        options: &Options,
    ) -> Result<(), SpawnError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut data = String::from("You have control 1.0\n");
        data.push_str(&format!("spawnpool_root: {}\n", self.root.display()));
        data.push_str(&format!(
            "spawnpool_version: {}\n",
            env!("CARGO_PKG_VERSION")
        ));
        data.push_str(&format!("gupid: {}\n", self.gupid));
        data.push_str(&format!("connect_password: {}\n", self.connect_password));
        if let Some(debug_dir) = &self.debug_dir {
            data.push_str(&format!("debug_dir: {}\n", debug_dir.path().display()));
        }
        for (key, value) in options.to_wire() {
            data.push_str(&format!("{}: {}\n", key, value));
        }
        data.push('\n');

        match writer.write_all(data.as_bytes()).await {
            Ok(()) => {
                let _ = writer.flush().await;
                Ok(())
            }
            // A child that died early may have written an error response
            // before reading our arguments; prefer showing that
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(pid = self.pid, "EPIPE while sending spawn arguments");
                Ok(())
            }
            Err(e) => {
                let kind = self.protocol_error_kind();
                Err(self.startup_error(
                    kind,
                    format!(
                        "An error occurred while starting the {}: I/O error while \
                         sending the spawn arguments: {}",
                        self.what(),
                        e
                    ),
                ))
            }
        }
    }

    /// Parse the `socket:` advertisements after a `Ready` response
    async fn handle_spawn_response<R>(&mut self, reader: &mut R) -> Result<SocketList, SpawnError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut sockets = SocketList::new();
        loop {
            let line = match self.read_message_line(reader, "startup response").await? {
                Some(line) => line,
                None => {
                    return Err(self.protocol_error(
                        "it unexpectedly closed the connection while sending its \
                         startup response"
                            .to_string(),
                    ))
                }
            };
            if line.is_empty() {
                break;
            }
            let (key, value) = match line.split_once(": ") {
                Some(pair) => pair,
                None => {
                    return Err(self.protocol_error(
                        "it sent a startup response line without separator".to_string(),
                    ))
                }
            };
            if key == "socket" {
                let socket = match Socket::parse_advertisement(value) {
                    Ok(socket) => socket,
                    Err(e) => return Err(self.protocol_error(e)),
                };
                if let Err(mut e) = socket.validate(self.expected_uid) {
                    e.kind = self.protocol_error_kind();
                    return Err(e);
                }
                sockets.add(socket);
            } else {
                return Err(self.protocol_error(format!(
                    "it sent an unknown startup response line called \"{}\"",
                    key
                )));
            }
        }
        if !sockets.has_session_sockets() {
            return Err(
                self.protocol_error("it did not advertise any session sockets".to_string())
            );
        }
        Ok(sockets)
    }

    /// Parse an `Error` response: metadata, blank, body until EOF
    pub(crate) async fn handle_error_response<R>(&mut self, reader: &mut R) -> SpawnError
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut attributes: BTreeMap<String, String> = BTreeMap::new();
        loop {
            let line = match self.read_message_line(reader, "error response").await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return self.protocol_error(
                        "it unexpectedly closed the connection while sending its \
                         startup response"
                            .to_string(),
                    )
                }
                Err(e) => return e,
            };
            if line.is_empty() {
                break;
            }
            match line.split_once(": ") {
                Some((key, value)) => {
                    attributes.insert(key.to_string(), value.to_string());
                }
                None => {
                    return self.protocol_error(
                        "it sent a startup response line without separator".to_string(),
                    )
                }
            }
        }

        // The body is free-form until EOF, still bounded by the deadline
        let mut body = String::new();
        loop {
            let remaining = match self.remaining() {
                Some(d) if !d.is_zero() => d,
                _ => return self.timeout_error("error response"),
            };
            let mut chunk = String::new();
            match tokio::time::timeout(remaining, reader.read_line(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => body.push_str(&chunk),
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let html = attributes.get("html").map(|v| v == "true").unwrap_or(false);
        let kind = self.explainable_kind();
        let mut err = SpawnError::new(
            kind,
            format!("An error occurred while starting the {}", self.what()),
        )
        .with_error_page(body, html);
        if let Some(debug_dir) = &self.debug_dir {
            for (name, contents) in debug_dir.read_all() {
                err.annotate(name, contents);
            }
        }
        err
    }

    /// Run the whole negotiation and return the advertised socket list
    pub(crate) async fn negotiate<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        options: &Options,
    ) -> Result<SocketList, SpawnError>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let line = self.read_message_line(reader, "handshake message").await?;
        match line.as_deref() {
            Some("I have control 1.0") => {
                self.send_spawn_request(writer, options).await?;
                let response = self.read_message_line(reader, "startup response").await?;
                match response.as_deref() {
                    Some("Ready") => self.handle_spawn_response(reader).await,
                    Some("Error") => Err(self.handle_error_response(reader).await),
                    Some(other) => {
                        let other = other.to_string();
                        Err(self.protocol_error(format!(
                            "it sent an unknown response type \"{}\"",
                            other
                        )))
                    }
                    None => Err(self.protocol_error(
                        "it unexpectedly closed the connection during the handshake"
                            .to_string(),
                    )),
                }
            }
            Some("Error") => Err(self.handle_error_response(reader).await),
            Some(other) => {
                let other = other.to_string();
                Err(self
                    .protocol_error(format!("it sent an unknown handshake message \"{}\"", other)))
            }
            None => Err(self.protocol_error(
                "it unexpectedly closed the connection before the handshake".to_string(),
            )),
        }
    }
}

/// Captures a child's stderr in the background. The captured text is
/// attached to spawn failures; each line is also forwarded to the log
/// sink. The reader task keeps running for the lifetime of the process.
pub(crate) struct StderrCapture {
    buffer: Arc<Mutex<String>>,
}

impl StderrCapture {
    pub fn start<R>(stderr: R, pid: i32, forward: bool) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(String::new()));
        let capture = Self {
            buffer: Arc::clone(&buffer),
        };
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end_matches('\n');
                        if forward {
                            info!(pid, "[App stderr] {}", trimmed);
                        } else {
                            debug!(pid, "[App stderr] {}", trimmed);
                        }
                        let mut buf = buffer.lock();
                        buf.push_str(trimmed);
                        buf.push('\n');
                    }
                }
            }
        });
        capture
    }

    pub fn append(&self, line: &str) {
        let mut buf = self.buffer.lock();
        buf.push_str(line);
        buf.push('\n');
    }

    pub fn snapshot(&self) -> String {
        self.buffer.lock().clone()
    }
}

/// Forward the rest of a child's stdout to the log sink after negotiation
/// has finished with it
pub(crate) fn watch_pipe<R>(reader: R, pid: i32, channel: &'static str, forward: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches('\n');
                    if forward {
                        info!(pid, "[App {}] {}", channel, trimmed);
                    } else {
                        debug!(pid, "[App {}] {}", channel, trimmed);
                    }
                }
            }
        }
    });
}

/// Scratch directory the child may fill with diagnostics; slurped into
/// spawn failures and removed afterwards
pub(crate) struct DebugDir {
    path: PathBuf,
}

impl DebugDir {
    pub fn new(prefix: &str, pid: i32, tag: &str) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("{}.{}-{}", prefix, pid, tag));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read debug dir");
                return result;
            }
        };
        for entry in entries.flatten() {
            if let Ok(contents) = std::fs::read_to_string(entry.path()) {
                result.insert(entry.file_name().to_string_lossy().into_owned(), contents);
            }
        }
        result
    }
}

impl Drop for DebugDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn test_context() -> NegotiationContext {
        NegotiationContext {
            pid: 1234,
            gupid: "abc-defghijklmn".to_string(),
            connect_password: "secret".to_string(),
            deadline: Instant::now() + Duration::from_secs(5),
            stderr: None,
            debug_dir: None,
            expected_uid: None,
            negotiating_preloader: false,
            forward_stdout: false,
            root: PathBuf::from("/opt/spawnpool"),
        }
    }

    async fn run_negotiation(
        child_script: Vec<u8>,
        mut ctx: NegotiationContext,
    ) -> (Result<SocketList, SpawnError>, Vec<u8>) {
        let (child_end, mut parent_read) = tokio::io::duplex(64 * 1024);
        let (mut parent_write, child_input) = tokio::io::duplex(64 * 1024);
        // Child side: dump the script, then capture what the parent sent
        let writer_task = tokio::spawn(async move {
            let (_, mut write_half) = tokio::io::split(child_end);
            write_half.write_all(&child_script).await.unwrap();
            drop(write_half);
            let (mut read_half, _) = tokio::io::split(child_input);
            let mut received = Vec::new();
            use tokio::io::AsyncReadExt;
            let _ = read_half.read_to_end(&mut received).await;
            received
        });
        let options = Options::for_app_root("/srv/app");
        let mut reader = BufReader::new(&mut parent_read);
        let result = ctx.negotiate(&mut reader, &mut parent_write, &options).await;
        drop(parent_write);
        let received = writer_task.await.unwrap();
        (result, received)
    }

    #[tokio::test]
    async fn test_successful_negotiation() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("app.socket");
        std::fs::write(&sock, "").unwrap();
        let script = format!(
            "!> I have control 1.0\n\
             !> Ready\n\
             !> socket: main;unix:{};session;4\n\
             !> \n",
            sock.display()
        );
        let (result, received) = run_negotiation(script.into_bytes(), test_context()).await;
        let sockets = result.unwrap();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets.total_concurrency(), 4);

        let sent = String::from_utf8(received).unwrap();
        assert!(sent.starts_with("You have control 1.0\n"));
        assert!(sent.contains("gupid: abc-defghijklmn\n"));
        assert!(sent.contains("connect_password: secret\n"));
        assert!(sent.contains("app_root: /srv/app\n"));
        assert!(sent.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn test_diagnostic_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("app.socket");
        std::fs::write(&sock, "").unwrap();
        let script = format!(
            "Booting application...\n\
             !> I have control 1.0\n\
             Loaded 42 gems\n\
             !> Ready\n\
             !> socket: main;unix:{};session;1\n\
             !> \n",
            sock.display()
        );
        let (result, _) = run_negotiation(script.into_bytes(), test_context()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_explainable_error_response() {
        let script = b"!> Error\n\
            !> html: true\n\
            !> \n\
            <html>boom</html>"
            .to_vec();
        let (result, _) = run_negotiation(script, test_context()).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupExplainableError);
        assert!(err.html);
        assert_eq!(err.error_page.as_deref(), Some("<html>boom</html>"));
    }

    #[tokio::test]
    async fn test_error_after_handshake() {
        let script = b"!> I have control 1.0\n\
            !> Error\n\
            !> html: false\n\
            !> \n\
            plain text failure\n"
            .to_vec();
        let (result, _) = run_negotiation(script, test_context()).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupExplainableError);
        assert!(!err.html);
        assert_eq!(err.error_page.as_deref(), Some("plain text failure\n"));
    }

    #[tokio::test]
    async fn test_bad_handshake_is_protocol_error() {
        let (result, _) =
            run_negotiation(b"!> I am a teapot\n".to_vec(), test_context()).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupProtocolError);
    }

    #[tokio::test]
    async fn test_eof_is_protocol_error() {
        let (result, _) = run_negotiation(Vec::new(), test_context()).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupProtocolError);
        assert!(err.message.contains("closed the connection"));
    }

    #[tokio::test]
    async fn test_no_session_sockets_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("admin.socket");
        std::fs::write(&sock, "").unwrap();
        let script = format!(
            "!> I have control 1.0\n\
             !> Ready\n\
             !> socket: admin;unix:{};admin;1\n\
             !> \n",
            sock.display()
        );
        let (result, _) = run_negotiation(script.into_bytes(), test_context()).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupProtocolError);
        assert!(err.message.contains("session sockets"));
    }

    #[tokio::test]
    async fn test_preloader_kinds() {
        let mut ctx = test_context();
        ctx.negotiating_preloader = true;
        let (result, _) = run_negotiation(Vec::new(), ctx).await;
        assert_eq!(
            result.unwrap_err().kind,
            SpawnErrorKind::PreloaderStartupProtocolError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let mut ctx = test_context();
        ctx.deadline = Instant::now() + Duration::from_millis(100);
        let (mut _parent_write, mut parent_read) = tokio::io::duplex(1024);
        let options = Options::for_app_root("/srv/app");
        let mut reader = BufReader::new(&mut parent_read);
        let mut sink = tokio::io::sink();
        let err = ctx
            .negotiate(&mut reader, &mut sink, &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupTimeout);
    }

    #[tokio::test]
    async fn test_stderr_capture_lands_in_error() {
        let (mut stderr_write, stderr_read) = tokio::io::duplex(1024);
        let mut ctx = test_context();
        ctx.stderr = Some(StderrCapture::start(stderr_read, 1234, false));
        stderr_write
            .write_all(b"undefined method 'boom'\n")
            .await
            .unwrap();
        drop(stderr_write);
        // Give the capture task a beat to drain the pipe
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = ctx.startup_error(
            SpawnErrorKind::AppStartupProtocolError,
            "it died".to_string(),
        );
        assert!(err.error_page.unwrap().contains("undefined method"));
    }

    #[tokio::test]
    async fn test_debug_dir_round_trip() {
        let debug_dir = DebugDir::new("spawnpool-test", 42, "t1").unwrap();
        std::fs::write(debug_dir.path().join("envvars"), "PATH=/bin").unwrap();
        let contents = debug_dir.read_all();
        assert_eq!(contents.get("envvars").unwrap(), "PATH=/bin");
        let path = debug_dir.path().to_path_buf();
        drop(debug_dir);
        assert!(!path.exists());
    }
}
