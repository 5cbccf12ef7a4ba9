//! Error types surfaced by the pool and the spawn subsystem

use std::collections::BTreeMap;
use std::fmt;

/// Classification of a spawn failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorKind {
    /// The preloader did not finish its startup handshake in time
    PreloaderStartupTimeout,
    /// The preloader violated the startup protocol
    PreloaderStartupProtocolError,
    /// The preloader reported an error page of its own
    PreloaderStartupExplainableError,
    /// The application did not finish its startup handshake in time
    AppStartupTimeout,
    /// The application violated the startup protocol
    AppStartupProtocolError,
    /// The application reported an error page of its own
    AppStartupExplainableError,
    /// Something went wrong on our side
    InternalError,
}

impl SpawnErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnErrorKind::PreloaderStartupTimeout => "PRELOADER_STARTUP_TIMEOUT",
            SpawnErrorKind::PreloaderStartupProtocolError => "PRELOADER_STARTUP_PROTOCOL_ERROR",
            SpawnErrorKind::PreloaderStartupExplainableError => {
                "PRELOADER_STARTUP_EXPLAINABLE_ERROR"
            }
            SpawnErrorKind::AppStartupTimeout => "APP_STARTUP_TIMEOUT",
            SpawnErrorKind::AppStartupProtocolError => "APP_STARTUP_PROTOCOL_ERROR",
            SpawnErrorKind::AppStartupExplainableError => "APP_STARTUP_EXPLAINABLE_ERROR",
            SpawnErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SpawnErrorKind::PreloaderStartupTimeout | SpawnErrorKind::AppStartupTimeout
        )
    }
}

/// A failed attempt to start a worker process.
///
/// `error_page` holds whatever the child wrote after an `Error` response
/// (or its captured stderr for protocol-level failures). `annotations` are
/// the contents of the child's debug directory, keyed by file name.
#[derive(Debug, Clone)]
pub struct SpawnError {
    pub kind: SpawnErrorKind,
    pub message: String,
    pub error_page: Option<String>,
    /// Whether `error_page` is pre-rendered HTML
    pub html: bool,
    pub annotations: BTreeMap<String, String>,
}

impl SpawnError {
    pub fn new(kind: SpawnErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_page: None,
            html: false,
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_error_page(mut self, page: impl Into<String>, html: bool) -> Self {
        self.error_page = Some(page.into());
        self.html = html;
        self
    }

    pub fn annotate(&mut self, name: impl Into<String>, contents: impl Into<String>) {
        self.annotations.insert(name.into(), contents.into());
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

impl std::error::Error for SpawnError {}

/// Result of a disable command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableResult {
    /// The process was disabled
    Success,
    /// The disable was canceled (e.g. the process was re-enabled first)
    Canceled,
    /// Nothing to do: the process does not exist or was already disabled
    Noop,
    /// Disabling failed
    Error,
    /// The process is draining; the callback fires when it finishes
    Deferred,
}

/// Error type for pool operations
#[derive(Debug)]
pub enum PoolError {
    /// A wait-listed request was aborted before a session could be handed out
    GetAborted(String),
    /// Starting a worker failed
    Spawn(SpawnError),
    /// The caller lacks the right required for an admin command
    Security(String),
    /// An OS-level failure
    System {
        context: String,
        source: std::io::Error,
    },
    /// An operation exceeded its deadline
    Timeout(String),
    /// The supplied options make no sense
    InvalidConfiguration(String),
}

impl PoolError {
    pub(crate) fn system(context: impl Into<String>, source: std::io::Error) -> Self {
        PoolError::System {
            context: context.into(),
            source,
        }
    }

    /// Short machine-readable tag, used in admin replies and logs
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::GetAborted(_) => "GET_ABORTED",
            PoolError::Spawn(e) => e.kind.as_str(),
            PoolError::Security(_) => "SECURITY_ERROR",
            PoolError::System { .. } => "SYSTEM_ERROR",
            PoolError::Timeout(_) => "TIMEOUT",
            PoolError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::GetAborted(msg) => write!(f, "Request aborted: {}", msg),
            PoolError::Spawn(e) => write!(f, "{}", e),
            PoolError::Security(msg) => write!(f, "Security error: {}", msg),
            PoolError::System { context, source } => write!(f, "{}: {}", context, source),
            PoolError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            PoolError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Spawn(e) => Some(e),
            PoolError::System { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<SpawnError> for PoolError {
    fn from(err: SpawnError) -> Self {
        PoolError::Spawn(err)
    }
}
