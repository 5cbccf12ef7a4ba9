//! Per-request spawn options and the app-group key they derive

use crate::app_type::AppType;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How workers for an app are brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMethod {
    /// Fork a long-lived preloader once, then fork cheap per-request
    /// children from it. Falls back to direct for app types that don't
    /// support it.
    #[default]
    Smart,
    /// Fork and exec a fresh loader for every worker
    Direct,
    /// Produce fake in-memory processes; test only
    Dummy,
}

impl SpawnMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnMethod::Smart => "smart",
            SpawnMethod::Direct => "direct",
            SpawnMethod::Dummy => "dummy",
        }
    }
}

/// Everything the pool needs to know to route a request and, if necessary,
/// start a worker for it. Two Options with the same app-group name are
/// interchangeable for dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    /// Absolute path to the application root
    pub app_root: String,

    /// Explicit app-group name override. When absent the name derives from
    /// app root, environment and user.
    #[serde(default)]
    pub app_group_name: Option<String>,

    #[serde(default)]
    pub app_type: AppType,

    /// Deployment environment, e.g. "production". Exported to the worker
    /// as RAILS_ENV / RACK_ENV / WSGI_ENV.
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub spawn_method: SpawnMethod,

    /// User to run the worker as. Empty: owner of the startup file,
    /// falling back to `default_user`.
    #[serde(default)]
    pub user: Option<String>,

    /// Group to run the worker as. Empty: the user's primary group.
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default = "default_user")]
    pub default_user: String,

    #[serde(default)]
    pub default_group: Option<String>,

    /// Explicit command line for generic apps
    #[serde(default)]
    pub start_command: Option<String>,

    /// Startup file override (relative to the app root)
    #[serde(default)]
    pub startup_file: Option<String>,

    /// Minimum number of workers the group keeps alive
    #[serde(default = "default_min_processes")]
    pub min_processes: usize,

    /// Upper bound on workers for this group; 0 means only the pool-wide
    /// ceiling applies
    #[serde(default)]
    pub max_processes: usize,

    /// Detach a worker after it has served this many sessions; 0 disables
    #[serde(default)]
    pub max_requests: usize,

    /// Startup negotiation deadline in milliseconds
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Seconds an idle preloader survives before the GC reaps it.
    /// None means the 300 s default.
    #[serde(default)]
    pub max_preloader_idle_time_secs: Option<u64>,

    /// Minimum seconds between restart-file stat checks; 0 checks every time
    #[serde(default)]
    pub stat_throttle_rate_secs: u64,

    /// Directory holding restart.txt / always_restart.txt; defaults to
    /// `<app_root>/tmp`
    #[serde(default)]
    pub restart_dir: Option<PathBuf>,

    /// chroot jail to enter before exec; None means no jail
    #[serde(default)]
    pub preexec_chroot: Option<PathBuf>,

    /// Base URI the app is mounted under
    #[serde(default = "default_base_uri")]
    pub base_uri: String,

    /// Extra environment variables passed to the worker
    #[serde(default)]
    pub environment_variables: Vec<(String, String)>,

    /// Whether per-process analytics records are kept for this group
    #[serde(default)]
    pub analytics: bool,

    /// Whether an asyncGet at full capacity may evict a busy process when
    /// no idle one exists
    #[serde(default)]
    pub allow_trashing_non_idle_processes: bool,
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_user() -> String {
    "nobody".to_string()
}

fn default_min_processes() -> usize {
    1
}

fn default_start_timeout_ms() -> u64 {
    90_000
}

fn default_base_uri() -> String {
    "/".to_string()
}

impl Options {
    /// Minimal options for the given app root; everything else defaulted
    pub fn for_app_root(app_root: impl Into<String>) -> Self {
        Self {
            app_root: app_root.into(),
            app_group_name: None,
            app_type: AppType::default(),
            environment: default_environment(),
            spawn_method: SpawnMethod::default(),
            user: None,
            group: None,
            default_user: default_user(),
            default_group: None,
            start_command: None,
            startup_file: None,
            min_processes: default_min_processes(),
            max_processes: 0,
            max_requests: 0,
            start_timeout_ms: default_start_timeout_ms(),
            max_preloader_idle_time_secs: None,
            stat_throttle_rate_secs: 0,
            restart_dir: None,
            preexec_chroot: None,
            base_uri: default_base_uri(),
            environment_variables: Vec::new(),
            analytics: false,
            allow_trashing_non_idle_processes: false,
        }
    }

    /// The key under which this app is pooled. Deterministic in
    /// (app root, environment, user) unless overridden explicitly.
    pub fn app_group_name(&self) -> String {
        if let Some(name) = &self.app_group_name {
            return name.clone();
        }
        let mut name = self.app_root.clone();
        name.push_str(" (");
        name.push_str(&self.environment);
        if let Some(user) = &self.user {
            name.push_str(", ");
            name.push_str(user);
        }
        name.push(')');
        name
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn max_preloader_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_preloader_idle_time_secs.unwrap_or(300))
    }

    /// Startup file path relative to the app root
    pub fn startup_file(&self) -> Option<String> {
        self.startup_file
            .clone()
            .or_else(|| self.app_type.startup_file().map(str::to_string))
    }

    /// Directory whose restart.txt / always_restart.txt trigger restarts
    pub fn restart_dir(&self) -> PathBuf {
        self.restart_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.app_root).join("tmp"))
    }

    /// Pick up the per-get tunables from a newer request for the same
    /// app group
    pub fn merge(&mut self, other: &Options) {
        self.max_requests = other.max_requests;
        self.min_processes = other.min_processes;
        self.stat_throttle_rate_secs = other.stat_throttle_rate_secs;
        self.max_preloader_idle_time_secs = other.max_preloader_idle_time_secs;
    }

    /// Flatten into key/value pairs for the spawn handshake. Every field
    /// the worker-side loader cares about goes over the wire here.
    pub fn to_wire(&self) -> Vec<(String, String)> {
        let mut vec = vec![
            ("app_root".to_string(), self.app_root.clone()),
            ("app_group_name".to_string(), self.app_group_name()),
            ("app_type".to_string(), self.app_type.as_str().to_string()),
            ("environment".to_string(), self.environment.clone()),
            (
                "spawn_method".to_string(),
                self.spawn_method.as_str().to_string(),
            ),
            ("base_uri".to_string(), self.base_uri.clone()),
            (
                "start_timeout".to_string(),
                self.start_timeout_ms.to_string(),
            ),
            (
                "min_processes".to_string(),
                self.min_processes.to_string(),
            ),
        ];
        if let Some(user) = &self.user {
            vec.push(("user".to_string(), user.clone()));
        }
        if let Some(group) = &self.group {
            vec.push(("group".to_string(), group.clone()));
        }
        if let Some(file) = self.startup_file() {
            vec.push(("startup_file".to_string(), file));
        }
        for (key, value) in &self.environment_variables {
            vec.push((format!("env_{}", key), value.clone()));
        }
        vec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_group_name_derivation() {
        let mut options = Options::for_app_root("/srv/app");
        assert_eq!(options.app_group_name(), "/srv/app (production)");

        options.environment = "staging".to_string();
        assert_eq!(options.app_group_name(), "/srv/app (staging)");

        options.user = Some("deploy".to_string());
        assert_eq!(options.app_group_name(), "/srv/app (staging, deploy)");

        options.app_group_name = Some("frontend".to_string());
        assert_eq!(options.app_group_name(), "frontend");
    }

    #[test]
    fn test_same_key_is_interchangeable() {
        let a = Options::for_app_root("/srv/app");
        let mut b = Options::for_app_root("/srv/app");
        b.min_processes = 4;
        assert_eq!(a.app_group_name(), b.app_group_name());
    }

    #[test]
    fn test_defaults() {
        let options = Options::for_app_root("/srv/app");
        assert_eq!(options.environment, "production");
        assert_eq!(options.min_processes, 1);
        assert_eq!(options.start_timeout(), Duration::from_secs(90));
        assert_eq!(options.max_preloader_idle_time(), Duration::from_secs(300));
        assert_eq!(options.spawn_method, SpawnMethod::Smart);
        assert_eq!(options.restart_dir(), PathBuf::from("/srv/app/tmp"));
    }

    #[test]
    fn test_merge_takes_per_get_tunables() {
        let mut current = Options::for_app_root("/srv/app");
        let mut newer = Options::for_app_root("/srv/app");
        newer.min_processes = 3;
        newer.max_requests = 100;
        newer.stat_throttle_rate_secs = 5;
        current.merge(&newer);
        assert_eq!(current.min_processes, 3);
        assert_eq!(current.max_requests, 100);
        assert_eq!(current.stat_throttle_rate_secs, 5);
    }

    #[test]
    fn test_wire_flattening() {
        let mut options = Options::for_app_root("/srv/app");
        options.environment_variables =
            vec![("SECRET_KEY".to_string(), "abc".to_string())];
        let wire = options.to_wire();
        let get = |k: &str| {
            wire.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("app_root"), Some("/srv/app"));
        assert_eq!(get("spawn_method"), Some("smart"));
        assert_eq!(get("env_SECRET_KEY"), Some("abc"));
    }

    #[test]
    fn test_deserialize_from_toml() {
        let options: Options = toml::from_str(
            r#"
            app_root = "/srv/app"
            environment = "development"
            spawn_method = "direct"
            app_type = "rack"
            min_processes = 2
            "#,
        )
        .unwrap();
        assert_eq!(options.environment, "development");
        assert_eq!(options.spawn_method, SpawnMethod::Direct);
        assert_eq!(options.app_type, AppType::Rack);
        assert_eq!(options.min_processes, 2);
        assert_eq!(options.max_requests, 0);
    }
}
