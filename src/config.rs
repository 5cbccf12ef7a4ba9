//! Pool configuration, loadable from TOML

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for one pool instance
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub spawn: SpawnConfig,
}

/// Scheduler limits and on-disk layout
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Capacity ceiling: enabled + disabling + disabled + spawning workers
    /// across all groups never exceed this
    #[serde(default = "default_max")]
    pub max: usize,

    /// Seconds an idle worker survives before the garbage collector
    /// detaches it
    #[serde(default = "default_max_idle_time")]
    pub max_idle_time_secs: u64,

    /// Working directory for this pool instance: listening sockets, PID
    /// files and the admin socket live here
    #[serde(default = "default_generation_dir")]
    pub generation_dir: PathBuf,

    /// Unix socket path for the admin message server, relative to the
    /// generation dir when not absolute
    #[serde(default = "default_admin_socket")]
    pub admin_socket: PathBuf,
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn admin_socket_path(&self) -> PathBuf {
        if self.admin_socket.is_absolute() {
            self.admin_socket.clone()
        } else {
            self.generation_dir.join(&self.admin_socket)
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: default_max(),
            max_idle_time_secs: default_max_idle_time(),
            generation_dir: default_generation_dir(),
            admin_socket: default_admin_socket(),
        }
    }
}

/// Defaults applied to every spawn
#[derive(Debug, Deserialize, Clone)]
pub struct SpawnConfig {
    /// Root of our own installation; loader scripts live under
    /// `<root>/helper-scripts`
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Forward worker stdout lines to the log sink at info level
    /// (debug level otherwise)
    #[serde(default = "default_true")]
    pub forward_stdout: bool,

    /// Forward worker stderr lines to the log sink at info level
    #[serde(default = "default_true")]
    pub forward_stderr: bool,

    /// Ruby interpreter used for rack / classic-rails loaders
    #[serde(default = "default_ruby")]
    pub ruby: String,

    /// Python interpreter used for wsgi loaders
    #[serde(default = "default_python")]
    pub python: String,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            forward_stdout: true,
            forward_stderr: true,
            ruby: default_ruby(),
            python: default_python(),
        }
    }
}

/// Resolves loader and preloader commands for an app type
#[derive(Debug, Clone)]
pub struct ResourceLocator {
    root: PathBuf,
    ruby: String,
    python: String,
}

impl ResourceLocator {
    pub fn new(spawn: &SpawnConfig) -> Self {
        Self {
            root: spawn.root.clone(),
            ruby: spawn.ruby.clone(),
            python: spawn.python.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn helper_scripts_dir(&self) -> PathBuf {
        self.root.join("helper-scripts")
    }

    /// Command line of the loader that boots one worker
    pub fn loader_command(&self, app_type: crate::app_type::AppType) -> Option<Vec<String>> {
        use crate::app_type::AppType;
        let dir = self.helper_scripts_dir();
        match app_type {
            AppType::Rack => Some(vec![
                self.ruby.clone(),
                dir.join("rack-loader.rb").to_string_lossy().into_owned(),
            ]),
            AppType::ClassicRails => Some(vec![
                self.ruby.clone(),
                dir.join("classic-rails-loader.rb")
                    .to_string_lossy()
                    .into_owned(),
            ]),
            AppType::Wsgi => Some(vec![
                self.python.clone(),
                dir.join("wsgi-loader.py").to_string_lossy().into_owned(),
            ]),
            AppType::Generic => None,
        }
    }

    /// Command line of the preloader, for app types that support smart
    /// spawning
    pub fn preloader_command(&self, app_type: crate::app_type::AppType) -> Option<Vec<String>> {
        use crate::app_type::AppType;
        let dir = self.helper_scripts_dir();
        match app_type {
            AppType::Rack => Some(vec![
                self.ruby.clone(),
                dir.join("rack-preloader.rb").to_string_lossy().into_owned(),
            ]),
            AppType::ClassicRails => Some(vec![
                self.ruby.clone(),
                dir.join("classic-rails-preloader.rb")
                    .to_string_lossy()
                    .into_owned(),
            ]),
            _ => None,
        }
    }
}

fn default_max() -> usize {
    6
}

fn default_max_idle_time() -> u64 {
    300
}

fn default_generation_dir() -> PathBuf {
    std::env::temp_dir().join("spawnpool")
}

fn default_admin_socket() -> PathBuf {
    PathBuf::from("admin.socket")
}

fn default_root() -> PathBuf {
    PathBuf::from("/usr/local/lib/spawnpool")
}

fn default_ruby() -> String {
    "ruby".to_string()
}

fn default_python() -> String {
    "python".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            spawn: SpawnConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_type::AppType;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pool.max, 6);
        assert_eq!(config.pool.max_idle_time(), Duration::from_secs(300));
        assert!(config.spawn.forward_stdout);
        assert!(config.spawn.forward_stderr);
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            max = 12
            max_idle_time_secs = 60
            generation_dir = "/run/spawnpool/gen-0"

            [spawn]
            root = "/opt/spawnpool"
            ruby = "/usr/bin/ruby2.7"
            forward_stdout = false
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max, 12);
        assert_eq!(config.pool.max_idle_time_secs, 60);
        assert_eq!(
            config.pool.admin_socket_path(),
            PathBuf::from("/run/spawnpool/gen-0/admin.socket")
        );
        assert!(!config.spawn.forward_stdout);
        assert!(config.spawn.forward_stderr);
        assert_eq!(config.spawn.ruby, "/usr/bin/ruby2.7");
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.pool.max, 6);
    }

    #[test]
    fn test_resource_locator_commands() {
        let mut spawn = SpawnConfig::default();
        spawn.root = PathBuf::from("/opt/sp");
        let locator = ResourceLocator::new(&spawn);

        let rack = locator.loader_command(AppType::Rack).unwrap();
        assert_eq!(rack[0], "ruby");
        assert_eq!(rack[1], "/opt/sp/helper-scripts/rack-loader.rb");

        let wsgi = locator.loader_command(AppType::Wsgi).unwrap();
        assert_eq!(wsgi[0], "python");

        assert!(locator.loader_command(AppType::Generic).is_none());
        assert!(locator.preloader_command(AppType::Wsgi).is_none());
        assert!(locator.preloader_command(AppType::Rack).is_some());
    }

    #[test]
    fn test_absolute_admin_socket_wins() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            admin_socket = "/var/run/pool.socket"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.pool.admin_socket_path(),
            PathBuf::from("/var/run/pool.socket")
        );
    }
}
