//! Application type detection based on well-known startup files

use serde::Deserialize;
use std::path::Path;

/// The kind of application living at an app root. Determines which loader
/// script starts it and whether smart spawning is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppType {
    /// Ruby Rack application (`config.ru`)
    Rack,
    /// Python WSGI application (`spawnpool_wsgi.py`)
    Wsgi,
    /// Rails 2.x application (`config/environment.rb`)
    ClassicRails,
    /// Anything started through an explicit start command
    #[default]
    Generic,
}

impl AppType {
    /// Detect the app type by probing startup files under `app_root`.
    /// Order matters: a Rails 2 app also ships a `config.ru` nowadays, so
    /// the classic check runs last.
    pub fn detect(app_root: &Path) -> AppType {
        if app_root.join("config.ru").is_file() {
            AppType::Rack
        } else if app_root.join("spawnpool_wsgi.py").is_file() {
            AppType::Wsgi
        } else if app_root.join("config/environment.rb").is_file() {
            AppType::ClassicRails
        } else {
            AppType::Generic
        }
    }

    /// The file whose existence marks an app of this type. Its owner also
    /// decides which user the worker runs as when none is configured.
    pub fn startup_file(&self) -> Option<&'static str> {
        match self {
            AppType::Rack => Some("config.ru"),
            AppType::Wsgi => Some("spawnpool_wsgi.py"),
            AppType::ClassicRails => Some("config/environment.rb"),
            AppType::Generic => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Rack => "rack",
            AppType::Wsgi => "wsgi",
            AppType::ClassicRails => "classic-rails",
            AppType::Generic => "generic",
        }
    }

    /// Smart (preloader) spawning is only implemented for the Ruby types
    pub fn supports_smart_spawning(&self) -> bool {
        matches!(self, AppType::Rack | AppType::ClassicRails)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_detect_rack() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.ru"), "run App").unwrap();
        assert_eq!(AppType::detect(dir.path()), AppType::Rack);
    }

    #[test]
    fn test_detect_wsgi() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("spawnpool_wsgi.py"), "application = app").unwrap();
        assert_eq!(AppType::detect(dir.path()), AppType::Wsgi);
    }

    #[test]
    fn test_detect_classic_rails() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config/environment.rb"), "").unwrap();
        assert_eq!(AppType::detect(dir.path()), AppType::ClassicRails);
    }

    #[test]
    fn test_detect_generic() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(AppType::detect(dir.path()), AppType::Generic);
    }

    #[test]
    fn test_rack_wins_over_classic_rails() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config/environment.rb"), "").unwrap();
        fs::write(dir.path().join("config.ru"), "run App").unwrap();
        assert_eq!(AppType::detect(dir.path()), AppType::Rack);
    }

    #[test]
    fn test_smart_spawning_support() {
        assert!(AppType::Rack.supports_smart_spawning());
        assert!(AppType::ClassicRails.supports_smart_spawning());
        assert!(!AppType::Wsgi.supports_smart_spawning());
        assert!(!AppType::Generic.supports_smart_spawning());
    }
}
