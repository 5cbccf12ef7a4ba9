//! Listen sockets advertised by a worker during spawn negotiation

use crate::error::{SpawnError, SpawnErrorKind};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Address of one worker listen socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl SocketAddress {
    /// Parse `unix:/absolute/path` or `tcp://host:port`
    pub fn parse(s: &str) -> Result<SocketAddress, String> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(format!("empty unix socket path in \"{}\"", s));
            }
            Ok(SocketAddress::Unix(PathBuf::from(path)))
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| format!("missing port in \"{}\"", s))?;
            let port: u16 = port
                .parse()
                .map_err(|_| format!("invalid port in \"{}\"", s))?;
            if host.is_empty() {
                return Err(format!("empty host in \"{}\"", s));
            }
            Ok(SocketAddress::Tcp {
                host: host.to_string(),
                port,
            })
        } else {
            Err(format!("unsupported socket address type: \"{}\"", s))
        }
    }

    /// Whether a TCP address names the loopback interface. Workers must
    /// not expose session sockets beyond the local host.
    pub fn is_loopback(&self) -> bool {
        match self {
            SocketAddress::Unix(_) => true,
            SocketAddress::Tcp { host, .. } => {
                if host == "localhost" {
                    return true;
                }
                host.parse::<IpAddr>()
                    .map(|ip| ip.is_loopback())
                    .unwrap_or(false)
            }
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            SocketAddress::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// One listen socket of a worker process
#[derive(Debug, Clone)]
pub struct Socket {
    pub name: String,
    pub address: SocketAddress,
    /// Protocol tag; "session" and "http_session" sockets carry requests
    pub protocol: String,
    /// Maximum concurrent sessions; 0 means unlimited
    pub concurrency: usize,
    /// Open sessions right now
    pub sessions: usize,
}

impl Socket {
    /// Whether this socket speaks a request-carrying protocol
    pub fn is_session_socket(&self) -> bool {
        self.protocol == "session" || self.protocol == "http_session"
    }

    pub fn at_full_capacity(&self) -> bool {
        self.concurrency != 0 && self.sessions >= self.concurrency
    }

    /// Saturation mapped into [0, i32::MAX]; see `Process::utilization`
    pub fn utilization(&self) -> u64 {
        if self.concurrency == 0 {
            if self.sessions == 0 {
                0
            } else {
                1
            }
        } else {
            (self.sessions as u64 * i32::MAX as u64) / self.concurrency as u64
        }
    }

    /// Parse a `socket: <name>;<address>;<protocol>;<concurrency>`
    /// advertisement value
    pub fn parse_advertisement(value: &str) -> Result<Socket, String> {
        let parts: Vec<&str> = value.split(';').collect();
        if parts.len() != 4 {
            return Err(format!(
                "wrongly formatted socket advertisement: \"{}\"",
                value
            ));
        }
        let address = SocketAddress::parse(parts[1])?;
        let concurrency: usize = parts[3]
            .parse()
            .map_err(|_| format!("invalid concurrency in \"{}\"", value))?;
        Ok(Socket {
            name: parts[0].to_string(),
            address,
            protocol: parts[2].to_string(),
            concurrency,
            sessions: 0,
        })
    }

    /// Validate an advertised address against security policy: unix paths
    /// must be absolute, exist and be owned by the worker's uid; tcp
    /// addresses must point at loopback.
    pub fn validate(&self, expected_uid: Option<u32>) -> Result<(), SpawnError> {
        match &self.address {
            SocketAddress::Unix(path) => {
                if !path.is_absolute() || !is_clean_path(path) {
                    return Err(SpawnError::new(
                        SpawnErrorKind::AppStartupProtocolError,
                        format!(
                            "The application advertised a non-absolute socket \
                             filename: \"{}\"",
                            path.display()
                        ),
                    ));
                }
                let meta = std::fs::symlink_metadata(path).map_err(|e| {
                    SpawnError::new(
                        SpawnErrorKind::AppStartupProtocolError,
                        format!(
                            "The application advertised an inaccessible socket \
                             filename: \"{}\" ({})",
                            path.display(),
                            e
                        ),
                    )
                })?;
                if let Some(uid) = expected_uid {
                    use std::os::unix::fs::MetadataExt;
                    if meta.uid() != uid {
                        return Err(SpawnError::new(
                            SpawnErrorKind::AppStartupProtocolError,
                            format!(
                                "The application advertised a Unix domain socket \
                                 with an unexpected owner (should be UID {}, but \
                                 actual UID was {})",
                                uid,
                                meta.uid()
                            ),
                        ));
                    }
                }
                Ok(())
            }
            SocketAddress::Tcp { .. } => {
                if !self.address.is_loopback() {
                    return Err(SpawnError::new(
                        SpawnErrorKind::AppStartupProtocolError,
                        format!(
                            "The application advertised a TCP socket that does \
                             not bind to loopback: \"{}\"",
                            self.address
                        ),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn is_clean_path(path: &Path) -> bool {
    use std::path::Component;
    path.components()
        .all(|c| matches!(c, Component::RootDir | Component::Normal(_)))
}

/// The ordered socket list of one worker
#[derive(Debug, Clone, Default)]
pub struct SocketList {
    sockets: Vec<Socket>,
}

impl SocketList {
    pub fn new() -> Self {
        Self {
            sockets: Vec::new(),
        }
    }

    pub fn add(&mut self, socket: Socket) {
        self.sockets.push(socket);
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Socket> {
        self.sockets.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Socket> {
        self.sockets.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Socket> {
        self.sockets.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Socket> {
        self.sockets.iter().find(|s| s.name == name)
    }

    pub fn session_socket_indexes(&self) -> Vec<usize> {
        self.sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_session_socket())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn has_session_sockets(&self) -> bool {
        self.sockets.iter().any(|s| s.is_session_socket())
    }

    /// Aggregate concurrency across session sockets; 0 (unlimited) if any
    /// session socket is unlimited
    pub fn total_concurrency(&self) -> usize {
        let mut total = 0;
        for socket in self.sockets.iter().filter(|s| s.is_session_socket()) {
            if socket.concurrency == 0 {
                return 0;
            }
            total += socket.concurrency;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_address() {
        let addr = SocketAddress::parse("unix:/tmp/app.socket").unwrap();
        assert_eq!(addr, SocketAddress::Unix(PathBuf::from("/tmp/app.socket")));
        assert_eq!(addr.to_string(), "unix:/tmp/app.socket");
        assert!(addr.is_loopback());
    }

    #[test]
    fn test_parse_tcp_address() {
        let addr = SocketAddress::parse("tcp://127.0.0.1:4000").unwrap();
        assert_eq!(
            addr,
            SocketAddress::Tcp {
                host: "127.0.0.1".to_string(),
                port: 4000
            }
        );
        assert!(addr.is_loopback());

        let public = SocketAddress::parse("tcp://0.0.0.0:4000").unwrap();
        assert!(!public.is_loopback());
        assert!(SocketAddress::parse("tcp://localhost:80").unwrap().is_loopback());
    }

    #[test]
    fn test_parse_bad_addresses() {
        assert!(SocketAddress::parse("fd:7").is_err());
        assert!(SocketAddress::parse("tcp://nohost").is_err());
        assert!(SocketAddress::parse("tcp://:80").is_err());
        assert!(SocketAddress::parse("unix:").is_err());
    }

    #[test]
    fn test_parse_advertisement() {
        let socket =
            Socket::parse_advertisement("main;unix:/tmp/a.socket;session;4").unwrap();
        assert_eq!(socket.name, "main");
        assert_eq!(socket.protocol, "session");
        assert_eq!(socket.concurrency, 4);
        assert!(socket.is_session_socket());

        assert!(Socket::parse_advertisement("main;unix:/tmp/a.socket;session").is_err());
        assert!(Socket::parse_advertisement("main;unix:/tmp/a;session;x").is_err());
    }

    #[test]
    fn test_socket_utilization() {
        let mut socket =
            Socket::parse_advertisement("main;unix:/tmp/a.socket;session;4").unwrap();
        assert_eq!(socket.utilization(), 0);
        socket.sessions = 2;
        assert_eq!(socket.utilization(), i32::MAX as u64 / 2);
        socket.sessions = 4;
        assert!(socket.at_full_capacity());

        let mut unlimited =
            Socket::parse_advertisement("main;unix:/tmp/b.socket;session;0").unwrap();
        assert_eq!(unlimited.utilization(), 0);
        unlimited.sessions = 10;
        assert_eq!(unlimited.utilization(), 1);
        assert!(!unlimited.at_full_capacity());
    }

    #[test]
    fn test_total_concurrency() {
        let mut list = SocketList::new();
        list.add(Socket::parse_advertisement("a;unix:/tmp/a;session;4").unwrap());
        list.add(Socket::parse_advertisement("b;unix:/tmp/b;http_session;2").unwrap());
        list.add(Socket::parse_advertisement("admin;unix:/tmp/c;admin;1").unwrap());
        assert_eq!(list.total_concurrency(), 6);
        assert_eq!(list.session_socket_indexes(), vec![0, 1]);

        list.add(Socket::parse_advertisement("d;unix:/tmp/d;session;0").unwrap());
        assert_eq!(list.total_concurrency(), 0);
    }

    #[test]
    fn test_validate_tcp_loopback_policy() {
        let socket =
            Socket::parse_advertisement("main;tcp://0.0.0.0:9000;session;1").unwrap();
        let err = socket.validate(None).unwrap_err();
        assert_eq!(err.kind, SpawnErrorKind::AppStartupProtocolError);

        let ok = Socket::parse_advertisement("main;tcp://127.0.0.1:9000;session;1").unwrap();
        assert!(ok.validate(None).is_ok());
    }

    #[test]
    fn test_validate_unix_socket() {
        // Relative paths are rejected outright
        let socket = Socket {
            name: "main".to_string(),
            address: SocketAddress::Unix(PathBuf::from("tmp/a.socket")),
            protocol: "session".to_string(),
            concurrency: 1,
            sessions: 0,
        };
        assert!(socket.validate(None).is_err());

        // Dotted path components are rejected even when absolute
        let dotted = Socket {
            name: "main".to_string(),
            address: SocketAddress::Unix(PathBuf::from("/tmp/../etc/a.socket")),
            protocol: "session".to_string(),
            concurrency: 1,
            sessions: 0,
        };
        assert!(dotted.validate(None).is_err());

        // A real file owned by us passes
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.socket");
        std::fs::write(&path, "").unwrap();
        let real = Socket {
            name: "main".to_string(),
            address: SocketAddress::Unix(path),
            protocol: "session".to_string(),
            concurrency: 1,
            sessions: 0,
        };
        let uid = unsafe { libc::getuid() };
        assert!(real.validate(Some(uid)).is_ok());
        assert!(real.validate(Some(uid + 1)).is_err());
    }
}
