//! Per-process OS metrics, collected by parsing `ps` output

use std::collections::HashMap;
use tokio::process::Command;

/// One sample of OS-level process metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessMetrics {
    pub ppid: i32,
    pub cpu_percent: f32,
    /// Resident set size in kilobytes
    pub rss_kb: u64,
}

/// `ps` output that could not be interpreted
#[derive(Debug)]
pub struct ParseError {
    pub line: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot parse 'ps' output line: {:?}", self.line)
    }
}

impl std::error::Error for ParseError {}

pub enum CollectError {
    Parse(ParseError),
    Exec(std::io::Error),
}

/// Collects metrics for a set of PIDs in one `ps` invocation.
/// A PID missing from the result map means `ps` did not report it; the
/// caller double-checks liveness with `kill(pid, 0)` before concluding the
/// process is dead.
pub struct ProcessMetricsCollector;

impl ProcessMetricsCollector {
    pub async fn collect(
        &self,
        pids: &[i32],
    ) -> Result<HashMap<i32, ProcessMetrics>, CollectError> {
        if pids.is_empty() {
            return Ok(HashMap::new());
        }
        let pid_list = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let output = Command::new("ps")
            .arg("-o")
            .arg("pid=,ppid=,%cpu=,rss=")
            .arg("-p")
            .arg(&pid_list)
            .output()
            .await
            .map_err(CollectError::Exec)?;
        // ps exits non-zero when some PIDs are gone; the lines it does
        // print are still valid
        parse_ps_output(&String::from_utf8_lossy(&output.stdout)).map_err(CollectError::Parse)
    }
}

fn parse_ps_output(output: &str) -> Result<HashMap<i32, ProcessMetrics>, ParseError> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parsed = (|| {
            let pid: i32 = fields.next()?.parse().ok()?;
            let ppid: i32 = fields.next()?.parse().ok()?;
            let cpu_percent: f32 = fields.next()?.parse().ok()?;
            let rss_kb: u64 = fields.next()?.parse().ok()?;
            Some((
                pid,
                ProcessMetrics {
                    ppid,
                    cpu_percent,
                    rss_kb,
                },
            ))
        })();
        match parsed {
            Some((pid, metrics)) => {
                map.insert(pid, metrics);
            }
            None => {
                return Err(ParseError {
                    line: line.to_string(),
                })
            }
        }
    }
    Ok(map)
}

/// Whether the OS process behind `pid` still exists, via a null signal
pub fn os_process_exists(pid: i32) -> bool {
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps_output() {
        let map = parse_ps_output(
            " 1234  1 0.5 10240\n\
             5678  1234 12.0 204800\n",
        )
        .unwrap();
        assert_eq!(map.len(), 2);
        let m = map.get(&5678).unwrap();
        assert_eq!(m.ppid, 1234);
        assert_eq!(m.rss_kb, 204_800);
        assert!((m.cpu_percent - 12.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_ps_output("").unwrap().is_empty());
        assert!(parse_ps_output("\n \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_garbage_is_an_error() {
        assert!(parse_ps_output("not a ps line at all\n").is_err());
        assert!(parse_ps_output("1234 x 0.5 1024\n").is_err());
    }

    #[test]
    fn test_os_process_exists() {
        let own_pid = std::process::id() as i32;
        assert!(os_process_exists(own_pid));
        // PIDs near the max are essentially never allocated
        assert!(!os_process_exists(i32::MAX - 1));
    }

    #[tokio::test]
    async fn test_collect_own_process() {
        let own_pid = std::process::id() as i32;
        let map = ProcessMetricsCollector
            .collect(&[own_pid])
            .await
            .ok()
            .unwrap_or_default();
        if let Some(metrics) = map.get(&own_pid) {
            assert!(metrics.rss_kb > 0);
        }
    }

    #[tokio::test]
    async fn test_collect_empty_pid_list() {
        let map = ProcessMetricsCollector.collect(&[]).await;
        assert!(matches!(map, Ok(m) if m.is_empty()));
    }
}
