//! Small shared services: time source, random generator, duration words

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, microsecond resolution. Injected at Pool
/// construction so tests can freeze or step the clock.
pub trait TimeSource: Send + Sync {
    fn now_us(&self) -> u64;
}

/// The real system clock
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A time source fixed to a settable instant, for tests
pub struct ManualTimeSource {
    now: Mutex<u64>,
}

impl ManualTimeSource {
    pub fn new(start_us: u64) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start_us),
        })
    }

    pub fn advance_us(&self, delta: u64) {
        *self.now.lock() += delta;
    }
}

impl TimeSource for ManualTimeSource {
    fn now_us(&self) -> u64 {
        *self.now.lock()
    }
}

/// Seedable random string generator shared by the pool and its spawners.
/// Gupids, connect passwords and group secrets all come from here.
pub struct RandomGenerator {
    rng: Mutex<StdRng>,
}

impl RandomGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn ascii_string(&self, len: usize) -> String {
        let mut rng = self.rng.lock();
        (0..len).map(|_| rng.sample(Alphanumeric) as char).collect()
    }
}

impl Default for RandomGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a globally-unique process id: minutes-since-epoch in hex plus
/// a random tail. Shows up in logs and admin commands.
pub fn generate_gupid(time: &dyn TimeSource, random: &RandomGenerator) -> String {
    let minutes = time.now_us() / 1_000_000 / 60;
    format!("{:x}-{}", minutes, random.ascii_string(11))
}

/// Render a microsecond timestamp distance as a rough human string
/// ("3m 42s", "2h 5m"). Used for process uptime in inspection output.
pub fn distance_of_time_in_words(from_us: u64, to_us: u64) -> String {
    let mut secs = to_us.saturating_sub(from_us) / 1_000_000;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let mins = secs / 60;
    secs %= 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Minimal XML text escaping for inspection snapshots
pub fn escape_for_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
