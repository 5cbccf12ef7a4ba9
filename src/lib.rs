//! spawnpool - an application-process pool for spawning web servers
//!
//! This library sits between a web server's request path and a dynamic
//! population of language-runtime worker processes:
//! - Hands out sessions bound to the least-utilized worker of an app group
//! - Spawns workers on demand (directly or through a preloader), evicts
//!   idle ones to make room, and queues requests while capacity is busy
//! - Negotiates startup with children over a line-based admin channel
//! - Garbage-collects idle workers and preloaders in the background
//! - Watches worker liveness and detaches dead processes
//! - Exposes text/XML inspection and an admin command socket

pub mod admin;
pub mod app_type;
pub mod config;
pub mod error;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod session;
pub mod socket;

mod direct_spawner;
mod group;
mod negotiation;
mod pqueue;
mod prepare;
mod process;
mod smart_spawner;
mod spawner;
mod supergroup;
mod util;

pub use error::{DisableResult, PoolError, SpawnError, SpawnErrorKind};
pub use options::{Options, SpawnMethod};
pub use pool::{InspectOptions, Pool};
pub use process::{EnabledStatus, LifeStatus};
pub use session::Session;
pub use spawner::SpawnerConfig;
pub use util::{ManualTimeSource, RandomGenerator, SystemTimeSource, TimeSource};
