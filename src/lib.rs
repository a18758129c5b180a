//! Meeting-room booking engine: conflict-free booking per room, a TTL cache
//! of room status kept honest by write-side invalidation, and a small REST
//! surface over both.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod http;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod reaper;
pub mod wal;

use std::io;
use std::sync::Arc;

use cache::AvailabilityCache;
use clock::Clock;
use config::Config;
use engine::Engine;
use notify::NotifyHub;
use orchestrator::Orchestrator;

/// Open the store under `config.data_dir` and wire the cache and notify hub
/// around it. Must run inside a tokio runtime.
pub fn build(config: &Config, clock: Arc<dyn Clock>) -> io::Result<Orchestrator> {
    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(config.wal_path(), config.lock_timeout, clock.clone())?);
    let cache = Arc::new(AvailabilityCache::new(engine.clone(), clock, config.cache_ttl));
    Ok(Orchestrator::new(engine, cache, Arc::new(NotifyHub::new())))
}
