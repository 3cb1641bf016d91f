pub mod api;
pub mod config;
pub mod error;
pub mod session;

use config::Config;
use session::{DurableStore, FileSnapshot, HubTimers, RetentionPolicy, SessionEngine, SessionHub};

/// Load the durable store named by `config` and start the session task
pub fn start_session_hub(config: &Config) -> SessionHub {
    let store = DurableStore::open(Box::new(FileSnapshot::new(&config.storage.data_file)));
    let engine = SessionEngine::new(store, RetentionPolicy::new(config.session.room_ttl));

    SessionHub::spawn(
        engine,
        HubTimers {
            flush: config.storage.flush_interval,
            heartbeat: config.session.heartbeat_interval,
            sweep: config.session.sweep_interval,
        },
    )
}
