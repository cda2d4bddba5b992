pub mod config;
pub mod directory;
pub mod error;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod remote;
pub mod store;

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the global logger once; `RUST_LOG` overrides the default filter.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,sqlx=warn,reqwest=warn"),
        )
        .init();
    });
}
