pub mod api;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod gate;
pub mod models;
pub mod normalizer;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod stats;
pub mod tracing_setup;
pub mod transport;
pub mod wake;

#[cfg(test)]
mod test_support;

// Re-export the entry points used by the binary
pub use config::{ConfigError, FileConfig, ListenerConfig};
pub use runtime::{run_listener, Dispatcher};
pub use tracing_setup::init_tracing;
