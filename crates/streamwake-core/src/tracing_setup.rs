use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Extra debug log file, appended to when set
pub const LOG_FILE_ENV: &str = "STREAMWAKE_LOG_FILE";

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "info,streamwake=debug,streamwake_core=debug"
    } else {
        "info"
    }
}

/// Install the global subscriber. Diagnostics go to stderr only; stdout
/// carries the event stream. `RUST_LOG` overrides the default filter.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);
    let registry = tracing_subscriber::registry().with(stderr_layer);

    let file_logging = std::env::var(LOG_FILE_ENV).ok().filter(|p| !p.trim().is_empty());
    let Some(log_path) = file_logging else {
        registry.init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let file_layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);

            registry.with(file_layer).init();
            tracing::debug!("File logging enabled: {}", log_path);
        }
        Err(e) => {
            registry.init();
            tracing::warn!("Could not open log file {}: {}", log_path, e);
        }
    }
}
