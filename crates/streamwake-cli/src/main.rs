use std::path::PathBuf;

use clap::Parser;
use streamwake_core::{init_tracing, run_listener, FileConfig, ListenerConfig};

#[derive(Parser, Debug)]
#[command(name = "streamwake")]
#[command(about = "Listen to a chat event stream and print normalized events as JSON lines")]
#[command(version)]
struct Cli {
    /// API token for the REST API
    #[arg(long, env = "STREAMWAKE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Server whose channels are monitored
    #[arg(long, env = "STREAMWAKE_SERVER_ID")]
    server_id: Option<String>,

    /// REST API base URL
    #[arg(long, env = "STREAMWAKE_BASE_URL")]
    base_url: Option<String>,

    /// Run the wake command for events that pass the cooldown gate
    #[arg(long, env = "STREAMWAKE_WAKE", num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    wake: Option<bool>,

    /// Command line to run on wake; the message is appended as the last argument
    #[arg(long, env = "STREAMWAKE_WAKE_COMMAND")]
    wake_command: Option<String>,

    /// Minimum seconds between wakes for the same channel
    #[arg(long, env = "STREAMWAKE_WAKE_COOLDOWN", value_name = "SECS")]
    wake_cooldown: Option<u64>,

    /// Seconds before a running wake command is killed
    #[arg(long, env = "STREAMWAKE_WAKE_TIMEOUT", value_name = "SECS")]
    wake_timeout: Option<u64>,

    /// Seconds between channel discovery passes
    #[arg(long, env = "STREAMWAKE_REFRESH_INTERVAL", value_name = "SECS")]
    refresh_interval: Option<u64>,

    /// Lifetime requested for stream credentials
    #[arg(long, env = "STREAMWAKE_TOKEN_TTL", value_name = "SECS")]
    token_ttl: Option<u64>,

    /// Debug-level diagnostics on stderr
    #[arg(long, short, env = "STREAMWAKE_VERBOSE", num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    verbose: Option<bool>,

    /// Path to JSON config file (camelCase keys, lowest precedence)
    #[arg(long, short = 'c', env = "STREAMWAKE_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Flag and environment values as the highest-precedence layer
    fn settings(&self) -> FileConfig {
        FileConfig {
            token: self.token.clone(),
            server_id: self.server_id.clone(),
            base_url: self.base_url.clone(),
            wake: self.wake,
            wake_command: self.wake_command.clone(),
            wake_cooldown: self.wake_cooldown,
            wake_timeout: self.wake_timeout,
            refresh_interval: self.refresh_interval,
            token_ttl: self.token_ttl,
            verbose: self.verbose,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => match FileConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        },
        None => FileConfig::default(),
    };
    let settings = cli.settings().or(file_config);

    init_tracing(settings.verbose.unwrap_or(false));

    let config = match ListenerConfig::resolve(settings) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    tracing::debug!("Resolved config: {:?}", config);

    if let Err(e) = run_listener(config).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
