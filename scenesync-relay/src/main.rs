//! Standalone relay: sequences every session's operations per scene and
//! fans them out.
//!
//! ```text
//! scenesync-relay --bind 0.0.0.0:9090
//! scenesync-relay --config relay.toml
//! RUST_LOG=debug scenesync-relay
//! ```

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use log::info;

use scenesync_collab::server::{RelayServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(version, about = "Relay for shared scene editing")]
struct Cli {
    #[arg(help = "TOML file with relay settings", long)]
    config: Option<PathBuf>,

    #[arg(help = "Address to listen on, overrides the config file", long)]
    bind: Option<String>,

    #[arg(help = "Maximum sessions per scene, overrides the config file", long)]
    max_sessions: Option<usize>,
}

fn load_config(cli: &Cli) -> Result<ServerConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            toml::from_str(&text).map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => ServerConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(max) = cli.max_sessions {
        config.max_sessions_per_scene = max;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        "Starting relay on {} ({} sessions per scene, history {})",
        config.bind_addr, config.max_sessions_per_scene, config.history_capacity
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} operations sequenced",
                stats.total_connections, stats.sequenced_ops
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = Cli::parse_from(["scenesync-relay", "--bind", "0.0.0.0:7000", "--max-sessions", "8"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_sessions_per_scene, 8);
        assert_eq!(config.history_capacity, ServerConfig::default().history_capacity);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["scenesync-relay", "--config", "/nonexistent/relay.toml"]);
        assert!(load_config(&cli).is_err());
    }
}
