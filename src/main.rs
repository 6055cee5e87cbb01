//! callbridge - Main entry point
//!
//! Serves the web client, the health and ICE config endpoints and the
//! signaling relay.

mod args;

use args::Args;
use callbridge::config::Config;
use callbridge::registry::RelayPolicy;
use callbridge::web::{self, SharedState};
use clap::Parser;
use log::{error, info, warn};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = args.load_config();
    let file_level = loaded
        .as_ref()
        .map(|cfg| cfg.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let log_level = if args.verbose { "debug".to_string() } else { file_level };

    // Quiet the webrtc-rs internals unless asked for explicitly
    env_logger::Builder::new()
        .parse_filters(&env::var("CALLBRIDGE_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("callbridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    apply_http_overrides(&mut config, &args);
    apply_signaling_overrides(&mut config, &args);
    apply_negotiation_overrides(&mut config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let state = Arc::new(SharedState::new(config));

    let mut http_handle = task::spawn(async move {
        if let Err(e) = web::run_http_server(state).await {
            error!("HTTP server error: {}", e);
        }
    });

    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown => {
            info!("Initiating graceful shutdown...");
            http_handle.abort();
        }
        result = &mut http_handle => {
            log_async_task_result("HTTP server", result);
        }
    }

    info!("callbridge stopped");
    Ok(())
}

fn log_async_task_result(task: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => warn!("{} stopped unexpectedly", task),
        Err(err) => error!("{} join error: {}", task, err),
    }
}

fn apply_http_overrides(config: &mut Config, args: &Args) {
    let env_host = env_var("CALLBRIDGE_HOST");
    let env_port = env_var("CALLBRIDGE_PORT")
        .or_else(|| env_var("PORT"))
        .and_then(|p| parse_or_warn::<u16>("port", &p));
    let env_web_root = env_var("CALLBRIDGE_WEB_ROOT");
    let env_origins = env_var("CALLBRIDGE_ALLOWED_ORIGINS");

    if let Some(host) = args.host.clone().or(env_host) {
        config.http.host = host;
    }
    if let Some(port) = args.port.or(env_port) {
        config.http.port = port;
    }
    if let Some(root) = args.web_root.clone().or(env_web_root.map(PathBuf::from)) {
        config.http.web_root = root;
    }
    if let Some(list) = args.allowed_origins.clone().or(env_origins) {
        config.http.allowed_origins = parse_csv_list(&list);
    }
}

fn apply_signaling_overrides(config: &mut Config, args: &Args) {
    let env_policy = env_var("CALLBRIDGE_RELAY_POLICY").and_then(|p| parse_or_warn::<RelayPolicy>("relay policy", &p));
    let env_max = env_var("CALLBRIDGE_MAX_PARTICIPANTS").and_then(|m| parse_or_warn::<usize>("participant cap", &m));
    let env_path = env_var("CALLBRIDGE_SIGNALING_PATH");

    if let Some(policy) = args.relay_policy.or(env_policy) {
        config.signaling.relay_policy = policy;
    }
    if let Some(max) = args.max_participants.or(env_max) {
        config.signaling.max_participants = max;
    }
    if let Some(path) = env_path {
        config.signaling.path = path;
    }
}

fn apply_negotiation_overrides(config: &mut Config) {
    if let Some(secs) =
        env_var("CALLBRIDGE_CONNECT_TIMEOUT_SECS").and_then(|s| parse_or_warn::<u64>("connect timeout", &s))
    {
        config.negotiation.connect_timeout_secs = secs;
    }
    if let Some(stun) = env_var("CALLBRIDGE_STUN_SERVERS") {
        config.negotiation.ice_servers = parse_csv_list(&stun)
            .iter()
            .map(|url| callbridge::config::IceServerConfig::stun(url))
            .collect();
    }
}

fn env_var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn parse_or_warn<T: std::str::FromStr>(what: &str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {} override: {}", what, raw);
            None
        }
    }
}

fn parse_csv_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}
