use std::sync::Arc;

use fanout_bus::gst::GstLaunchEngine;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod manager;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("fanout_bus", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error loading config: {:#}", e);
        std::process::exit(1);
    });
    let registry = config::Registry::load(&config.registry).unwrap_or_else(|e| {
        eprintln!("Error loading registry: {:#}", e);
        std::process::exit(1);
    });
    if registry.is_empty() {
        log::warn!("no resources registered");
    }
    log::info!(
        "{} resources registered, engine {}",
        registry.len(),
        config.gst_launch
    );

    let engine = Arc::new(GstLaunchEngine::new(config.gst_launch.as_str()));
    let manager = Arc::new(manager::StreamManager::new(
        engine,
        registry,
        config.pipeline_options(),
    ));

    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    let server = api::start_api_server(config.listen, Arc::clone(&manager), cancel_clone);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    manager.shutdown().await;
    let _ = server.await;
    std::process::exit(0);
}
