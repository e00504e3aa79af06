// Bridge host - runs every extension context in one process
//
// Background, content script, offscreen document, UI panel and the inpage
// provider each get their own bridge task, wired together over in-memory
// ports and a shared page window.

use anyhow::{Context, Result};
use bridge_core::storage::{debug_logger_enabled, load_wallet_info, set_typed, KeyValueStore, WALLET_INFO_LOCAL_KEY_V5};
use bridge_core::{
    Bridge, BridgeConfig, BridgeHandle, ChannelName, ContextRole, Delivery, PageWindow, PortName, Transport,
};
use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

mod config;
mod store;
mod wallet;

struct Contexts {
    background: BridgeHandle,
    content_script: BridgeHandle,
    offscreen: BridgeHandle,
    ui: BridgeHandle,
    inpage: BridgeHandle,
}

impl Contexts {
    fn all(&self) -> [(&'static str, &BridgeHandle); 5] {
        [
            ("background", &self.background),
            ("content_script", &self.content_script),
            ("offscreen", &self.offscreen),
            ("ui", &self.ui),
            ("inpage", &self.inpage),
        ]
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = config::ConfigFile::load(&config_path)?;
    config.validate()?;

    let store: Arc<dyn KeyValueStore> = Arc::new(
        store::FileStore::open(&config.host.store_path)
            .context(format!("Failed to open store: {}", config.host.store_path))?,
    );

    // Initialize tracing; the stored debug switch raises the default level
    let default_level = if debug_logger_enabled(store.as_ref()).unwrap_or(false) {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!("🚀 Starting bridge host");
    tracing::info!("Loaded configuration from: {}", config_path);
    tracing::info!("📦 Store: {}", store.description());

    if let Some(seed) = &config.wallet {
        if load_wallet_info(store.as_ref())?.is_none() {
            set_typed(store.as_ref(), WALLET_INFO_LOCAL_KEY_V5, seed)?;
            tracing::info!("Seeded wallet info for {}", seed.name);
        }
    }

    let contexts = start_contexts(&config.host, &config.bridge, store).await?;

    // Page asks for accounts the way a dApp would
    match contexts
        .inpage
        .request(ChannelName::Extension, json!({ "method": "getAccounts" }))
        .await
    {
        Ok(accounts) => tracing::info!("✅ Page received accounts: {}", accounts),
        Err(e) => tracing::warn!("❌ getAccounts failed: {}", e),
    }
    contexts
        .background
        .emit(ChannelName::Extension, json!({ "event": "bridgeReady" }))
        .await?;

    tracing::info!("✅ All contexts connected, press Ctrl+C to stop");

    let interval_secs = config.host.stats_interval_secs;
    let stats_loop = async {
        if interval_secs == 0 {
            return std::future::pending::<()>().await;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log_stats(&contexts).await;
        }
    };

    tokio::select! {
        _ = shutdown_signal() => {},
        _ = stats_loop => {},
    }

    log_stats(&contexts).await;
    for (_, handle) in contexts.all() {
        handle.shutdown();
    }
    Ok(())
}

async fn start_contexts(
    host: &config::HostConfig,
    bridge: &BridgeConfig,
    store: Arc<dyn KeyValueStore>,
) -> Result<Contexts> {
    let window = PageWindow::new(host.page_origin.clone());
    let ext = host.extension_origin.as_str();
    let page = host.page_origin.as_str();

    let (background, bg_deliveries) = Bridge::spawn(ContextRole::Background, ext, bridge.clone(), None);
    wallet::spawn_service(background.clone(), bg_deliveries, store);

    // Content scripts share the page's origin
    let (content_script, cs_deliveries) =
        Bridge::spawn(ContextRole::ContentScript, page, bridge.clone(), Some(window.clone()));
    log_events("content_script", cs_deliveries);

    let (offscreen, offscreen_deliveries) = Bridge::spawn(ContextRole::Offscreen, ext, bridge.clone(), None);
    log_events("offscreen", offscreen_deliveries);

    let (ui, ui_deliveries) = Bridge::spawn(ContextRole::Ui, ext, bridge.clone(), None);
    log_events("ui", ui_deliveries);

    let (inpage, inpage_deliveries) = Bridge::spawn(ContextRole::Inpage, page, bridge.clone(), Some(window));
    log_events("inpage", inpage_deliveries);

    for (port, client, client_origin) in [
        (PortName::ContentScriptToBackground, &content_script, page),
        (PortName::OffscreenToBackground, &offscreen, ext),
        (PortName::UiToBackground, &ui, ext),
    ] {
        let (bg_end, client_end) = Transport::pair();
        background
            .connect(port, client_origin, bg_end)
            .await
            .context(format!("Background failed to accept {}", port))?;
        client
            .connect(port, ext, client_end)
            .await
            .context(format!("Client failed to open {}", port))?;
        tracing::info!("🔗 {} connected", port);
    }

    Ok(Contexts {
        background,
        content_script,
        offscreen,
        ui,
        inpage,
    })
}

/// Contexts without their own handler just log what reaches them.
fn log_events(context: &'static str, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            tracing::info!(
                context,
                channel = %delivery.channel(),
                origin = %delivery.origin(),
                "📥 {}",
                delivery.payload()
            );
        }
    });
}

async fn log_stats(contexts: &Contexts) {
    for (name, handle) in contexts.all() {
        match handle.stats().await {
            Ok(stats) => match serde_json::to_string(&stats) {
                Ok(line) => tracing::info!("📊 {}: {}", name, line),
                Err(e) => tracing::warn!("Failed to encode stats for {}: {}", name, e),
            },
            Err(e) => tracing::warn!("No stats from {}: {}", name, e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping contexts");
}
