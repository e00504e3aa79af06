// Shared wiring for the integration scenarios
#![allow(dead_code)]

use bridge_core::{
    Bridge, BridgeConfig, BridgeHandle, BridgeStats, ChannelName, ContextRole, Delivery, PageWindow,
    PortName, Transport,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

pub const EXT: &str = "chrome-extension://onekey";
pub const PAGE: &str = "https://dapp.example";
pub const ACCOUNT: &str = "0x1f9090aae28b8a3dceadf281b0f12828e676c326";

/// Every context of one extension plus the page window they share.
pub struct Extension {
    pub background: BridgeHandle,
    pub content_script: BridgeHandle,
    pub inpage: BridgeHandle,
    pub inpage_deliveries: mpsc::UnboundedReceiver<Delivery>,
    pub ui: BridgeHandle,
    pub ui_deliveries: mpsc::UnboundedReceiver<Delivery>,
    pub window: PageWindow,
}

impl Extension {
    pub async fn start(config: BridgeConfig) -> Extension {
        let window = PageWindow::new(PAGE);

        let (background, bg_deliveries) =
            Bridge::spawn(ContextRole::Background, EXT, config.clone(), None);
        serve_wallet(background.clone(), bg_deliveries);

        // Content scripts run in the page's origin
        let (content_script, _cs_deliveries) = Bridge::spawn(
            ContextRole::ContentScript,
            PAGE,
            config.clone(),
            Some(window.clone()),
        );
        let (inpage, inpage_deliveries) =
            Bridge::spawn(ContextRole::Inpage, PAGE, config.clone(), Some(window.clone()));
        let (ui, ui_deliveries) = Bridge::spawn(ContextRole::Ui, EXT, config, None);

        link(&background, &content_script, PortName::ContentScriptToBackground, PAGE).await;
        link(&background, &ui, PortName::UiToBackground, EXT).await;

        Extension {
            background,
            content_script,
            inpage,
            inpage_deliveries,
            ui,
            ui_deliveries,
            window,
        }
    }
}

/// Connect a fresh port between the background and a client context.
pub async fn link(background: &BridgeHandle, client: &BridgeHandle, port: PortName, client_origin: &str) {
    let (bg_end, client_end) = Transport::pair();
    background
        .connect(port, client_origin, bg_end)
        .await
        .expect("background accepts port");
    client
        .connect(port, EXT, client_end)
        .await
        .expect("client accepts port");
}

/// Minimal wallet handler: answers `getAccounts`, refuses everything else.
pub fn serve_wallet(handle: BridgeHandle, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            if !delivery.is_request() {
                continue;
            }
            let result = match delivery.payload()["method"].as_str() {
                Some("getAccounts") if delivery.channel() == ChannelName::Extension => {
                    handle.respond(&delivery, json!([ACCOUNT]))
                }
                _ => handle.respond_error(&delivery, "unsupported method"),
            };
            if result.is_err() {
                return;
            }
        }
    });
}

/// Poll a context's counters until `check` holds.
pub async fn wait_for_stats(handle: &BridgeHandle, check: impl Fn(&BridgeStats) -> bool) -> BridgeStats {
    let poll = async {
        loop {
            let stats = handle.stats().await.expect("bridge running");
            if check(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("stats condition not reached in time")
}
