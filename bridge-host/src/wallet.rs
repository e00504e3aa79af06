// Background-side handler for wallet metadata requests
//
// Payloads are `{"method": "...", "params": ...}`. Only metadata lives here;
// signing and account management belong to the wallet itself.

use anyhow::{Context, Result};
use bridge_core::storage::{load_wallet_info, KeyValueStore, DEBUG_LOGGER_STORAGE_KEY};
use bridge_core::{BridgeHandle, ChannelName, Delivery};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn spawn_service(
    handle: BridgeHandle,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    store: Arc<dyn KeyValueStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            if !delivery.is_request() {
                tracing::debug!(payload = %delivery.payload(), "background event");
                continue;
            }

            let sent = match handle_request(store.as_ref(), &delivery) {
                Ok(result) => handle.respond(&delivery, result),
                Err(e) => {
                    let message = format!("{:#}", e);
                    tracing::warn!(origin = %delivery.origin(), %message, "request refused");
                    handle.respond_error(&delivery, &message)
                }
            };
            if sent.is_err() {
                break;
            }
        }
        tracing::info!("wallet service stopped");
    })
}

fn handle_request(store: &dyn KeyValueStore, delivery: &Delivery) -> Result<Value> {
    let method = delivery.payload()["method"].as_str().unwrap_or_default();
    let params = &delivery.payload()["params"];

    match (delivery.channel(), method) {
        (ChannelName::Extension, "getAccounts") => {
            let info = load_wallet_info(store).context("Failed to load wallet info")?;
            Ok(json!(info.map(|i| i.accounts).unwrap_or_default()))
        }
        (_, "getWalletInfo") => {
            let info = load_wallet_info(store).context("Failed to load wallet info")?;
            Ok(json!(info))
        }
        // Internal only: pages must never flip logging
        (ChannelName::Ipc, "setDebugLogger") => {
            let enabled = params["enabled"].as_bool().unwrap_or(false);
            store
                .set(DEBUG_LOGGER_STORAGE_KEY, json!(enabled))
                .context("Failed to store debug logger switch")?;
            tracing::info!(enabled, "debug logger switched");
            Ok(json!(enabled))
        }
        (_, "") => anyhow::bail!("missing method"),
        (_, other) => anyhow::bail!("unsupported method: {}", other),
    }
}
