mod common;

use bridge_core::config::{CorrelatorConfig, KeepaliveConfig};
use bridge_core::keepalive::Adoption;
use bridge_core::{
    decode, Bridge, BridgeConfig, ChannelName, ContextRole, MessageKind, PageWindow, PortName,
    RequestError, RouteError, Transport,
};
use common::{link, serve_wallet, wait_for_stats, EXT, PAGE};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

const UI: PortName = PortName::UiToBackground;
const CS: PortName = PortName::ContentScriptToBackground;

fn small_queue() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.router.queue_capacity = 1;
    config
}

fn fast_keepalive() -> BridgeConfig {
    BridgeConfig {
        keepalive: KeepaliveConfig {
            interval_ms: 1_000,
            pong_timeout_ms: 300,
            max_missed: 2,
        },
        correlator: CorrelatorConfig {
            default_timeout_ms: 60_000,
        },
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_missed_pongs_reject_pending_then_reconnect_flushes_in_order() {
    let (ui, _deliveries) = Bridge::spawn(ContextRole::Ui, EXT, fast_keepalive(), None);

    // A background that reads everything and answers nothing
    let (ui_end, mut silent) = Transport::pair();
    ui.connect(UI, EXT, ui_end).await.unwrap();
    let started = Instant::now();

    let pending: Vec<_> = (0..3)
        .map(|n| {
            let ui = ui.clone();
            tokio::spawn(async move { ui.request(ChannelName::Extension, json!({ "n": n })).await })
        })
        .collect();

    let mut requests = 0;
    while requests < 3 {
        let envelope = decode(&silent.source.next_frame().await.unwrap()).unwrap();
        if envelope.kind == MessageKind::Request {
            requests += 1;
        }
    }

    for task in pending {
        let result = task.await.unwrap();
        assert!(
            matches!(result, Err(RequestError::PortDisconnected { port: UI, .. })),
            "unexpected result {:?}",
            result
        );
    }
    // Ping at 1000, miss at 1300, ping at 2000, miss at 2300
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(2_300), "closed too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(60), "rejected by timeout instead of disconnect");

    let stats = ui.stats().await.unwrap();
    assert_eq!(stats.ports_closed, 1);
    assert_eq!(stats.open_ports, 0);
    assert_eq!(stats.pending_requests, 0);

    // Events emitted while the port is down wait for the next transport
    for n in 0..3 {
        ui.emit(ChannelName::Extension, json!(n)).await.unwrap();
    }

    let (ui_end, mut revived) = Transport::pair();
    let adoption = ui.connect(UI, EXT, ui_end).await.unwrap();
    assert!(matches!(adoption, Adoption::Reconnected { .. }));

    for n in 0..3 {
        let envelope = decode(&revived.source.next_frame().await.unwrap()).unwrap();
        assert_eq!(envelope.kind, MessageKind::Event);
        assert_eq!(envelope.payload, json!(n));
    }

    let stats = ui.stats().await.unwrap();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.open_ports, 1);
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_the_port_open() {
    let (background, bg_deliveries) =
        Bridge::spawn(ContextRole::Background, EXT, fast_keepalive(), None);
    serve_wallet(background.clone(), bg_deliveries);
    let (ui, _deliveries) = Bridge::spawn(ContextRole::Ui, EXT, fast_keepalive(), None);
    link(&background, &ui, UI, EXT).await;

    tokio::time::sleep(Duration::from_secs(10)).await;

    let ui_stats = ui.stats().await.unwrap();
    let bg_stats = background.stats().await.unwrap();
    assert_eq!(ui_stats.open_ports, 1);
    assert_eq!(ui_stats.ports_closed, 0);
    assert!(ui_stats.pings_answered > 0);
    assert!(bg_stats.pings_answered > 0);

    let accounts = ui
        .request(ChannelName::Extension, json!({ "method": "getAccounts" }))
        .await
        .unwrap();
    assert_eq!(accounts, json!([common::ACCOUNT]));
}

#[tokio::test]
async fn test_background_going_away_rejects_pending_immediately() {
    let (background, mut bg_deliveries) =
        Bridge::spawn(ContextRole::Background, EXT, BridgeConfig::default(), None);
    let (ui, _deliveries) = Bridge::spawn(ContextRole::Ui, EXT, BridgeConfig::default(), None);
    link(&background, &ui, UI, EXT).await;

    let waiting = {
        let ui = ui.clone();
        tokio::spawn(async move { ui.request(ChannelName::Extension, json!({ "method": "slow" })).await })
    };

    // The background receives the request, then its context is torn down
    let delivery = bg_deliveries.recv().await.unwrap();
    assert!(delivery.is_request());
    background.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("rejected well before the request timeout")
        .unwrap();
    assert_eq!(
        result,
        Err(RequestError::PortDisconnected {
            id: delivery.envelope.id.clone(),
            port: UI,
        })
    );
}

#[tokio::test]
async fn test_content_script_losing_background_fails_page_requests() {
    let window = PageWindow::new(PAGE);
    let (background, mut bg_deliveries) =
        Bridge::spawn(ContextRole::Background, EXT, BridgeConfig::default(), None);
    let (content_script, _cs_deliveries) = Bridge::spawn(
        ContextRole::ContentScript,
        PAGE,
        BridgeConfig::default(),
        Some(window.clone()),
    );
    let (inpage, _inpage_deliveries) =
        Bridge::spawn(ContextRole::Inpage, PAGE, BridgeConfig::default(), Some(window));
    link(&background, &content_script, CS, PAGE).await;

    let waiting = {
        let inpage = inpage.clone();
        tokio::spawn(async move { inpage.request(ChannelName::Extension, json!({ "method": "slow" })).await })
    };

    let delivery = bg_deliveries.recv().await.unwrap();
    background.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("page rejected well before the request timeout")
        .unwrap();
    assert_eq!(
        result,
        Err(RequestError::PortDisconnected {
            id: delivery.envelope.id.clone(),
            port: CS,
        })
    );

    let stats = content_script.stats().await.unwrap();
    assert_eq!(stats.ports_closed, 1);
    assert_eq!(stats.open_ports, 0);
}

#[tokio::test]
async fn test_evicted_page_request_is_failed_back_to_the_page() {
    let window = PageWindow::new(PAGE);
    // No background yet: everything the content script relays waits in its queue
    let (content_script, _cs_deliveries) =
        Bridge::spawn(ContextRole::ContentScript, PAGE, small_queue(), Some(window.clone()));
    let (inpage, _inpage_deliveries) =
        Bridge::spawn(ContextRole::Inpage, PAGE, BridgeConfig::default(), Some(window));

    let first = {
        let inpage = inpage.clone();
        tokio::spawn(async move { inpage.request(ChannelName::Extension, json!({ "n": 1 })).await })
    };
    // The page sees its own post come back once it is on the window
    wait_for_stats(&inpage, |s| s.reflections_ignored >= 1).await;
    let second = {
        let inpage = inpage.clone();
        tokio::spawn(async move { inpage.request(ChannelName::Extension, json!({ "n": 2 })).await })
    };

    let result = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .expect("evicted request answered")
        .unwrap();
    match result {
        Err(RequestError::Dropped {
            id,
            reason: RouteError::QueueOverflow { port, dropped_id },
        }) => {
            assert_eq!(port, CS);
            assert_eq!(dropped_id, id);
        }
        other => panic!("unexpected result {:?}", other),
    }

    wait_for_stats(&content_script, |s| s.queue_overflows == 1).await;
    assert!(!second.is_finished());
    second.abort();
}

#[tokio::test(start_paused = true)]
async fn test_slow_answer_reaches_page_past_default_timeout() {
    let mut relay_config = BridgeConfig::default();
    relay_config.correlator.default_timeout_ms = 1_000;

    let window = PageWindow::new(PAGE);
    let (background, mut bg_deliveries) =
        Bridge::spawn(ContextRole::Background, EXT, BridgeConfig::default(), None);
    let (content_script, _cs_deliveries) =
        Bridge::spawn(ContextRole::ContentScript, PAGE, relay_config, Some(window.clone()));
    let (inpage, _inpage_deliveries) =
        Bridge::spawn(ContextRole::Inpage, PAGE, BridgeConfig::default(), Some(window));
    link(&background, &content_script, CS, PAGE).await;

    let responder = background.clone();
    tokio::spawn(async move {
        let delivery = bg_deliveries.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        responder.respond(&delivery, json!("late")).unwrap();
    });

    let answer = inpage
        .send(
            ChannelName::Extension,
            json!({ "method": "approve" }),
            None,
            Duration::from_secs(20),
        )
        .await
        .unwrap();
    assert_eq!(answer, json!("late"));
    assert_eq!(content_script.stats().await.unwrap().unmatched_responses, 0);
}

#[tokio::test]
async fn test_queue_overflow_rejects_the_oldest_request() {
    let (ui, _deliveries) = Bridge::spawn(ContextRole::Ui, EXT, small_queue(), None);

    let first = {
        let ui = ui.clone();
        tokio::spawn(async move { ui.request(ChannelName::Extension, json!({ "n": 1 })).await })
    };
    wait_for_stats(&ui, |s| s.pending_requests == 1).await;
    let second = {
        let ui = ui.clone();
        tokio::spawn(async move { ui.request(ChannelName::Extension, json!({ "n": 2 })).await })
    };

    let result = first.await.unwrap();
    match result {
        Err(RequestError::Dropped {
            id,
            reason: RouteError::QueueOverflow { port, dropped_id },
        }) => {
            assert_eq!(port, UI);
            assert_eq!(dropped_id, id);
        }
        other => panic!("unexpected result {:?}", other),
    }

    let stats = wait_for_stats(&ui, |s| s.queue_overflows == 1).await;
    assert_eq!(stats.pending_requests, 1);
    second.abort();
}

#[tokio::test]
async fn test_request_queued_while_down_resolves_after_reconnect() {
    let (background, bg_deliveries) =
        Bridge::spawn(ContextRole::Background, EXT, BridgeConfig::default(), None);
    serve_wallet(background.clone(), bg_deliveries);
    let (ui, _deliveries) = Bridge::spawn(ContextRole::Ui, EXT, BridgeConfig::default(), None);
    link(&background, &ui, UI, EXT).await;

    ui.disconnect(UI).await.unwrap();
    wait_for_stats(&background, |s| s.ports_closed == 1).await;

    let waiting = {
        let ui = ui.clone();
        tokio::spawn(async move { ui.request(ChannelName::Extension, json!({ "method": "getAccounts" })).await })
    };
    wait_for_stats(&ui, |s| s.pending_requests == 1).await;

    link(&background, &ui, UI, EXT).await;

    let accounts = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("flushed request answered")
        .unwrap()
        .unwrap();
    assert_eq!(accounts, json!([common::ACCOUNT]));
    assert_eq!(ui.stats().await.unwrap().reconnects, 1);
}

#[tokio::test]
async fn test_duplicate_connect_is_refused() {
    let (background, _deliveries) =
        Bridge::spawn(ContextRole::Background, EXT, BridgeConfig::default(), None);
    let (first, _peer1) = Transport::pair();
    let (second, _peer2) = Transport::pair();

    background.connect(UI, EXT, first).await.unwrap();
    let err = background.connect(UI, EXT, second).await.unwrap_err();
    assert_eq!(
        err,
        bridge_core::ConnectError::Registry(bridge_core::RegistryError::DuplicatePort(UI))
    );
}

#[tokio::test]
async fn test_undecodable_frame_is_dropped_and_port_survives() {
    let (background, bg_deliveries) =
        Bridge::spawn(ContextRole::Background, EXT, BridgeConfig::default(), None);
    serve_wallet(background.clone(), bg_deliveries);
    let (bg_end, mut ui_end) = Transport::pair();
    background.connect(UI, EXT, bg_end).await.unwrap();

    ui_end.sink.post(b"{not json".to_vec()).unwrap();
    common::wait_for_stats(&background, |s| s.decode_errors == 1).await;

    let request = bridge_core::Envelope::request(
        "ui:test:1",
        ChannelName::Extension,
        EXT,
        json!({ "method": "getAccounts" }),
    );
    ui_end.sink.post(request.encode()).unwrap();

    let response = loop {
        let envelope = decode(&ui_end.source.next_frame().await.unwrap()).unwrap();
        if envelope.kind == MessageKind::Response {
            break envelope;
        }
    };
    assert_eq!(response.id, "ui:test:1");
    assert_eq!(response.payload, json!([common::ACCOUNT]));
}
