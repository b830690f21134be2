use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use conductor_channel::local::serve_local_hub;
use conductor_channel::{
    ChannelConfig, ChannelError, ChannelManager, ConnectionStatus, SocketOptions, StreamOptions,
};
use conductor_core::{
    HandlerContext, HandlerTable, OperationSet, OperationStatus, PushEvent,
};
use serde_json::{Value, json};
use tokio::time::{Instant, sleep, timeout};

const OPS_KEY: &str = "operations";

fn fast_socket() -> SocketOptions {
    SocketOptions {
        max_retries: 5,
        retry_delay: Duration::from_millis(50),
        outbound_capacity: 32,
    }
}

fn fast_stream() -> StreamOptions {
    StreamOptions {
        reopen_delay: Duration::from_millis(100),
    }
}

/// The handler table a feature registers to track keyed operations: the log
/// is cleared exactly when an operation starts, and records are folded via
/// the state machine.
fn operation_table() -> HandlerTable {
    HandlerTable::new().on(
        "operation",
        |event: &PushEvent, ctx: &mut HandlerContext<'_>| {
            let operation_id = event
                .payload()
                .get("operation_id")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string();
            if event.status == Some(OperationStatus::Started) {
                ctx.clear_log();
            }
            let mut set = OperationSet::load(ctx.state(), OPS_KEY);
            set.apply(operation_id, event);
            set.store(OPS_KEY, ctx);
        },
    )
}

fn operation_event(op: &str, status: OperationStatus, progress: Option<u32>) -> PushEvent {
    PushEvent {
        status: Some(status),
        progress,
        details: Some(json!({ "operation_id": op })),
        ..PushEvent::named("operation")
    }
}

fn output_line(line: &str) -> PushEvent {
    PushEvent {
        details: Some(json!(line)),
        ..PushEvent::named("output")
    }
}

async fn wait_for_status(manager: &ChannelManager, want: ConnectionStatus) {
    let mut watch = manager.status_watch();
    let waited = timeout(Duration::from_secs(5), async {
        loop {
            if *watch.borrow_and_update() == want {
                return;
            }
            if watch.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for status {want:?}");
    assert_eq!(manager.connection_status(), want);
}

async fn wait_for_state<F>(manager: &ChannelManager, predicate: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = manager.state().await;
        if predicate(&state) {
            return state;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for state; last: {state}"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

fn record_status(state: &Value, op: &str) -> Value {
    state[OPS_KEY][op]["status"].clone()
}

#[tokio::test]
async fn socket_lifecycle_reaches_complete_with_ordered_log() {
    let server = serve_local_hub().await.unwrap();
    let mut config = ChannelConfig::socket()
        .initial_state(json!({}))
        .handlers(operation_table());
    config.socket = fast_socket();
    let manager = ChannelManager::create(server.channel.clone(), "cert-ops", config);
    wait_for_status(&manager, ConnectionStatus::Open).await;

    let hub = &server.hub;
    hub.push(
        "cert-ops",
        &operation_event("op-1", OperationStatus::Started, None),
    )
    .await;
    hub.push("cert-ops", &output_line("creating batch")).await;
    hub.push(
        "cert-ops",
        &operation_event("op-1", OperationStatus::InProgress, Some(40)),
    )
    .await;
    // unknown event names must be dropped without disturbing anything
    hub.push("cert-ops", &PushEvent::named("legacy_noise")).await;
    hub.push("cert-ops", &output_line("signing 7 of 12")).await;
    hub.push(
        "cert-ops",
        &operation_event("op-1", OperationStatus::InProgress, Some(70)),
    )
    .await;
    hub.push(
        "cert-ops",
        &operation_event("op-1", OperationStatus::Complete, None),
    )
    .await;

    let state = wait_for_state(&manager, |state| {
        record_status(state, "op-1") == json!("complete")
    })
    .await;
    assert_eq!(state[OPS_KEY]["op-1"]["progress"], json!(100));
    assert_eq!(
        manager.log().await,
        vec!["creating batch".to_string(), "signing 7 of 12".to_string()]
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn reconnect_resynchronizes_from_initial_state_snapshot() {
    let server = serve_local_hub().await.unwrap();
    let connections = Arc::new(AtomicU32::new(0));
    let connections_seen = connections.clone();

    let mut config = ChannelConfig::socket()
        .initial_state(json!({}))
        .handlers(operation_table())
        .on_connect(Arc::new(move || {
            connections_seen.fetch_add(1, Ordering::SeqCst);
        }));
    config.socket = fast_socket();
    let manager = ChannelManager::create(server.channel.clone(), "install", config);
    wait_for_status(&manager, ConnectionStatus::Open).await;

    server
        .hub
        .push(
            "install",
            &operation_event("op-1", OperationStatus::Started, None),
        )
        .await;
    server
        .hub
        .push(
            "install",
            &operation_event("op-1", OperationStatus::InProgress, Some(40)),
        )
        .await;
    wait_for_state(&manager, |state| {
        state[OPS_KEY]["op-1"]["progress"] == json!(40)
    })
    .await;

    // While the client is away the operation finishes; the only trace is the
    // authoritative snapshot served on reconnect. Intermediate progress
    // between 40 and done is lost, and that is fine.
    server
        .hub
        .set_snapshot(
            "install",
            json!({ OPS_KEY: { "op-1": { "status": "complete", "progress": 100 } } }),
        )
        .await;
    server.hub.kick("install").await;

    let state = wait_for_state(&manager, |state| {
        record_status(state, "op-1") == json!("complete")
    })
    .await;
    assert_eq!(state[OPS_KEY]["op-1"]["progress"], json!(100));
    assert!(connections.load(Ordering::SeqCst) >= 2, "expected a reconnect");

    manager.shutdown().await;
}

#[tokio::test]
async fn emits_queued_before_connect_reach_the_server() {
    let server = serve_local_hub().await.unwrap();
    let mut config = ChannelConfig::socket().handlers(HandlerTable::new());
    config.socket = fast_socket();
    let manager = ChannelManager::create(server.channel.clone(), "bulk-delete", config);

    // no wait for Open: this may race the handshake and must still arrive
    manager
        .emit("cancel", Some(json!({ "operation_id": "op-9" })))
        .unwrap();

    let mut inbound = server.inbound;
    let (channel_id, outbound) = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel_id, "bulk-delete");
    assert_eq!(outbound.event, "cancel");
    assert_eq!(outbound.payload, Some(json!({ "operation_id": "op-9" })));

    manager.shutdown().await;
}

#[tokio::test]
async fn cancel_is_confirmed_by_the_server_not_the_click() {
    let server = serve_local_hub().await.unwrap();
    let mut config = ChannelConfig::socket()
        .initial_state(json!({}))
        .handlers(operation_table());
    config.socket = fast_socket();
    let manager = ChannelManager::create(server.channel.clone(), "data-package", config);
    wait_for_status(&manager, ConnectionStatus::Open).await;

    server
        .hub
        .push(
            "data-package",
            &operation_event("op-1", OperationStatus::Started, None),
        )
        .await;
    server
        .hub
        .push(
            "data-package",
            &operation_event("op-1", OperationStatus::InProgress, Some(30)),
        )
        .await;
    wait_for_state(&manager, |state| {
        record_status(state, "op-1") == json!("in_progress")
    })
    .await;

    manager
        .emit("cancel", Some(json!({ "operation_id": "op-1" })))
        .unwrap();

    // the abort request arrives at the server...
    let mut inbound = server.inbound;
    let (_, outbound) = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outbound.event, "cancel");

    // ...but until the server confirms, the operation is still in flight
    sleep(Duration::from_millis(100)).await;
    let state = manager.state().await;
    assert_eq!(record_status(&state, "op-1"), json!("in_progress"));

    let confirmation = PushEvent {
        error: Some("cancelled by user".to_string()),
        ..operation_event("op-1", OperationStatus::Failed, None)
    };
    server.hub.push("data-package", &confirmation).await;

    let state = wait_for_state(&manager, |state| {
        record_status(state, "op-1") == json!("failed")
    })
    .await;
    assert_eq!(
        state[OPS_KEY]["op-1"]["error"],
        json!("cancelled by user")
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn stream_transport_has_no_upstream_and_reopens_after_failure() {
    let server = serve_local_hub().await.unwrap();
    let mut config = ChannelConfig::stream()
        .initial_state(json!({}))
        .handlers(operation_table());
    config.stream = fast_stream();
    let manager = ChannelManager::create(server.channel.clone(), "ota-update", config);
    wait_for_status(&manager, ConnectionStatus::Open).await;

    assert!(matches!(
        manager.emit("cancel", None),
        Err(ChannelError::NoUpstream)
    ));

    server
        .hub
        .push(
            "ota-update",
            &operation_event("op-1", OperationStatus::InProgress, Some(20)),
        )
        .await;
    wait_for_state(&manager, |state| {
        state[OPS_KEY]["op-1"]["progress"] == json!(20)
    })
    .await;

    server
        .hub
        .set_snapshot(
            "ota-update",
            json!({ OPS_KEY: { "op-1": { "status": "complete", "progress": 100 } } }),
        )
        .await;
    server.hub.kick("ota-update").await;

    // one reopen after the fixed delay picks up the new snapshot
    let state = wait_for_state(&manager, |state| {
        record_status(state, "op-1") == json!("complete")
    })
    .await;
    assert_eq!(state[OPS_KEY]["op-1"]["progress"], json!(100));

    manager.shutdown().await;
}

#[tokio::test]
async fn per_item_updates_leave_sibling_items_untouched() {
    let server = serve_local_hub().await.unwrap();
    let table = HandlerTable::new().on(
        "item_progress",
        |event: &PushEvent, ctx: &mut HandlerContext<'_>| {
            let payload = event.payload();
            let (Some(op), Some(item)) = (
                payload.get("operation_id").and_then(Value::as_str),
                payload.get("item").and_then(Value::as_str),
            ) else {
                return;
            };
            let mut set = OperationSet::load(ctx.state(), OPS_KEY);
            let record = set.record_mut(op);
            record.update_item(
                item,
                conductor_core::ItemProgress {
                    status: event.status.unwrap_or_default(),
                    progress: event.progress,
                    message: event.message.clone(),
                },
            );
            set.store(OPS_KEY, ctx);
        },
    );
    let mut config = ChannelConfig::socket().initial_state(json!({})).handlers(table);
    config.socket = fast_socket();
    let manager = ChannelManager::create(server.channel.clone(), "bulk-delete", config);
    wait_for_status(&manager, ConnectionStatus::Open).await;

    let item_event = |item: &str, status: OperationStatus, progress: Option<u32>| PushEvent {
        status: Some(status),
        progress,
        details: Some(json!({ "operation_id": "delete-1", "item": item })),
        ..PushEvent::named("item_progress")
    };

    server
        .hub
        .push("bulk-delete", &item_event("A", OperationStatus::InProgress, Some(10)))
        .await;
    server
        .hub
        .push("bulk-delete", &item_event("B", OperationStatus::InProgress, Some(55)))
        .await;
    let state = wait_for_state(&manager, |state| {
        state[OPS_KEY]["delete-1"]["per_item"]["B"]["progress"] == json!(55)
    })
    .await;
    let b_before = state[OPS_KEY]["delete-1"]["per_item"]["B"].to_string();

    server
        .hub
        .push("bulk-delete", &item_event("A", OperationStatus::Complete, Some(100)))
        .await;
    let state = wait_for_state(&manager, |state| {
        state[OPS_KEY]["delete-1"]["per_item"]["A"]["status"] == json!("complete")
    })
    .await;
    let b_after = state[OPS_KEY]["delete-1"]["per_item"]["B"].to_string();
    assert_eq!(b_before, b_after);

    manager.shutdown().await;
}

#[tokio::test]
async fn managers_sharing_a_channel_id_own_independent_connections() {
    let server = serve_local_hub().await.unwrap();

    let manager_for = |handlers: HandlerTable| {
        let mut config = ChannelConfig::socket().initial_state(json!({})).handlers(handlers);
        config.socket = fast_socket();
        ChannelManager::create(server.channel.clone(), "cert-ops", config)
    };
    let first = manager_for(operation_table());
    let second = manager_for(operation_table());
    wait_for_status(&first, ConnectionStatus::Open).await;
    wait_for_status(&second, ConnectionStatus::Open).await;

    server
        .hub
        .push(
            "cert-ops",
            &operation_event("op-1", OperationStatus::Started, None),
        )
        .await;
    wait_for_state(&first, |state| {
        record_status(state, "op-1") == json!("started")
    })
    .await;
    wait_for_state(&second, |state| {
        record_status(state, "op-1") == json!("started")
    })
    .await;

    // closing one feature's channel must not disturb the other's
    first.shutdown().await;
    server
        .hub
        .push(
            "cert-ops",
            &operation_event("op-1", OperationStatus::Complete, None),
        )
        .await;
    wait_for_state(&second, |state| {
        record_status(state, "op-1") == json!("complete")
    })
    .await;

    second.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_reports_closed() {
    let server = serve_local_hub().await.unwrap();
    let mut config = ChannelConfig::socket().handlers(HandlerTable::new());
    config.socket = fast_socket();
    let manager = ChannelManager::create(server.channel.clone(), "cert-ops", config);
    wait_for_status(&manager, ConnectionStatus::Open).await;

    manager.shutdown().await;
    manager.shutdown().await;
    assert_eq!(manager.connection_status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn auto_reset_returns_a_completed_operation_to_idle() {
    let server = serve_local_hub().await.unwrap();
    let mut config = ChannelConfig::socket()
        .initial_state(json!({}))
        .handlers(operation_table());
    config.socket = fast_socket();
    let manager = ChannelManager::create(server.channel.clone(), "cert-ops", config);
    wait_for_status(&manager, ConnectionStatus::Open).await;

    server
        .hub
        .push(
            "cert-ops",
            &operation_event("op-1", OperationStatus::Started, None),
        )
        .await;
    server
        .hub
        .push(
            "cert-ops",
            &operation_event("op-1", OperationStatus::Complete, None),
        )
        .await;
    wait_for_state(&manager, |state| {
        record_status(state, "op-1") == json!("complete")
    })
    .await;

    manager.reset_operation_after(OPS_KEY, "op-1", Duration::from_millis(50));
    let state = wait_for_state(&manager, |state| {
        record_status(state, "op-1") == json!("idle")
    })
    .await;
    assert_eq!(state[OPS_KEY]["op-1"]["progress"], json!(0));

    manager.shutdown().await;
}
