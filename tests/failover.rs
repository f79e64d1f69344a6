//! Session failover behavior over a fake network.
//!
//! Runs on paused time: the reconnect backoff, health-check window and
//! heartbeat timers elapse instantly whenever every task is idle.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use common::{harness, harness_with, url, FALLBACK};
use uplink_proxy::registry::Tier;
use uplink_proxy::supervisor::{BackendAction, ClientFrame, SupervisorSettings};

const UPGRADE: &str = r#"{"__api":"upgrade"}"#;

#[tokio::test(start_paused = true)]
async fn test_buffered_messages_flush_in_order() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    assert_eq!(a.endpoint, url("ws://a.test/"));
    assert_eq!(a.forwarded_for, "198.51.100.20");

    client.send("m1");
    client.send("m2");
    client.send("m3");

    let sessions = h.supervisor.list_sessions(true).await;
    let snapshot = serde_json::to_value(&sessions[0]).unwrap();
    assert_eq!(snapshot["queue"], json!(["m1", "m2", "m3"]));

    assert!(a.handshake().await.is_empty());
    assert_eq!(a.recv_text().await, "m1");
    assert_eq!(a.recv_text().await, "m2");
    assert_eq!(a.recv_text().await, "m3");

    let sessions = h.supervisor.list_sessions(false).await;
    let snapshot = serde_json::to_value(&sessions[0]).unwrap();
    assert_eq!(snapshot["queue"], 0);
    assert_eq!(snapshot["state"]["endpoint"], "ws://a.test/");

    a.send_text(r#"{"result":"ok"}"#);
    assert_eq!(client.recv_text().await, r#"{"result":"ok"}"#);
}

#[tokio::test(start_paused = true)]
async fn test_state_request_is_answered_locally() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;

    let state = client.state().await;
    assert_eq!(state["endpoint"], "ws://a.test/");
    assert_eq!(state["preferredServer"], "ws://a.test/");
    assert_eq!(state["tier"], "basic");
    assert_eq!(state["uplinkCount"], 1);
    assert_eq!(state["counters"]["txCount"], 1);
    assert_eq!(state["headers"]["origin"], "https://wallet.example");

    // The next frame the backend sees is the client's, not the state request.
    client.send("after-state");
    assert_eq!(a.recv_text().await, "after-state");
}

#[tokio::test(start_paused = true)]
async fn test_older_candidate_is_discarded_after_newer_promotion() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/"), (Tier::Priority, "ws://b.test/")]);
    let mut client = h.connect();

    let mut a = h.backends.next().await;
    a.mute();
    a.await_connection_test().await;

    client.send(UPGRADE);
    let mut b = h.backends.next().await;
    assert_eq!(b.endpoint, url("ws://b.test/"));
    b.handshake().await;

    let state = client.state().await;
    assert_eq!(state["endpoint"], "ws://b.test/");
    assert_eq!(state["uplinkCount"], 2);

    // The older attempt passes its health check too late.
    a.ack();
    a.send_text("stale push");
    a.closed().await;

    b.send_text("fresh push");
    assert_eq!(client.recv_text().await, "fresh push");

    let state = client.state().await;
    assert_eq!(state["endpoint"], "ws://b.test/");
    assert_eq!(state["counters"]["reconnects"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_upstream_counts_error_and_reconnects_once() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    let mut client = h.connect();
    let mut a1 = h.backends.next().await;
    a1.handshake().await;
    assert_eq!(client.state().await["endpoint"], "ws://a.test/");

    let lost_at = Instant::now();
    drop(a1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.send("during outage");

    let mut a2 = h.backends.next().await;
    assert!(lost_at.elapsed() >= Duration::from_secs(2));
    assert_eq!(a2.endpoint, url("ws://a.test/"));
    assert_eq!(h.backend("ws://a.test/").error_count, 1);

    a2.handshake().await;
    assert_eq!(a2.recv_text().await, "during outage");

    let state = client.state().await;
    assert_eq!(state["endpoint"], "ws://a.test/");
    assert_eq!(state["uplinkCount"], 2);
    assert_eq!(state["counters"]["reconnects"], 1);

    h.backends.expect_none(Duration::from_secs(30)).await;
    assert_eq!(h.backend("ws://a.test/").error_count, 1);
    assert!(h.backend("ws://a.test/").healthy);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connect_retries_after_backoff() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    h.connector.refuse("ws://a.test/");
    let started = Instant::now();
    let mut client = h.connect();

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.connector.accept("ws://a.test/");

    let mut a = h.backends.next().await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(h.backend("ws://a.test/").error_count, 1);

    a.handshake().await;
    let state = client.state().await;
    assert_eq!(state["endpoint"], "ws://a.test/");
    assert_eq!(state["counters"]["reconnects"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_replayed_on_new_upstream() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    let mut client = h.connect();
    let mut a1 = h.backends.next().await;
    a1.handshake().await;

    client.send(r#"{"id":1,"command":"subscribe","streams":["ledger"]}"#);
    client.send(r#"{"id":2,"command":"subscribe","streams":["ledger"]}"#);
    client.send(r#"{"id":3,"command":"subscribe","accounts":["rExampleAccount"]}"#);
    for _ in 0..3 {
        a1.recv_text().await;
    }

    drop(a1);
    let mut a2 = h.backends.next().await;
    let replayed: Vec<Value> = a2
        .handshake()
        .await
        .iter()
        .map(|frame| serde_json::from_str(frame).unwrap())
        .collect();

    assert_eq!(
        replayed,
        vec![
            json!({"id": "REPLAYED_SUBSCRIPTION", "command": "subscribe", "streams": ["ledger"]}),
            json!({"id": "REPLAYED_SUBSCRIPTION", "command": "subscribe", "accounts": ["rExampleAccount"]}),
        ]
    );

    let sessions = h.supervisor.list_sessions(false).await;
    assert_eq!(serde_json::to_value(&sessions[0]).unwrap()["subscriptions"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_tier_switch_keeps_buffer() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/"), (Tier::Priority, "ws://p.test/")]);
    let mut client = h.connect();

    let mut a = h.backends.next().await;
    a.mute();
    a.await_connection_test().await;

    client.send("m1");
    client.send("m2");
    client.send(UPGRADE);
    client.send("m3");

    let mut p = h.backends.next().await;
    assert_eq!(p.endpoint, url("ws://p.test/"));
    p.handshake().await;
    assert_eq!(p.recv_text().await, "m1");
    assert_eq!(p.recv_text().await, "m2");
    assert_eq!(p.recv_text().await, "m3");

    let state = client.state().await;
    assert_eq!(state["tier"], "priority");
    assert_eq!(state["endpoint"], "ws://p.test/");

    // The abandoned attempt times out without triggering another reconnect.
    a.closed().await;
    h.backends.expect_none(Duration::from_secs(30)).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_health_check_keeps_active_upstream() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/"), (Tier::Priority, "ws://p.test/")]);
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;

    client.send(UPGRADE);
    let mut p = h.backends.next().await;
    p.mute();
    p.await_connection_test().await;
    p.closed().await;

    let state = client.state().await;
    assert_eq!(state["endpoint"], "ws://a.test/");
    assert_eq!(state["tier"], "priority");
    assert_eq!(state["counters"]["reconnects"], 0);

    client.send("still here");
    assert_eq!(a.recv_text().await, "still here");

    h.backends.expect_none(Duration::from_secs(30)).await;
    assert_eq!(h.backend("ws://p.test/").error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_admin_migrate_moves_bound_sessions() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;
    assert_eq!(client.state().await["endpoint"], "ws://a.test/");

    let b = h.supervisor.add_backend(Tier::Basic, "ws://b.test").unwrap();
    assert!(!b.healthy);
    h.supervisor.set_backend_health(&b.id, true).unwrap();

    let a_id = h.backend("ws://a.test/").id;
    let report = h.supervisor.on_admin_action(&a_id, BackendAction::Migrate).await.unwrap();
    assert_eq!(report.migrated, vec![client.id()]);
    assert!(!report.backend.healthy);

    let mut b_conn = h.backends.next().await;
    assert_eq!(b_conn.endpoint, url("ws://b.test/"));
    b_conn.handshake().await;
    a.closed().await;

    let state = client.state().await;
    assert_eq!(state["endpoint"], "ws://b.test/");
    assert_eq!(state["counters"]["reconnects"], 0);
    assert_eq!(h.backend("ws://a.test/").error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_when_tier_has_no_healthy_backend() {
    let mut h = harness(&[]);
    h.registry.register(Tier::Basic, url("ws://a.test/"), false).unwrap();

    let mut client = h.connect();
    let mut fallback = h.backends.next().await;
    assert_eq!(fallback.endpoint, url(FALLBACK));
    fallback.handshake().await;

    assert_eq!(client.state().await["endpoint"], FALLBACK);
}

#[tokio::test(start_paused = true)]
async fn test_client_close_stops_reconnects() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;
    client.state().await;

    client.close();
    a.closed().await;

    h.backends.expect_none(Duration::from_secs(30)).await;
    assert_eq!(h.supervisor.session_count(), 0);
    assert_eq!(h.backend("ws://a.test/").error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_admin_kill_closes_client() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;

    assert!(h.supervisor.kill_session(client.id()));
    assert_eq!(client.next_frame().await, Some(ClientFrame::Close));
    assert_eq!(client.next_frame().await, None);
    a.closed().await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!h.supervisor.kill_session(client.id()));
    assert!(h.supervisor.list_sessions(false).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_client_close_during_health_check() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/")]);
    let client = h.connect();
    let mut a = h.backends.next().await;
    a.mute();
    a.await_connection_test().await;

    client.close();
    a.closed().await;

    h.backends.expect_none(Duration::from_secs(30)).await;
    assert_eq!(h.supervisor.session_count(), 0);
    assert_eq!(h.backend("ws://a.test/").error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_is_disconnected() {
    let mut h = harness_with(&[(Tier::Basic, "ws://a.test/")], SupervisorSettings::default());
    let started = Instant::now();
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;

    assert_eq!(client.recv_frame().await, Some(ClientFrame::Ping));
    assert_eq!(started.elapsed().as_secs(), 15);
    assert_eq!(client.recv_frame().await, Some(ClientFrame::Ping));
    assert_eq!(started.elapsed().as_secs(), 30);

    // The deadline armed by the first ping is not pushed back by the second.
    // A third ping falls due at the same instant and may be written first.
    let frame = loop {
        match client.recv_frame().await {
            Some(ClientFrame::Ping) => assert_eq!(started.elapsed().as_secs(), 45),
            other => break other,
        }
    };
    assert_eq!(frame, Some(ClientFrame::Close));
    assert_eq!(started.elapsed().as_secs(), 45);
    assert_eq!(client.recv_frame().await, None);
    a.closed().await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.supervisor.session_count(), 0);
    assert_eq!(h.backend("ws://a.test/").error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pong_keeps_client_alive() {
    let mut h = harness_with(&[(Tier::Basic, "ws://a.test/")], SupervisorSettings::default());
    let started = Instant::now();
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;

    for _ in 0..6 {
        assert_eq!(client.recv_frame().await, Some(ClientFrame::Ping));
        client.pong();
    }
    assert_eq!(started.elapsed().as_secs(), 90);

    assert_eq!(client.state().await["endpoint"], "ws://a.test/");
    assert_eq!(h.supervisor.session_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_sent_during_health_check_is_replayed_at_promotion() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/"), (Tier::Priority, "ws://p.test/")]);
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;

    client.send(UPGRADE);
    let mut p = h.backends.next().await;
    p.mute();
    assert!(p.await_connection_test().await.is_empty());

    // Still relayed to the active upstream while the candidate is checked.
    let subscribe = r#"{"id":9,"command":"subscribe","streams":["ledger"]}"#;
    client.send(subscribe);
    assert_eq!(a.recv_text().await, subscribe);

    p.ack();
    let replayed: Value = serde_json::from_str(&p.recv_text().await).unwrap();
    assert_eq!(
        replayed,
        json!({"id": "REPLAYED_SUBSCRIPTION", "command": "subscribe", "streams": ["ledger"]})
    );

    client.send("after promotion");
    assert_eq!(p.recv_text().await, "after promotion");
    a.closed().await;
}

#[tokio::test(start_paused = true)]
async fn test_migrate_cancels_candidate_for_endpoint() {
    let mut h = harness(&[(Tier::Basic, "ws://a.test/"), (Tier::Priority, "ws://p.test/")]);
    let mut client = h.connect();
    let mut a = h.backends.next().await;
    a.handshake().await;

    client.send(UPGRADE);
    let mut p = h.backends.next().await;
    p.mute();
    p.await_connection_test().await;

    let p_id = h.backend("ws://p.test/").id;
    let report = h.supervisor.force_migrate(&p_id).await.unwrap();
    assert_eq!(report.migrated, vec![client.id()]);

    // No healthy priority backend is left.
    let mut fallback = h.backends.next().await;
    assert_eq!(fallback.endpoint, url(FALLBACK));

    // The candidate passing its check now is too late to be promoted.
    p.ack();
    p.closed().await;

    fallback.handshake().await;
    let state = client.state().await;
    assert_eq!(state["endpoint"], FALLBACK);
    assert_eq!(state["tier"], "priority");
    a.closed().await;
}
