mod common;

use common::{spawn_session, wait_for_state, MockTransport, RecordingHost};
use pointlink::{LinkState, PointConfig, PointId, PointKind, PointValue, PENDING_LIMIT};
use std::time::Duration;
use tokio::time::Instant;

fn three_points() -> Vec<PointConfig> {
    vec![
        PointConfig::new(1, "plant", PointKind::Analogue, "a"),
        PointConfig::new(2, "plant", PointKind::Digital, "b"),
        PointConfig::new(3, "plant", PointKind::Text, "c"),
    ]
}

#[tokio::test(start_paused = true)]
async fn connect_registers_one_topic_per_point() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    let mut session = spawn_session(three_points(), &transport, &host);

    let status = wait_for_state(&session, LinkState::Online).await;
    assert_eq!(status.last_error, "Connected.");
    assert_eq!(status.subscriptions, 3);
    assert!(status.alarm.is_none());

    let topics = session.topics().await.unwrap();
    assert_eq!(
        topics,
        vec![
            ("a".to_string(), PointId(1)),
            ("b".to_string(), PointId(2)),
            ("c".to_string(), PointId(3)),
        ]
    );
    assert_eq!(transport.subscribed_topics(), vec!["a", "b", "c"]);
    assert_eq!(
        host.status_texts(),
        vec!["Connecting...".to_string(), "Connected.".to_string()]
    );

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_twice_is_harmless() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    let mut session = spawn_session(three_points(), &transport, &host);
    wait_for_state(&session, LinkState::Online).await;

    session.shutdown().await.unwrap();
    assert_eq!(session.status().subscriptions, 0);
    assert_eq!(session.status().state, LinkState::Idle);
    assert_eq!(transport.disconnects(), 1);

    session.shutdown().await.unwrap();
    assert_eq!(session.status().subscriptions, 0);
    assert_eq!(transport.disconnects(), 1);
    assert!(!session.is_running());
}

#[tokio::test(start_paused = true)]
async fn unsolicited_close_goes_offline_and_retries_after_interval() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    let mut session = spawn_session(three_points(), &transport, &host);
    wait_for_state(&session, LinkState::Online).await;

    transport.drop_connection("socket reset").await;
    let status = wait_for_state(&session, LinkState::Offline).await;
    let dropped_at = Instant::now();

    assert_eq!(status.last_error, "Not Connected. Connection Closed");
    assert!(status.retry_armed);
    assert_eq!(
        status.alarm.as_deref(),
        Some("MQTT Error: Offline, Alarm Active.Not Connected. Connection Closed")
    );
    assert!(session.topics().await.unwrap().is_empty());

    let status = wait_for_state(&session, LinkState::Online).await;
    assert!(dropped_at.elapsed() >= Duration::from_secs(10));
    assert_eq!(transport.connects(), 2);
    assert!(status.alarm.is_none());
    assert_eq!(session.topics().await.unwrap().len(), 3);

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_request_while_online_is_ignored() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    let mut session = spawn_session(three_points(), &transport, &host);
    wait_for_state(&session, LinkState::Online).await;

    session.retry_now().await.unwrap();
    // Commands are served in order, so the retry has been handled by now
    assert_eq!(session.topics().await.unwrap().len(), 3);
    assert_eq!(transport.connects(), 1);
    assert_eq!(session.status().state, LinkState::Online);

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_request_while_offline_reconnects_early() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    transport.fail_next_connects(1);
    let mut session = spawn_session(three_points(), &transport, &host);
    wait_for_state(&session, LinkState::Offline).await;
    let failed_at = Instant::now();

    session.retry_now().await.unwrap();
    wait_for_state(&session, LinkState::Online).await;
    assert!(failed_at.elapsed() < Duration::from_secs(10));
    assert_eq!(transport.connects(), 2);

    // The armed timer was cancelled by the early reconnect
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.connects(), 2);

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_during_connect_schedules_a_single_retry() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    transport.close_during_next_connect();
    let mut session = spawn_session(three_points(), &transport, &host);

    let status = wait_for_state(&session, LinkState::Offline).await;
    assert!(status.last_error.contains("Connection closed during connect"));
    assert_eq!(transport.connects(), 1);

    wait_for_state(&session, LinkState::Online).await;
    assert_eq!(transport.connects(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connects(), 2);
    assert_eq!(session.status().state, LinkState::Online);
    assert_eq!(host.alarms_raised(), 1);

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn subscribe_failure_abandons_the_whole_attempt() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    transport.fail_subscribe(Some("b"));
    let mut session = spawn_session(three_points(), &transport, &host);

    let status = wait_for_state(&session, LinkState::Offline).await;
    assert!(status.last_error.contains("Subscribe to 'b' failed"));
    assert!(session.topics().await.unwrap().is_empty());
    assert_eq!(transport.disconnects(), 1);

    transport.fail_subscribe(None);
    let status = wait_for_state(&session, LinkState::Online).await;
    assert_eq!(status.subscriptions, 3);
    assert_eq!(session.topics().await.unwrap().len(), 3);

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_timed_retry_is_reported_and_alarm_raised_once() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    transport.fail_next_connects(2);
    let mut session = spawn_session(three_points(), &transport, &host);

    let status = wait_for_state(&session, LinkState::Offline).await;
    assert_eq!(status.last_error, "Not Connected. Connect error: refused");

    wait_for_state(&session, LinkState::Online).await;
    assert_eq!(transport.connects(), 3);

    let texts = host.status_texts();
    assert!(texts.contains(
        &"Not Connected. Timed retry failed to connect. Connect error: refused".to_string()
    ));
    assert_eq!(host.alarms_raised(), 1);
    assert!(session.status().alarm.is_none());

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_offline_cancels_the_retry() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    transport.fail_next_connects(usize::MAX);
    let mut session = spawn_session(three_points(), &transport, &host);
    wait_for_state(&session, LinkState::Offline).await;

    session.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connects(), 1);
    assert!(!session.status().retry_armed);
}

#[tokio::test(start_paused = true)]
async fn events_from_a_replaced_connection_are_ignored() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    let mut session = spawn_session(three_points(), &transport, &host);
    wait_for_state(&session, LinkState::Online).await;
    let first = transport.live_connection();

    transport.drop_connection("socket reset").await;
    wait_for_state(&session, LinkState::Offline).await;
    wait_for_state(&session, LinkState::Online).await;
    let second = transport.live_connection();
    assert_ne!(first, second);
    assert_eq!(transport.connects(), 2);

    // Late events from the first connection arrive after the reconnect
    transport.close_from(first, "late close").await;
    transport.deliver_from(first, "b", b"1").await;
    assert_eq!(session.topics().await.unwrap().len(), 3);

    let status = session.status();
    assert_eq!(status.state, LinkState::Online);
    assert_eq!(status.messages_received, 0);
    assert!(host.writes().is_empty());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connects(), 2);
    assert_eq!(host.alarms_raised(), 1);

    // The live connection is still handled normally
    transport.close_from(second, "socket reset").await;
    wait_for_state(&session, LinkState::Offline).await;

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_buffer_keeps_the_newest_messages() {
    let transport = MockTransport::new();
    let host = RecordingHost::new();
    let extra = 10;
    for n in 0..PENDING_LIMIT + extra {
        transport.retain("a", &n.to_string());
    }
    let mut session = spawn_session(three_points(), &transport, &host);
    wait_for_state(&session, LinkState::Online).await;

    let entry = session.point(PointId(1)).await.unwrap();
    assert_eq!(
        entry.value,
        Some(PointValue::Analogue((PENDING_LIMIT + extra - 1) as f64))
    );
    let status = session.status();
    assert_eq!(status.messages_received, PENDING_LIMIT as u64);
    let first_kept = host.writes_for(PointId(1))[0].clone();
    assert_eq!(first_kept, PointValue::Analogue(extra as f64));

    session.shutdown().await.unwrap();
}
