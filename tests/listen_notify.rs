mod common;

use std::time::Duration;

use ulid::Ulid;

use common::{add_stage, book, connect, recv_notification, start_test_server};

/// Notifications ride along with the listener's next statement, so poke it.
async fn poll(client: &tokio_postgres::Client) {
    client.simple_query("SELECT * FROM tags").await.unwrap();
}

#[tokio::test]
async fn listen_receives_notification() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;

    let stage = add_stage(&writer, "Main").await;
    listener
        .batch_execute(&format!("LISTEN stage_{stage}"))
        .await
        .unwrap();

    book(&writer, "Opening", stage, "2025-02-20T12:00:00Z", "2025-02-20T15:30:00Z")
        .await
        .unwrap();
    poll(&listener).await;

    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("stage_{stage}"));

    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(payload["kind"], "event_created");
    assert_eq!(payload["stage_id"], stage.to_string());
    assert!(payload["id"].is_string());
}

#[tokio::test]
async fn notification_only_on_subscribed_stage() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;

    let stage_a = add_stage(&writer, "A").await;
    let stage_b = add_stage(&writer, "B").await;
    listener
        .batch_execute(&format!("LISTEN stage_{stage_a}"))
        .await
        .unwrap();

    book(&writer, "B side", stage_b, "2025-02-20T12:00:00Z", "2025-02-20T13:00:00Z")
        .await
        .unwrap();
    poll(&listener).await;
    assert!(
        recv_notification(&mut rx, Duration::from_millis(300)).await.is_none(),
        "should not receive notification for unsubscribed stage"
    );

    book(&writer, "A side", stage_a, "2025-02-20T12:00:00Z", "2025-02-20T13:00:00Z")
        .await
        .unwrap();
    poll(&listener).await;
    assert!(recv_notification(&mut rx, Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn rejected_booking_does_not_notify() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;

    let stage = add_stage(&writer, "Main").await;
    book(&writer, "Opening", stage, "2025-02-20T12:00:00Z", "2025-02-20T15:30:00Z")
        .await
        .unwrap();
    listener
        .batch_execute(&format!("LISTEN stage_{stage}"))
        .await
        .unwrap();

    assert!(
        book(&writer, "Clash", stage, "2025-02-20T15:00:00Z", "2025-02-20T16:00:00Z")
            .await
            .is_err()
    );
    poll(&listener).await;
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_duplicate_is_idempotent() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;

    let stage = add_stage(&writer, "Main").await;
    for _ in 0..2 {
        listener
            .batch_execute(&format!("LISTEN stage_{stage}"))
            .await
            .unwrap();
    }

    book(&writer, "Once", stage, "2025-02-20T12:00:00Z", "2025-02-20T13:00:00Z")
        .await
        .unwrap();
    poll(&listener).await;

    assert!(recv_notification(&mut rx, Duration::from_secs(5)).await.is_some());
    poll(&listener).await;
    assert!(
        recv_notification(&mut rx, Duration::from_millis(300)).await.is_none(),
        "should not receive duplicate notification"
    );
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;

    let stage = add_stage(&writer, "Main").await;
    listener
        .batch_execute(&format!("LISTEN stage_{stage}"))
        .await
        .unwrap();
    listener
        .batch_execute(&format!("UNLISTEN stage_{stage}"))
        .await
        .unwrap();

    book(&writer, "Quiet", stage, "2025-02-20T12:00:00Z", "2025-02-20T13:00:00Z")
        .await
        .unwrap();
    poll(&listener).await;
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn unlisten_all_stops_everything() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;

    let stage_a = add_stage(&writer, "A").await;
    let stage_b = add_stage(&writer, "B").await;
    for stage in [stage_a, stage_b] {
        listener
            .batch_execute(&format!("LISTEN stage_{stage}"))
            .await
            .unwrap();
    }
    listener.batch_execute("UNLISTEN *").await.unwrap();

    book(&writer, "A", stage_a, "2025-02-20T12:00:00Z", "2025-02-20T13:00:00Z")
        .await
        .unwrap();
    book(&writer, "B", stage_b, "2025-02-20T12:00:00Z", "2025-02-20T13:00:00Z")
        .await
        .unwrap();
    poll(&listener).await;
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn update_notifies_with_the_channel_stage() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (writer, _) = connect(addr).await;

    let stage = add_stage(&writer, "Main").await;
    let id = Ulid::new();
    writer
        .batch_execute(&format!(
            r#"INSERT INTO events (id, name, stage_id, start, "end") VALUES ('{id}', 'Opening', '{stage}', '2025-02-20T12:00:00Z', '2025-02-20T13:00:00Z')"#
        ))
        .await
        .unwrap();
    listener
        .batch_execute(&format!("LISTEN stage_{stage}"))
        .await
        .unwrap();

    // A rename keeps the stage; the payload still names it.
    writer
        .batch_execute(&format!("UPDATE events SET name = 'Renamed' WHERE id = '{id}'"))
        .await
        .unwrap();
    writer
        .batch_execute(&format!("DELETE FROM events WHERE id = '{id}'"))
        .await
        .unwrap();
    poll(&listener).await;

    for kind in ["event_updated", "event_deleted"] {
        let notif = recv_notification(&mut rx, Duration::from_secs(5))
            .await
            .expect("expected notification");
        let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
        assert_eq!(payload["kind"], kind);
        assert_eq!(payload["id"], id.to_string());
        assert_eq!(payload["stage_id"], stage.to_string());
    }
}

#[tokio::test]
async fn bad_channel_is_rejected() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    assert!(client.batch_execute("LISTEN resource_x").await.is_err());
    assert!(client.batch_execute("LISTEN stage_nope").await.is_err());
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _tm) = start_test_server().await;
    let (listener, rx) = connect(addr).await;
    let stage = add_stage(&listener, "Main").await;
    listener
        .batch_execute(&format!("LISTEN stage_{stage}"))
        .await
        .unwrap();
    drop(listener);
    drop(rx);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Writers are unaffected by the dropped subscriber.
    let (writer, _) = connect(addr).await;
    book(&writer, "After", stage, "2025-02-20T12:00:00Z", "2025-02-20T13:00:00Z")
        .await
        .unwrap();
}
