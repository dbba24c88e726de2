use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use tally::tenant::TenantManager;
use tally::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tally_notify_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, 0, CancellationToken::new()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "tally".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

/// Connect and pump the connection's async messages into a channel, so tests
/// can await notifications while the client issues queries.
async fn connect(
    addr: SocketAddr,
    db: &str,
) -> (tokio_postgres::Client, UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("tally")
        .password("tally");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
    (client, rx)
}

async fn recv_notification(
    rx: &mut UnboundedReceiver<Notification>,
    ms: u64,
) -> Option<Notification> {
    timeout(Duration::from_millis(ms), rx.recv()).await.ok().flatten()
}

async fn open_account(client: &tokio_postgres::Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO accounts (id) VALUES ('{id}')"))
        .await
        .unwrap();
    id
}

async fn capture_payment(client: &tokio_postgres::Client, account: Ulid, amount: &str) {
    let pid = Ulid::new();
    let reference = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO payments (id, account_id, method, amount, external_reference) \
             VALUES ('{pid}', '{account}', 'card', {amount}, 'ref_{reference}')"
        ))
        .await
        .unwrap();
}

fn book_with_price(account: Ulid, resource: Ulid, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO bookings (id, account_id, resource_id, date, start, \"end\", subscription_id, price) \
         VALUES ('{}', '{account}', '{resource}', '2024-06-01', '{start}', '{end}', NULL, 10.00)",
        Ulid::new()
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn listen_receives_notification() {
    let (addr, _tm) = start_test_server().await;
    let (subscriber, mut notifications) = connect(addr, "test").await;
    let (mutator, _rx) = connect(addr, "test").await;

    let account = open_account(&mutator).await;
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();

    capture_payment(&mutator, account, "25.00").await;

    let notif = recv_notification(&mut notifications, 2_000)
        .await
        .expect("subscriber should be notified of the capture");
    assert_eq!(notif.channel(), format!("account_{account}"));
    assert!(!notif.payload().is_empty());
}

#[tokio::test]
async fn notification_payload_is_valid_json() {
    let (addr, _tm) = start_test_server().await;
    let (subscriber, mut notifications) = connect(addr, "test").await;
    let (mutator, _rx) = connect(addr, "test").await;

    let account = open_account(&mutator).await;
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();

    capture_payment(&mutator, account, "25.00").await;

    let notif = recv_notification(&mut notifications, 2_000)
        .await
        .expect("notification");
    let value: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert!(value.is_object());
}

#[tokio::test]
async fn notification_only_for_subscribed_channel() {
    let (addr, _tm) = start_test_server().await;
    let (subscriber, mut notifications) = connect(addr, "test").await;
    let (mutator, _rx) = connect(addr, "test").await;

    let account = open_account(&mutator).await;
    capture_payment(&mutator, account, "60.00").await;
    let watched = Ulid::new();
    let other = Ulid::new();
    subscriber
        .batch_execute(&format!("LISTEN resource_{watched}"))
        .await
        .unwrap();

    // A booking on some other resource is none of this subscriber's business.
    mutator
        .batch_execute(&book_with_price(account, other, "10:00", "11:00"))
        .await
        .unwrap();
    assert!(recv_notification(&mut notifications, 500).await.is_none());

    mutator
        .batch_execute(&book_with_price(account, watched, "10:00", "11:00"))
        .await
        .unwrap();
    let notif = recv_notification(&mut notifications, 2_000)
        .await
        .expect("booking on the watched resource should notify");
    assert_eq!(notif.channel(), format!("resource_{watched}"));
}

#[tokio::test]
async fn listen_twice_delivers_once() {
    let (addr, _tm) = start_test_server().await;
    let (subscriber, mut notifications) = connect(addr, "test").await;
    let (mutator, _rx) = connect(addr, "test").await;

    let account = open_account(&mutator).await;
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();

    capture_payment(&mutator, account, "25.00").await;

    assert!(recv_notification(&mut notifications, 2_000).await.is_some());
    // The repeated LISTEN must not have doubled the delivery.
    assert!(recv_notification(&mut notifications, 500).await.is_none());
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (subscriber, mut notifications) = connect(addr, "test").await;
    let (mutator, _rx) = connect(addr, "test").await;

    let account = open_account(&mutator).await;
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();
    capture_payment(&mutator, account, "25.00").await;
    assert!(recv_notification(&mut notifications, 2_000).await.is_some());

    subscriber
        .batch_execute(&format!("UNLISTEN account_{account}"))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    capture_payment(&mutator, account, "25.00").await;
    assert!(recv_notification(&mut notifications, 500).await.is_none());
}

#[tokio::test]
async fn unlisten_all_stops_everything() {
    let (addr, _tm) = start_test_server().await;
    let (subscriber, mut notifications) = connect(addr, "test").await;
    let (mutator, _rx) = connect(addr, "test").await;

    let account = open_account(&mutator).await;
    // Funds the booking below; fires before anyone subscribes.
    capture_payment(&mutator, account, "60.00").await;
    let coach = Ulid::new();
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();
    subscriber
        .batch_execute(&format!("LISTEN resource_{coach}"))
        .await
        .unwrap();

    subscriber.batch_execute("UNLISTEN *").await.unwrap();
    sleep(Duration::from_millis(100)).await;

    capture_payment(&mutator, account, "25.00").await;
    mutator
        .batch_execute(&book_with_price(account, coach, "10:00", "11:00"))
        .await
        .unwrap();
    assert!(recv_notification(&mut notifications, 500).await.is_none());
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _tm) = start_test_server().await;
    let (mutator, _rx) = connect(addr, "test").await;
    let account = open_account(&mutator).await;

    {
        let (subscriber, notifications) = connect(addr, "test").await;
        subscriber
            .batch_execute(&format!("LISTEN account_{account}"))
            .await
            .unwrap();
        drop(notifications);
        drop(subscriber);
    }
    sleep(Duration::from_millis(200)).await;

    // The hub keeps serving mutations and fresh subscribers after the old
    // connection went away mid-LISTEN.
    capture_payment(&mutator, account, "25.00").await;

    let (subscriber, mut notifications) = connect(addr, "test").await;
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();
    capture_payment(&mutator, account, "25.00").await;
    assert!(recv_notification(&mut notifications, 2_000).await.is_some());
}

#[tokio::test]
async fn each_event_notifies_once() {
    let (addr, _tm) = start_test_server().await;
    let (subscriber, mut notifications) = connect(addr, "test").await;
    let (mutator, _rx) = connect(addr, "test").await;

    let account = open_account(&mutator).await;
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();

    for _ in 0..3 {
        capture_payment(&mutator, account, "25.00").await;
    }

    let mut received = 0;
    while recv_notification(&mut notifications, 2_000).await.is_some() {
        received += 1;
        if received == 3 {
            break;
        }
    }
    assert_eq!(received, 3);
    assert!(recv_notification(&mut notifications, 300).await.is_none());
}

#[tokio::test]
async fn notification_while_subscriber_idles() {
    // The subscriber issues no further queries after LISTEN; the push must
    // arrive on its own rather than piggyback on a round trip.
    let (addr, _tm) = start_test_server().await;
    let (subscriber, mut notifications) = connect(addr, "test").await;
    let (mutator, _rx) = connect(addr, "test").await;

    let account = open_account(&mutator).await;
    subscriber
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    capture_payment(&mutator, account, "25.00").await;

    let notif = recv_notification(&mut notifications, 2_000)
        .await
        .expect("push should arrive without the subscriber polling");
    assert_eq!(notif.channel(), format!("account_{account}"));
}
