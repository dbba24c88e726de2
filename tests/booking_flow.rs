use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use tally::tenant::TenantManager;
use tally::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tally_int_test_{}", Ulid::new()));
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

async fn connect(addr: SocketAddr, db: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("tally")
        .password("tally");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
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

async fn balance_of(client: &tokio_postgres::Client, account: Ulid) -> String {
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM balance WHERE account_id = '{account}'"))
            .await
            .unwrap(),
    );
    rows[0].get("balance").unwrap().to_string()
}

async fn remaining_of(client: &tokio_postgres::Client, account: Ulid) -> Option<String> {
    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM subscriptions WHERE account_id = '{account}'"
            ))
            .await
            .unwrap(),
    );
    rows[0].get("remaining").map(str::to_string)
}

fn book_with_price(id: Ulid, account: Ulid, resource: Ulid, start: &str, end: &str, price: &str) -> String {
    format!(
        "INSERT INTO bookings (id, account_id, resource_id, date, start, \"end\", subscription_id, price) \
         VALUES ('{id}', '{account}', '{resource}', '2024-06-01', '{start}', '{end}', NULL, {price})"
    )
}

fn book_with_sub(id: Ulid, account: Ulid, resource: Ulid, start: &str, end: &str, sub: Ulid) -> String {
    format!(
        "INSERT INTO bookings (id, account_id, resource_id, date, start, \"end\", subscription_id) \
         VALUES ('{id}', '{account}', '{resource}', '2024-06-01', '{start}', '{end}', '{sub}')"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn capture_is_idempotent_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    client
        .batch_execute(&format!(
            "INSERT INTO payments (id, account_id, method, amount, external_reference) \
             VALUES ('{}', '{account}', 'card', 25.00, 'pay_1')",
            Ulid::new()
        ))
        .await
        .unwrap();

    // Same provider reference again, new payment row id.
    let err = client
        .batch_execute(&format!(
            "INSERT INTO payments (id, account_id, method, amount, external_reference) \
             VALUES ('{}', '{account}', 'card', 25.00, 'pay_1')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));

    assert_eq!(balance_of(&client, account).await, "25.00");
    let ledger = data_rows(
        client
            .simple_query(&format!("SELECT * FROM ledger WHERE account_id = '{account}'"))
            .await
            .unwrap(),
    );
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].get("cause"), Some("top_up"));

    let payments = data_rows(
        client
            .simple_query(&format!("SELECT * FROM payments WHERE account_id = '{account}'"))
            .await
            .unwrap(),
    );
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].get("external_reference"), Some("pay_1"));
    assert_eq!(payments[0].get("status"), Some("completed"));
}

#[tokio::test]
async fn booking_conflict_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    capture_payment(&client, account, "60.00").await;
    let coach = Ulid::new();

    client
        .batch_execute(&book_with_price(Ulid::new(), account, coach, "10:00", "11:00", "20.00"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&book_with_price(Ulid::new(), account, coach, "10:30", "11:30", "20.00"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    // Back-to-back with the first hour is allowed.
    client
        .batch_execute(&book_with_price(Ulid::new(), account, coach, "11:00", "12:00", "20.00"))
        .await
        .unwrap();

    let slots = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM slots WHERE resource_id = '{coach}' AND date = '2024-06-01'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].get("start"), Some("10:00"));
    assert_eq!(slots[1].get("start"), Some("11:00"));

    assert_eq!(balance_of(&client, account).await, "20.00");
}

#[tokio::test]
async fn pack_lifecycle_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    let sub = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO subscriptions (id, account_id, plan, sessions) \
             VALUES ('{sub}', '{account}', 'session_pack', 3)"
        ))
        .await
        .unwrap();
    assert_eq!(remaining_of(&client, account).await.as_deref(), Some("3"));

    let coach = Ulid::new();
    for (start, end) in [("09:00", "10:00"), ("10:00", "11:00"), ("11:00", "12:00")] {
        client
            .batch_execute(&book_with_sub(Ulid::new(), account, coach, start, end, sub))
            .await
            .unwrap();
    }
    assert_eq!(remaining_of(&client, account).await.as_deref(), Some("0"));

    let err = client
        .batch_execute(&book_with_sub(Ulid::new(), account, coach, "12:00", "13:00", sub))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));

    let sessions = data_rows(
        client
            .simple_query(&format!("SELECT * FROM sessions WHERE account_id = '{account}'"))
            .await
            .unwrap(),
    );
    assert_eq!(sessions.len(), 3);
    assert_eq!(sessions[0].get("status"), Some("scheduled"));

    // Attending consumes the pack unit for good: no refund, slot stays taken.
    let first = sessions[0].get("id").unwrap();
    client
        .batch_execute(&format!("UPDATE sessions SET status = 'attended' WHERE id = '{first}'"))
        .await
        .unwrap();
    let sessions = data_rows(
        client
            .simple_query(&format!("SELECT * FROM sessions WHERE account_id = '{account}'"))
            .await
            .unwrap(),
    );
    assert_eq!(sessions[0].get("status"), Some("attended"));
    assert_eq!(sessions[1].get("status"), Some("scheduled"));
    assert_eq!(remaining_of(&client, account).await.as_deref(), Some("0"));
}

#[tokio::test]
async fn missed_session_refund_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    let sub = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO subscriptions (id, account_id, plan, sessions) \
             VALUES ('{sub}', '{account}', 'session_pack', 3)"
        ))
        .await
        .unwrap();

    let coach = Ulid::new();
    let session = Ulid::new();
    client
        .batch_execute(&book_with_sub(session, account, coach, "10:00", "11:00", sub))
        .await
        .unwrap();
    assert_eq!(remaining_of(&client, account).await.as_deref(), Some("2"));

    client
        .batch_execute(&format!("UPDATE sessions SET status = 'missed' WHERE id = '{session}'"))
        .await
        .unwrap();
    assert_eq!(remaining_of(&client, account).await.as_deref(), Some("3"));

    // Reporting the same no-show twice must not refund twice.
    let err = client
        .batch_execute(&format!("UPDATE sessions SET status = 'missed' WHERE id = '{session}'"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
    assert_eq!(remaining_of(&client, account).await.as_deref(), Some("3"));

    // Missed sessions keep the slot; the conflict query still reports it.
    let conflicts = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM conflicts WHERE resource_id = '{coach}' AND date = '2024-06-01' \
                 AND start = '10:30' AND \"end\" = '11:30'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].get("session_id"), Some(session.to_string().as_str()));
}

#[tokio::test]
async fn cancellation_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    capture_payment(&client, account, "50.00").await;
    let coach = Ulid::new();
    let session = Ulid::new();

    client
        .batch_execute(&book_with_price(session, account, coach, "10:00", "11:00", "20.00"))
        .await
        .unwrap();
    assert_eq!(balance_of(&client, account).await, "30.00");

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{session}'"))
        .await
        .unwrap();
    assert_eq!(balance_of(&client, account).await, "50.00");

    let slots = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM slots WHERE resource_id = '{coach}' AND date = '2024-06-01'"
            ))
            .await
            .unwrap(),
    );
    assert!(slots.is_empty());

    // The hour can be sold again.
    client
        .batch_execute(&book_with_price(Ulid::new(), account, coach, "10:00", "11:00", "20.00"))
        .await
        .unwrap();
}

#[tokio::test]
async fn subscription_status_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    let sub = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO subscriptions (id, account_id, plan, ends_at) \
             VALUES ('{sub}', '{account}', 'annual', '2030-01-01')"
        ))
        .await
        .unwrap();

    client
        .batch_execute(&format!(
            "UPDATE subscriptions SET status = 'cancelled' WHERE id = '{sub}'"
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            "UPDATE subscriptions SET status = 'cancelled' WHERE id = '{sub}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));

    // A cancelled plan no longer funds bookings.
    let err = client
        .batch_execute(&book_with_sub(Ulid::new(), account, Ulid::new(), "10:00", "11:00", sub))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
}

#[tokio::test]
async fn referral_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let referrer = open_account(&client).await;
    let referred = open_account(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO referral_bonuses (referrer_account_id, referred_account_id, amount) \
             VALUES ('{referrer}', '{referred}', 5.00)"
        ))
        .await
        .unwrap();

    assert_eq!(balance_of(&client, referrer).await, "5.00");
    assert_eq!(balance_of(&client, referred).await, "5.00");
}

#[tokio::test]
async fn tenant_isolation_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let alpha = connect(addr, "studio_alpha").await;
    let beta = connect(addr, "studio_beta").await;

    let account = open_account(&alpha).await;
    capture_payment(&alpha, account, "25.00").await;

    // The same account id does not exist in the other tenant.
    let err = beta
        .simple_query(&format!("SELECT * FROM balance WHERE account_id = '{account}'"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NO_DATA_FOUND));

    // And can be opened there independently.
    beta.batch_execute(&format!("INSERT INTO accounts (id) VALUES ('{account}')"))
        .await
        .unwrap();
    assert_eq!(balance_of(&beta, account).await, "0.00");
    assert_eq!(balance_of(&alpha, account).await, "25.00");
}

#[tokio::test]
async fn error_codes_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let ghost = Ulid::new();
    let err = client
        .simple_query(&format!("SELECT * FROM balance WHERE account_id = '{ghost}'"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NO_DATA_FOUND));

    let err = client.batch_execute("FROBNICATE THE LEDGER").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let err = client.batch_execute("LISTEN not_a_channel").await.unwrap_err();
    assert_eq!(
        err.code(),
        Some(&SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION)
    );

    let account = open_account(&client).await;
    let err = client
        .batch_execute(&format!(
            "INSERT INTO adjustments (account_id, direction, amount, admin_id) \
             VALUES ('{account}', 'debit', 9.00, '{}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
}

#[tokio::test]
async fn listen_ack_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    let coach = Ulid::new();

    client
        .batch_execute(&format!("LISTEN account_{account}"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("LISTEN resource_{coach}"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UNLISTEN account_{account}"))
        .await
        .unwrap();
    client.batch_execute("UNLISTEN *").await.unwrap();
}

#[tokio::test]
async fn status_and_audit_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    capture_payment(&client, account, "40.00").await;
    client
        .batch_execute(&format!(
            "INSERT INTO adjustments (account_id, direction, amount, admin_id, note) \
             VALUES ('{account}', 'debit', 15.00, '{}', 'chargeback')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let audit = data_rows(
        client
            .simple_query(&format!("SELECT * FROM audit WHERE account_id = '{account}'"))
            .await
            .unwrap(),
    );
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].get("consistent"), Some("t"));
    assert_eq!(audit[0].get("entries"), Some("2"));
    assert_eq!(audit[0].get("live_balance"), Some("25.00"));
    assert_eq!(audit[0].get("replayed_balance"), Some("25.00"));

    let accounts = data_rows(client.simple_query("SELECT * FROM accounts").await.unwrap());
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].get("account_id"), Some(account.to_string().as_str()));
    assert_eq!(accounts[0].get("balance"), Some("25.00"));
    assert_eq!(accounts[0].get("entries"), Some("2"));
    assert_eq!(accounts[0].get("payments"), Some("1"));

    let status = data_rows(client.simple_query("SELECT * FROM status").await.unwrap());
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].get("accounts"), Some("1"));
    assert_eq!(status[0].get("sessions"), Some("0"));
}

#[tokio::test]
async fn extended_protocol_binds_params() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr, "test").await;

    let account = open_account(&client).await;
    capture_payment(&client, account, "25.00").await;

    let rows = client
        .query(
            "SELECT * FROM balance WHERE account_id = $1",
            &[&account.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let balance: &str = rows[0].get("balance");
    assert_eq!(balance, "25.00");
}
