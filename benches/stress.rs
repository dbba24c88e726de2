use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("tally")
        .password("tally");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Days::new(offset)
}

async fn open_funded_account(client: &tokio_postgres::Client, amount: &str) -> Ulid {
    let account = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO accounts (id) VALUES ('{account}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO payments (id, account_id, method, amount, external_reference) \
             VALUES ('{}', '{account}', 'card', {amount}, 'fund_{}')",
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap();
    account
}

/// Books hour `i % 24` on day `i / 24`, so long runs spread over many slot pages.
async fn book_hour(client: &tokio_postgres::Client, account: Ulid, coach: Ulid, i: u64) {
    let h = i % 24;
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, account_id, resource_id, date, start, \"end\", subscription_id, price) \
             VALUES ('{}', '{account}', '{coach}', '{}', '{h:02}:00', '{:02}:00', NULL, 2.00)",
            Ulid::new(),
            day(i / 24),
            h + 1
        ))
        .await
        .unwrap();
}

async fn phase1_sequential_captures(host: &str, port: u16) {
    let client = connect(host, port).await;
    let account = open_funded_account(&client, "1.00").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for _ in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&format!(
                "INSERT INTO payments (id, account_id, method, amount, external_reference) \
                 VALUES ('{}', '{account}', 'card', 5.00, 'cap_{}')",
                Ulid::new(),
                Ulid::new()
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} captures in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent_bookings(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task: u64 = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            // Each task uses its own tenant (unique dbname from connect())
            let client = connect(&host, port).await;
            let account = open_funded_account(&client, "5000.00").await;
            let coach = Ulid::new();

            for j in 0..n_per_task {
                book_hour(&client, account, coach, j).await;
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    // Writer tasks: continuously capture payments in the background
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            // Writers use their own tenant to avoid conflicts
            let client = connect(&host, port).await;
            let account = open_funded_account(&client, "1.00").await;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&format!(
                        "INSERT INTO payments (id, account_id, method, amount, external_reference) \
                         VALUES ('{}', '{account}', 'card', 5.00, 'bg_{}')",
                        Ulid::new(),
                        Ulid::new()
                    ))
                    .await;
            }
        }));
    }

    // Reader tasks: scan a fully booked day for conflicts and measure latency
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let account = open_funded_account(&client, "100.00").await;
            let coach = Ulid::new();
            for i in 0..24 {
                book_hour(&client, account, coach, i).await;
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        "SELECT * FROM conflicts WHERE resource_id = '{coach}' \
                         AND date = '{}' AND start = '09:30' AND \"end\" = '10:30'",
                        day(0)
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("conflict scan", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn: u64 = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let account = open_funded_account(&client, "100.00").await;
            let coach = Ulid::new();

            for i in 0..ops_per_conn {
                book_hour(&client, account, coach, i).await;
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("TALLY_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TALLY_PORT")
        .unwrap_or_else(|_| "5434".into())
        .parse()
        .expect("invalid TALLY_PORT");

    println!("=== tally stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential capture throughput");
    phase1_sequential_captures(&host, port).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent_bookings(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
