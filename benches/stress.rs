use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2025-01-01T00:00:00Z
const EPOCH: i64 = 1_735_689_600_000;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("lineup")
        .password(std::env::var("LINEUP_PASSWORD").unwrap_or_else(|_| "lineup".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Register a fresh stage in the tenant's directory.
async fn add_stage(client: &tokio_postgres::Client, name: &str) -> Ulid {
    let stage = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO stages (id, name) VALUES ('{stage}', '{name}')"
        ))
        .await
        .unwrap();
    stage
}

/// Insert one booking of `[start, start + len)` on `stage`.
async fn book(
    client: &tokio_postgres::Client,
    stage: Ulid,
    start: i64,
    len: i64,
) -> Result<(), tokio_postgres::Error> {
    let end = start + len;
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (name, stage_id, start, "end") VALUES ('set {start}', '{stage}', {start}, {end})"#
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let stage = add_stage(&client, "Main").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    // Back-to-back slots: every insert is adjacent to the previous one.
    for i in 0..n {
        let s = EPOCH + (i as i64) * HOUR;
        let t = Instant::now();
        book(&client, stage, s, HOUR).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let stage = add_stage(&connect(host, port, &tenant).await, "Main").await;
    let n_tasks = 10;
    let n_slots = 200;

    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    // Every task races for the same slots on one stage; each slot admits one.
    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let accepted = accepted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            for j in 0..n_slots {
                let s = EPOCH + (j as i64) * HOUR;
                match book(&client, stage, s, HOUR).await {
                    Ok(()) => accepted.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => {
                        rejected.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_slots;
    let ops = total as f64 / elapsed.as_secs_f64();
    let accepted = accepted.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots = {total} attempts in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    println!(
        "  accepted={accepted} (expected {n_slots}), rejected={}",
        rejected.load(Ordering::Relaxed)
    );
    assert_eq!(accepted, n_slots, "double booking detected");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup_client = connect(host, port, &tenant).await;
    let mut stages = Vec::new();
    for n in 0..10 {
        stages.push(add_stage(&setup_client, &format!("Stage {n}")).await);
    }
    for stage in &stages {
        for i in 0..50 {
            book(&setup_client, *stage, EPOCH + (i as i64) * HOUR, HOUR)
                .await
                .unwrap();
        }
    }
    drop(setup_client);

    // Writers keep booking fresh stages in the same tenant.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let stage = add_stage(&client, "Writer").await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = book(&client, stage, EPOCH + i * HOUR, HOUR).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stage = stages[r % stages.len()];
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM events WHERE stage_id = '{stage}' ORDER BY start"
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

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("stage listing", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let stage = add_stage(&client, "Storm").await;
            for i in 0..ops_per_conn {
                book(&client, stage, EPOCH + (i as i64) * HOUR, HOUR)
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("LINEUP_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("LINEUP_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid LINEUP_PORT");

    println!("=== lineup stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential adjacent bookings");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended bookings on one stage");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
