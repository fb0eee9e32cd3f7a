use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("orcdesk")
        .password("orcdesk");

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

/// Issue one quote and return its number.
async fn issue_quote(client: &tokio_postgres::Client) -> String {
    let messages = client
        .simple_query("INSERT INTO quotes (client) VALUES (NULL) RETURNING *")
        .await
        .expect("issue failed");
    messages
        .into_iter()
        .find_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => row.get("number").map(str::to_string),
            _ => None,
        })
        .expect("no number returned")
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &format!("bench_{}", Ulid::new())).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        issue_quote(&client).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} quotes in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("issue latency", &mut latencies);
}

/// Many connections issuing into one tenant. Every number must be distinct.
async fn phase2_contended(host: &str, port: u16) {
    let n_tasks = 20;
    let n_per_task = 100;
    let tenant = format!("bench_{}", Ulid::new());

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut issued = Vec::with_capacity(n_per_task);
            let mut latencies = Vec::with_capacity(n_per_task);
            for _ in 0..n_per_task {
                let t = Instant::now();
                issued.push(issue_quote(&client).await);
                latencies.push(t.elapsed());
            }
            (issued, latencies)
        }));
    }

    let mut numbers = HashSet::new();
    let mut duplicates = 0usize;
    let mut all_latencies = Vec::new();
    for h in handles {
        let (issued, latencies) = h.await.expect("task panicked");
        for number in issued {
            if !numbers.insert(number) {
                duplicates += 1;
            }
        }
        all_latencies.extend(latencies);
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} connections x {n_per_task} quotes = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    println!("  distinct numbers: {}, duplicates: {duplicates}", numbers.len());
    print_latency("contended issue latency", &mut all_latencies);
}

async fn phase3_slots_under_load(host: &str, port: u16) {
    let tenant = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &tenant).await;
    for day in 1..=28 {
        let values: Vec<String> = (9..17)
            .map(|h| format!("('{}', '2025-03-{day:02}T{h:02}:00:00-03:00', NULL)", Ulid::new()))
            .collect();
        setup
            .batch_execute(&format!(
                "INSERT INTO calendar_events (id, start_date_time, start_date) VALUES {}",
                values.join(", ")
            ))
            .await
            .expect("calendar insert failed");
    }
    drop(setup);

    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..4 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                issue_quote(&client).await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let day = (r + i) % 28 + 1;
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM open_slots WHERE date = '2025-03-{day:02}'"
                    ))
                    .await
                    .expect("open_slots failed");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in readers {
        all_latencies.extend(h.await.expect("reader panicked"));
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("open_slots query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ORCDESK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ORCDESK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ORCDESK_PORT");

    println!("=== orcdesk issue stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential issue throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended issue, one tenant");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] slot reads under issue load");
    phase3_slots_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
