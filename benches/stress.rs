use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use ulid::Ulid;

use slotkeeper::engine::{Engine, EngineSettings};
use slotkeeper::model::*;
use slotkeeper::notify::NotifyHub;

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
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn open_engine() -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("slotkeeper_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    Arc::new(
        Engine::new(
            dir.join("schedules.wal"),
            Arc::new(NotifyHub::new()),
            EngineSettings::default(),
        )
        .expect("open engine"),
    )
}

/// One doctor, `slots` back-to-back 10 minute slots from 08:00.
async fn schedule(engine: &Engine, slots: u32, max_bookings: u32) -> Vec<SlotKey> {
    let room = Ulid::new();
    let drafts = (0..slots)
        .map(|i| {
            let start = (8 + i / 6, (i % 6) * 10);
            let end = if i % 6 == 5 { (start.0 + 1, 0) } else { (start.0, start.1 + 10) };
            let mut d = SlotDraft::new(TimeRange::hm(start, end).expect("valid time"), room);
            d.max_bookings = max_bookings;
            d
        })
        .collect();
    let s = engine
        .create_schedule(CandidateSchedule {
            doctor_id: Ulid::new(),
            hospital_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).expect("valid date"),
            slots: drafts,
        })
        .await
        .expect("create schedule");
    s.time_slots.iter().map(|t| SlotKey::new(s.id, t.id)).collect()
}

async fn phase1_sequential(engine: &Engine) {
    let keys = schedule(engine, 60, 100).await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        engine
            .reserve(keys[i % keys.len()], Ulid::new())
            .await
            .expect("reserve");
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} reserves in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("reserve latency", &mut latencies);
}

async fn phase2_one_hot_slot(engine: Arc<Engine>) {
    let key = schedule(&engine, 1, 50).await[0];
    let n_tasks = 500;
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let outcome = engine.reserve(key, Ulid::new()).await.expect("reserve");
            (matches!(outcome, Reservation::Reserved(_)), t.elapsed())
        }));
    }
    let mut granted = 0;
    let mut latencies = Vec::with_capacity(n_tasks);
    for h in handles {
        let (ok, latency) = h.await.expect("task");
        granted += ok as u32;
        latencies.push(latency);
    }
    let status = engine.slot_status(key).await.expect("status");
    println!(
        "  {n_tasks} racers on one slot: {granted} granted, booked {}/{} in {:.2}s",
        status.booked_count,
        status.max_bookings,
        start.elapsed().as_secs_f64()
    );
    assert_eq!(granted, status.booked_count, "overbooked");
    print_latency("contended reserve", &mut latencies);
}

async fn phase3_parallel_slots(engine: Arc<Engine>) {
    let keys = schedule(&engine, 60, 100).await;
    let per_task = 100;
    let start = Instant::now();
    let mut handles = Vec::new();
    for key in keys.iter().copied() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..per_task {
                engine.reserve(key, Ulid::new()).await.expect("reserve");
            }
        }));
    }
    for h in handles {
        h.await.expect("task");
    }
    let total = keys.len() * per_task;
    let elapsed = start.elapsed();
    println!(
        "  {} slots x {per_task} reserves = {total} in {:.2}s = {:.0} ops/sec",
        keys.len(),
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

async fn phase4_lock_churn(engine: Arc<Engine>) {
    let keys = Arc::new(schedule(&engine, 24, 3).await);
    let n_holders = 50;
    let rounds = 200;
    let mut handles = Vec::new();
    for h in 0..n_holders {
        let engine = engine.clone();
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            let holder = format!("holder-{h}");
            let mut latencies = Vec::with_capacity(rounds);
            let mut acquired = 0u32;
            for r in 0..rounds {
                let key = keys[(h + r) % keys.len()];
                let t = Instant::now();
                if let LockOutcome::Acquired(_) = engine.acquire_lock(key, &holder).await.expect("acquire") {
                    acquired += 1;
                    engine.release_lock(&key, &holder);
                }
                latencies.push(t.elapsed());
            }
            (acquired, latencies)
        }));
    }
    let mut acquired = 0;
    let mut latencies = Vec::new();
    for h in handles {
        let (a, l) = h.await.expect("task");
        acquired += a;
        latencies.extend(l);
    }
    println!(
        "  {n_holders} holders x {rounds} rounds: {acquired} locks granted, {} live at end",
        engine.lock_count()
    );
    print_latency("acquire+release", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== slotkeeper stress benchmark ===\n");

    println!("[phase 1] sequential reserve throughput");
    phase1_sequential(&open_engine()).await;

    println!("\n[phase 2] contention on one slot");
    phase2_one_hot_slot(open_engine()).await;

    println!("\n[phase 3] parallel reserves across slots");
    phase3_parallel_slots(open_engine()).await;

    println!("\n[phase 4] lock churn");
    phase4_lock_churn(open_engine()).await;

    println!("\n=== done ===");
}
