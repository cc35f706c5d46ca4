//! # Prime Pool Example
//!
//! Counts primes below a bound by splitting the range into chunks and
//! `call`ing a worker pool once per chunk. The `count` handler stays
//! suspended until every chunk is back; a persistent timer reports how many
//! handlers are parked meanwhile.

use anyhow::Result;
use serde_json::json;
use std::time::{Duration, Instant};
use switchboard_core::pool::{self, Job, Pool};
use switchboard_core::{Component, Context, Engine, Event, HandlerSet, Payload, Reply, Timer, ANY};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LIMIT: u64 = 2_000_000;
const CHUNK: u64 = 50_000;

// ============================================================================
// Work
// ============================================================================

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

fn count_primes(start: u64, end: u64) -> Job {
    Job::func(move || Ok(json!((start..end).filter(|n| is_prime(*n)).count())))
}

// ============================================================================
// Component
// ============================================================================

struct Sieve {
    started: Instant,
}

impl Sieve {
    fn count(&mut self, ctx: &Context, payload: Payload<'_>) -> Reply {
        let limit = payload.arg(0).and_then(|v| v.as_u64()).unwrap_or(LIMIT);
        let calls: Vec<_> = (0..limit)
            .step_by(CHUNK as usize)
            .map(|start| {
                let end = (start + CHUNK).min(limit);
                ctx.call(pool::task(count_primes(start, end)), None)
            })
            .collect();
        info!(chunks = calls.len(), "work submitted");

        Reply::suspend(async move {
            let mut total = 0;
            for call in calls {
                total += call.await?.as_u64().unwrap_or(0);
            }
            Ok(json!(total))
        })
    }

    fn counted(&mut self, ctx: &Context, payload: Payload<'_>) {
        let primes = payload.arg(0).cloned().unwrap_or_default();
        println!("{primes} primes below {LIMIT} in {:?}", self.started.elapsed());
        ctx.stop();
    }

    fn progress(&mut self, ctx: &Context, _payload: Payload<'_>) {
        info!(
            suspended = ctx.engine().suspended(),
            elapsed = ?self.started.elapsed(),
            "still counting"
        );
    }
}

impl Component for Sieve {
    fn channel(&self) -> &str {
        "sieve"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on("count", Sieve::count);
        set.on("counted", Sieve::counted);
        set.on("progress", Sieve::progress);
        set.on("started", |_: &mut Sieve, ctx: &Context, _: Payload<'_>| {
            ctx.fire(Event::new("Count").arg(LIMIT).on_success("counted"))
                .map(|_| ())
        })
        .target(ANY);
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let engine = Engine::builder()
        .tick_interval(Duration::from_millis(20))
        .default_workers(4)
        .signals(true)
        .build();

    let app = engine.add(Sieve {
        started: Instant::now(),
    });
    let workers = engine.add(Pool::new(&engine, None));
    engine.register(workers, app)?;

    let ticker = engine.add(
        Timer::new(Duration::from_millis(250), Event::new("Progress").target("sieve"))
            .persist(true),
    );
    engine.register(ticker, app)?;

    engine.run().await
}
