//! Worker pool for blocking jobs.
//!
//! A [`Pool`] owns `N` long-lived OS threads. A `Task` event carrying a
//! [`Job`] is handed to the least-loaded worker; the pool's `task` handler
//! suspends until the worker's `TaskResult` comes back through the engine's
//! [`Injector`], which is the only thing that crosses threads.
//!
//! ```text
//!  fire(task(job)) ──► Pool.task ──► worker[i] (std thread)
//!                        │ suspended       │ job.run()
//!                        │                 ▼
//!                        │          Injector::fire(TaskResult)
//!                        ▼                 │
//!                Success/Failure ◄── Pool.task_result
//! ```

use crate::component::{Component, ComponentId};
use crate::context::Context;
use crate::engine::{Engine, Injector};
use crate::error::RuntimeError;
use crate::event::{Event, EventId, ANY};
use crate::handler::{HandlerSet, Payload, Reply};
use anyhow::{anyhow, bail, Context as _};
use serde_json::Value;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHANNEL: &str = "pool";

/// A unit of blocking work.
pub enum Job {
    /// Run a closure on a worker thread.
    Func(Box<dyn FnOnce() -> anyhow::Result<Value> + Send>),
    /// Run a program with the JSON input on stdin; its stdout is parsed as
    /// the JSON result.
    Command {
        program: String,
        args: Vec<String>,
        input: Value,
    },
}

impl Job {
    pub fn func<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        Self::Func(Box::new(f))
    }

    pub fn command<I, S>(program: impl Into<String>, args: I, input: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            input,
        }
    }

    fn run(self) -> anyhow::Result<Value> {
        match self {
            Self::Func(f) => f(),
            Self::Command {
                program,
                args,
                input,
            } => run_command(&program, &args, &input),
        }
    }
}

fn run_command(program: &str, args: &[String], input: &Value) -> anyhow::Result<Value> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;

    let payload = serde_json::to_vec(input)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .with_context(|| format!("failed to write input to {program}"))?;
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    serde_json::from_slice(&output.stdout)
        .with_context(|| format!("{program} did not print a JSON result"))
}

/// A `Task` event for the pool on [`DEFAULT_CHANNEL`].
///
/// Declares `task_success` / `task_failure` feedback; retarget with
/// [`Event::target`] for a pool on another channel.
pub fn task(job: Job) -> Event {
    Event::new("Task")
        .target(DEFAULT_CHANNEL)
        .with_attachment(job)
        .on_success("task_success")
        .on_failure("task_failure")
}

struct Work {
    job: Job,
    result: EventId,
}

struct Worker {
    tx: mpsc::UnboundedSender<Work>,
    load: Arc<AtomicUsize>,
    thread: JoinHandle<()>,
}

/// Pool of worker threads; see the module docs.
pub struct Pool {
    channel: String,
    size: usize,
    injector: Injector,
    workers: Vec<Worker>,
    next: usize,
}

impl Pool {
    /// A pool with `workers` threads, or the engine's
    /// `capabilities.default_workers`.
    pub fn new(engine: &Engine, workers: Option<usize>) -> Self {
        let size = workers
            .unwrap_or(engine.config().capabilities.default_workers)
            .max(1);
        Self {
            channel: DEFAULT_CHANNEL.to_owned(),
            size,
            injector: engine.injector(),
            workers: Vec::new(),
            next: 0,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs handed out and not yet finished, per worker.
    pub fn loads(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|w| w.load.load(Ordering::SeqCst))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    fn start(&mut self, owner: ComponentId) {
        if self.is_running() {
            return;
        }
        for index in 0..self.size {
            let (tx, mut rx) = mpsc::unbounded_channel::<Work>();
            let load = Arc::new(AtomicUsize::new(0));
            let injector = self.injector.clone();
            let target = self.channel.clone();
            let worker_load = load.clone();

            let thread = std::thread::Builder::new()
                .name(format!("{}-worker-{index}", self.channel))
                .spawn(move || {
                    while let Some(work) = rx.blocking_recv() {
                        let outcome = catch_unwind(AssertUnwindSafe(|| work.job.run()))
                            .unwrap_or_else(|panic| {
                                error!(worker = index, "job panicked");
                                Err(crate::dispatch::panic_error(panic))
                            });
                        worker_load.fetch_sub(1, Ordering::SeqCst);
                        if let Err(err) = &outcome {
                            debug!(worker = index, error = %err, "job failed");
                        }
                        let event = task_result(work.result, &target, outcome);
                        if let Err(err) = injector.fire(owner, event) {
                            warn!(worker = index, error = %err, "dropping task result");
                        }
                    }
                });

            match thread {
                Ok(thread) => self.workers.push(Worker {
                    tx,
                    load,
                    thread,
                }),
                Err(err) => error!(worker = index, error = %err, "failed to start worker"),
            }
        }
        info!(channel = %self.channel, workers = self.workers.len(), "pool started");
    }

    /// Close every worker and wait for it to finish its current job.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut self.workers)
            .into_iter()
            .map(|worker| {
                drop(worker.tx);
                worker.thread
            })
            .collect();
        for thread in threads {
            if thread.join().is_err() {
                error!(channel = %self.channel, "worker thread panicked");
            }
        }
        info!(channel = %self.channel, "pool stopped");
    }

    /// Least-loaded worker, ties broken round-robin.
    fn pick(&mut self) -> Option<usize> {
        let count = self.workers.len();
        let least = self
            .workers
            .iter()
            .map(|w| w.load.load(Ordering::SeqCst))
            .min()?;
        let chosen = (0..count)
            .map(|offset| (self.next + offset) % count)
            .find(|i| self.workers[*i].load.load(Ordering::SeqCst) == least)?;
        self.next = (chosen + 1) % count;
        Some(chosen)
    }

    fn submit(&mut self, job: Job, result: EventId) -> Result<(), RuntimeError> {
        let index = self
            .pick()
            .ok_or_else(|| RuntimeError::Pool("pool is not running".into()))?;
        let worker = &self.workers[index];
        worker.load.fetch_add(1, Ordering::SeqCst);
        worker.tx.send(Work { job, result }).map_err(|_| {
            worker.load.fetch_sub(1, Ordering::SeqCst);
            RuntimeError::Pool(format!("worker {index} is gone"))
        })?;
        debug!(worker = index, %result, "job submitted");
        Ok(())
    }

    fn on_task(&mut self, ctx: &Context, event: &mut Event) -> anyhow::Result<Reply> {
        self.start(ctx.component());
        let job = event
            .take_attachment::<Job>()
            .ok_or_else(|| RuntimeError::Pool("task event carries no job".into()))?;

        let result = EventId::new();
        let wait = ctx.wait(result, None);
        self.submit(job, result)?;
        Ok(Reply::suspend(async move { Ok(wait.await?) }))
    }

    fn on_task_result(&mut self, _ctx: &Context, payload: Payload<'_>) -> anyhow::Result<Value> {
        if let Some(message) = payload.kwarg("error") {
            return Err(anyhow!("{}", message.as_str().unwrap_or("job failed")));
        }
        Ok(payload.arg(0).cloned().unwrap_or(Value::Null))
    }

    fn on_unregistered(&mut self, ctx: &Context, payload: Payload<'_>) {
        let component = payload.arg(0).and_then(ComponentId::from_value);
        if component == Some(ctx.component()) {
            self.shutdown();
        }
    }
}

fn task_result(id: EventId, target: &str, outcome: anyhow::Result<Value>) -> Event {
    let event = Event::new("TaskResult")
        .with_id(id)
        .target(target)
        .channel("task_result");
    match outcome {
        Ok(value) => event.arg(value),
        Err(err) => event.kwarg("error", format!("{err:#}")),
    }
}

impl Component for Pool {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on_event("task", Pool::on_task);
        set.on("task_result", Pool::on_task_result);
        set.on("started", |pool: &mut Pool, ctx: &Context, _: Payload<'_>| {
            pool.start(ctx.component());
        })
        .target(ANY);
        set.on("stopped", |pool: &mut Pool, _: &Context, _: Payload<'_>| pool.shutdown())
            .target(ANY);
        set.on("unregistered", Pool::on_unregistered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;

    #[test]
    fn picks_least_loaded_worker_round_robin() {
        let engine = Engine::new(EngineConfig::default());
        let mut pool = Pool::new(&engine, Some(3));
        pool.start(ComponentId::from_index(0));
        assert_eq!(pool.loads(), vec![0, 0, 0]);

        assert_eq!(pool.pick(), Some(0));
        assert_eq!(pool.pick(), Some(1));
        pool.workers[2].load.store(2, Ordering::SeqCst);
        assert_eq!(pool.pick(), Some(0));
        pool.workers[0].load.store(1, Ordering::SeqCst);
        assert_eq!(pool.pick(), Some(1));

        pool.workers.iter().for_each(|w| w.load.store(0, Ordering::SeqCst));
        pool.shutdown();
        assert!(!pool.is_running());
        assert_eq!(pool.pick(), None);
    }

    #[test]
    fn size_falls_back_to_capabilities() {
        let engine = Engine::builder().default_workers(4).build();
        assert_eq!(Pool::new(&engine, None).size(), 4);
        assert_eq!(Pool::new(&engine, Some(0)).size(), 1);
    }

    #[test]
    fn func_jobs_run_in_place() {
        let job = Job::func(|| Ok(json!(6 * 7)));
        assert_eq!(job.run().unwrap(), json!(42));
    }

    #[cfg(unix)]
    #[test]
    fn command_jobs_exchange_json_over_stdio() {
        let job = Job::command("cat", Vec::<String>::new(), json!({"n": [1, 2]}));
        assert_eq!(job.run().unwrap(), json!({"n": [1, 2]}));

        let failing = Job::command("sh", ["-c", "echo nope >&2; exit 3"], json!(null));
        let err = failing.run().unwrap_err().to_string();
        assert!(err.contains("nope"), "{err}");
    }

    #[test]
    fn task_results_carry_value_or_error() {
        let id = EventId::new();
        let ok = task_result(id, "pool", Ok(json!(1)));
        assert_eq!(ok.id(), id);
        assert_eq!(ok.args, vec![json!(1)]);

        let failed = task_result(id, "pool", Err(anyhow!("bad input")));
        assert_eq!(failed.kwargs["error"], json!("bad input"));
    }
}
