//! The engine: arena, run loop and cross-thread entry points.

use crate::component::ComponentId;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::driver::{Driver, Shared, SleepFuture, WaitFor, WaitFuture};
use crate::error::RuntimeError;
use crate::event::Event;
use crate::events;
use crate::handler::TickFn;
use crate::tree::Node;
use anyhow::Context as _;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub(crate) const SIGINT: i32 = 2;
#[cfg(unix)]
pub(crate) const SIGTERM: i32 = 15;

/// Messages crossing into the dispatch thread.
pub(crate) enum Injected {
    Event { origin: ComponentId, event: Event },
    Stop,
}

pub(crate) struct State {
    pub(crate) nodes: Vec<Option<Node>>,
    pub(crate) driver: Driver,
    pub(crate) next_handler: u64,
    pub(crate) running: bool,
    pub(crate) stop_requested: bool,
    inbox: mpsc::UnboundedReceiver<Injected>,
}

impl State {
    pub(crate) fn node(&self, id: ComponentId) -> Result<&Node, RuntimeError> {
        self.nodes
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(RuntimeError::UnknownComponent(id))
    }

    pub(crate) fn node_mut(&mut self, id: ComponentId) -> Result<&mut Node, RuntimeError> {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(RuntimeError::UnknownComponent(id))
    }

    pub(crate) fn roots(&self) -> Vec<ComponentId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| {
                let id = ComponentId::from_index(index);
                node.as_ref().filter(|n| n.root == id).map(|_| id)
            })
            .collect()
    }
}

/// Single-threaded event engine.
///
/// `Engine` is a cheap, clonable handle; clones share one arena. It is
/// `!Send`: build it on the thread that will run it, or use
/// [`Engine::spawn`] to get a thread of its own.
#[derive(Clone)]
pub struct Engine {
    pub(crate) state: Rc<RefCell<State>>,
    pub(crate) shared: Arc<Shared>,
    config: Rc<EngineConfig>,
    tx: mpsc::UnboundedSender<Injected>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        Self {
            state: Rc::new(RefCell::new(State {
                nodes: Vec::new(),
                driver: Driver::default(),
                next_handler: 0,
                running: false,
                stop_requested: false,
                inbox,
            })),
            shared: Arc::new(Shared::default()),
            config: Rc::new(config),
            tx,
        }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A `Send` handle for delivering events from other threads.
    pub fn injector(&self) -> Injector {
        Injector {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// Components with no parent.
    pub fn roots(&self) -> Vec<ComponentId> {
        self.state.borrow().roots()
    }

    pub fn wait(&self, key: WaitFor, timeout: Option<Duration>) -> WaitFuture {
        self.state.borrow_mut().driver.wait(key, timeout)
    }

    pub fn sleep(&self, duration: Duration) -> SleepFuture {
        self.state.borrow_mut().driver.sleep(duration)
    }

    pub fn wake_at(&self, at: Instant) {
        self.state.borrow_mut().driver.wake_at(at);
    }

    /// Nothing queued, nothing suspended, nothing ready to resume.
    pub fn is_idle(&self) -> bool {
        let st = self.state.borrow();
        st.driver.suspended() == 0
            && self.shared.ready.is_empty()
            && st
                .nodes
                .iter()
                .flatten()
                .all(|node| node.root_state.queue.is_empty())
    }

    /// Handlers currently parked on a wait or sleep.
    pub fn suspended(&self) -> usize {
        self.state.borrow().driver.suspended()
    }

    /// Ask the run loop to finish: every root gets `Stopped`, then the loop
    /// exits after its grace ticks.
    pub fn stop(&self) {
        let roots = {
            let mut st = self.state.borrow_mut();
            if std::mem::replace(&mut st.stop_requested, true) {
                return;
            }
            st.running = false;
            st.roots()
        };
        info!(roots = roots.len(), "engine stopping");
        for root in roots {
            self.enqueue(root, events::stopped(root), root);
        }
        self.shared.notify.notify_one();
    }

    /// One iteration of the run loop. Returns the number of events
    /// dispatched.
    pub fn tick(&self) -> usize {
        self.drain_injector();
        let expired = self.state.borrow_mut().driver.expire(Instant::now());
        if expired > 0 {
            debug!(expired, "deadlines reached");
        }
        self.resume_ready();
        self.run_ticks();
        self.flush()
    }

    /// Run until stopped.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut signals = if self.config.capabilities.signals {
            Some(Signals::install().context("failed to install signal handlers")?)
        } else {
            None
        };
        {
            let mut st = self.state.borrow_mut();
            st.running = true;
            st.stop_requested = false;
        }

        let roots = self.roots();
        info!(roots = roots.len(), "engine started");
        for root in roots {
            self.enqueue(root, events::started(root, "run"), root);
        }

        while self.is_running() {
            self.tick();
            if !self.is_running() {
                break;
            }
            let idle = self.idle_wait();
            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(idle) => {}
                signo = next_signal(&mut signals) => {
                    info!(signo, "signal received");
                    for root in self.roots() {
                        self.enqueue(root, events::signal(signo, "os"), root);
                    }
                    self.stop();
                }
            }
        }

        for _ in 0..self.config.shutdown_ticks {
            self.tick();
        }
        info!("engine stopped");
        Ok(())
    }

    /// Build an engine on a dedicated thread and run it there.
    pub fn spawn<F>(config: EngineConfig, build: F) -> Result<EngineHandle, RuntimeError>
    where
        F: FnOnce(&Engine) -> anyhow::Result<ComponentId> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(Injector, ComponentId), String>>();
        let thread = std::thread::Builder::new()
            .name("switchboard-engine".into())
            .spawn(move || -> anyhow::Result<()> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("failed to build engine runtime")?;
                let engine = Engine::new(config);
                match build(&engine) {
                    Ok(root) => {
                        let _ = ready_tx.send(Ok((engine.injector(), root)));
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("{err:#}")));
                        return Err(err);
                    }
                }
                runtime.block_on(engine.run())
            })
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;

        let (injector, root) = ready_rx
            .blocking_recv()
            .map_err(|_| RuntimeError::Spawn("engine thread exited during setup".into()))?
            .map_err(RuntimeError::Spawn)?;

        Ok(EngineHandle {
            injector,
            root,
            thread: Some(thread),
        })
    }

    fn idle_wait(&self) -> Duration {
        let interval = self.config.tick_interval();
        match self.state.borrow().driver.next_deadline() {
            Some(deadline) => interval.min(deadline.saturating_duration_since(Instant::now())),
            None => interval,
        }
    }

    fn drain_injector(&self) {
        let batch: Vec<Injected> = {
            let mut st = self.state.borrow_mut();
            let mut batch = Vec::new();
            while let Ok(injected) = st.inbox.try_recv() {
                batch.push(injected);
            }
            batch
        };

        for injected in batch {
            match injected {
                Injected::Event { origin, event } => {
                    if let Err(err) = self.fire(origin, event) {
                        warn!(%origin, error = %err, "dropping injected event");
                    }
                }
                Injected::Stop => self.stop(),
            }
        }
    }

    fn resume_ready(&self) {
        for task in self.shared.take_ready() {
            let suspended = self.state.borrow_mut().driver.unpark(task);
            if let Some(suspended) = suspended {
                self.resume(task, suspended);
            }
        }
    }

    fn run_ticks(&self) {
        let hooks: Vec<(ComponentId, TickFn)> = {
            let st = self.state.borrow();
            st.nodes
                .iter()
                .enumerate()
                .filter_map(|(index, node)| {
                    node.as_ref()
                        .filter(|n| n.root.index() == index)
                        .map(|n| n.root_state.ticks.clone())
                })
                .flatten()
                .collect()
        };

        for (component, hook) in hooks {
            let Ok(mut state) = self.checkout(component) else {
                continue;
            };
            let ctx = Context::new(self.clone(), component);
            let result = catch_unwind(AssertUnwindSafe(|| hook(state.as_mut(), &ctx)));
            self.checkin(component, state);

            let result = result.unwrap_or_else(|panic| Err(crate::dispatch::panic_error(panic)));
            if let Err(err) = result {
                warn!(%component, error = %err, "tick hook failed");
                self.report_error(component, &err, None, None);
            }
        }
    }
}

/// Assembles an [`EngineConfig`] and builds an engine from it.
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn shutdown_ticks(mut self, ticks: usize) -> Self {
        self.config.shutdown_ticks = ticks;
        self
    }

    /// Turn SIGINT/SIGTERM into `Signal` events plus a stop.
    pub fn signals(mut self, enabled: bool) -> Self {
        self.config.capabilities.signals = enabled;
        self
    }

    pub fn default_workers(mut self, workers: usize) -> Self {
        self.config.capabilities.default_workers = workers;
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(self.config)
    }

    pub fn spawn<F>(self, build: F) -> Result<EngineHandle, RuntimeError>
    where
        F: FnOnce(&Engine) -> anyhow::Result<ComponentId> + Send + 'static,
    {
        Engine::spawn(self.config, build)
    }
}

/// Thread-safe entry point into a running engine.
#[derive(Clone)]
pub struct Injector {
    tx: mpsc::UnboundedSender<Injected>,
    shared: Arc<Shared>,
}

impl Injector {
    /// Queue `event` as if `origin` had fired it.
    pub fn fire(&self, origin: ComponentId, event: Event) -> Result<(), RuntimeError> {
        self.tx
            .send(Injected::Event { origin, event })
            .map_err(|_| RuntimeError::EngineClosed)?;
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn stop(&self) -> Result<(), RuntimeError> {
        self.tx
            .send(Injected::Stop)
            .map_err(|_| RuntimeError::EngineClosed)?;
        self.shared.notify.notify_one();
        Ok(())
    }
}

/// An engine running on its own thread.
pub struct EngineHandle {
    injector: Injector,
    root: ComponentId,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl EngineHandle {
    /// The component returned by the build closure.
    pub fn root(&self) -> ComponentId {
        self.root
    }

    pub fn injector(&self) -> Injector {
        self.injector.clone()
    }

    /// Fire an event into the tree, originating at the root component.
    pub fn fire(&self, event: Event) -> Result<(), RuntimeError> {
        self.injector.fire(self.root, event)
    }

    pub fn stop(&self) -> Result<(), RuntimeError> {
        self.injector.stop()
    }

    /// Wait for the engine thread to finish.
    pub fn join(mut self) -> anyhow::Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| RuntimeError::Spawn("engine thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> i32 {
        tokio::select! {
            _ = self.interrupt.recv() => SIGINT,
            _ = self.terminate.recv() => SIGTERM,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> i32 {
        let _ = tokio::signal::ctrl_c().await;
        SIGINT
    }
}

async fn next_signal(signals: &mut Option<Signals>) -> i32 {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}
