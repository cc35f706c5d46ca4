//! Testing utilities for Switchboard.
//!
//! - [`Recorder`]: a component that captures the events dispatched on its tree
//! - [`Harness`]: drives an [`Engine`] tick by tick, without a tokio runtime
//!
//! ```ignore
//! let harness = Harness::new();
//! let app = harness.add(App);
//! let recording = harness.record(app, ["hello_success"])?;
//!
//! harness.engine().fire(app, Event::new("Hello").on_success("hello_success"))?;
//! harness.run_until_idle();
//!
//! assert_eq!(recording.count("Success"), 1);
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use switchboard_core::{
    Component, ComponentId, Context, Engine, EngineConfig, Event, HandlerSet, RuntimeError, ANY,
};

/// Shared view of what a [`Recorder`] captured.
#[derive(Clone, Default)]
pub struct Recording {
    events: Rc<RefCell<Vec<Event>>>,
}

impl Recording {
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Names in dispatch order.
    pub fn names(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .map(|e| e.name().to_owned())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn last(&self, name: &str) -> Option<Event> {
        self.events
            .borrow()
            .iter()
            .rev()
            .find(|e| e.name() == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

/// Records every event dispatched on its tree whose channel is in its list
/// (or every event, with [`Recorder::all`]).
///
/// Runs as a global handler at a very high priority so it sees events
/// before any filter can stop them.
pub struct Recorder {
    channels: Option<Vec<String>>,
    recording: Recording,
}

impl Recorder {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: Some(channels.into_iter().map(Into::into).collect()),
            recording: Recording::default(),
        }
    }

    pub fn all() -> Self {
        Self {
            channels: None,
            recording: Recording::default(),
        }
    }

    pub fn recording(&self) -> Recording {
        self.recording.clone()
    }

    fn capture(&mut self, _ctx: &Context, event: &mut Event) {
        let wanted = match (&self.channels, event.channel_name()) {
            (None, _) => true,
            (Some(channels), Some(channel)) => channels.iter().any(|c| c == channel),
            (Some(_), None) => false,
        };
        if wanted {
            self.recording.events.borrow_mut().push(event.clone());
        }
    }
}

impl Component for Recorder {
    fn channel(&self) -> &str {
        "recorder"
    }

    fn handlers(set: &mut HandlerSet<Self>) {
        set.on_event("record", Recorder::capture)
            .channels([ANY])
            .target(ANY)
            .priority(1_000_000.0);
    }
}

/// Tick-driven engine driver for synchronous tests.
pub struct Harness {
    engine: Engine,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Upper bound on ticks in [`Harness::run_until_idle`].
    pub const MAX_TICKS: usize = 10_000;

    pub fn new() -> Self {
        Self::with_engine(Engine::new(EngineConfig::default()))
    }

    pub fn with_engine(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn add<C: Component>(&self, component: C) -> ComponentId {
        self.engine.add(component)
    }

    /// Register a [`Recorder`] for `channels` under `root`.
    pub fn record<I, S>(&self, root: ComponentId, channels: I) -> Result<Recording, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attach(root, Recorder::new(channels))
    }

    /// Register a [`Recorder`] for every event under `root`.
    pub fn record_all(&self, root: ComponentId) -> Result<Recording, RuntimeError> {
        self.attach(root, Recorder::all())
    }

    fn attach(&self, root: ComponentId, recorder: Recorder) -> Result<Recording, RuntimeError> {
        let recording = recorder.recording();
        let id = self.engine.add(recorder);
        self.engine.register(id, root)?;
        Ok(recording)
    }

    /// Run `n` ticks; returns the number of events dispatched.
    pub fn tick_n(&self, n: usize) -> usize {
        (0..n).map(|_| self.engine.tick()).sum()
    }

    /// Tick until a tick dispatches nothing and the engine is idle.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        for _ in 0..Self::MAX_TICKS {
            let dispatched = self.engine.tick();
            total += dispatched;
            if dispatched == 0 && self.engine.is_idle() {
                return total;
            }
        }
        panic!("engine still busy after {} ticks", Self::MAX_TICKS);
    }

    /// Tick until `done` holds or `timeout` passes. Sleeps briefly between
    /// idle ticks so deadlines and worker threads can make progress.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            let dispatched = self.engine.tick();
            if done() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            if dispatched == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::Payload;

    struct Echo;

    impl Component for Echo {
        fn channel(&self) -> &str {
            "echo"
        }

        fn handlers(set: &mut HandlerSet<Self>) {
            set.on("ping", |_, _, _: Payload<'_>| "pong");
        }
    }

    #[test]
    fn recorder_captures_selected_channels() {
        let harness = Harness::new();
        let echo = harness.add(Echo);
        let pings = harness.record(echo, ["ping"]).unwrap();
        let everything = harness.record_all(echo).unwrap();

        harness
            .engine()
            .fire(echo, Event::new("Ping").on_success("pinged"))
            .unwrap();
        harness.run_until_idle();

        assert_eq!(pings.names(), vec!["Ping"]);
        assert!(everything.count("Registered") >= 1);
        // One per handler: both recorders, then Echo.
        assert_eq!(everything.count("Success"), 3);
        assert_eq!(
            everything.last("Success").unwrap().args,
            vec![serde_json::json!("pong")]
        );

        pings.clear();
        assert!(pings.is_empty());
    }

    #[test]
    fn run_until_gives_up_after_timeout() {
        let harness = Harness::new();
        assert!(!harness.run_until(|| false, Duration::from_millis(5)));
        assert!(harness.run_until(|| true, Duration::from_millis(5)));
    }
}
