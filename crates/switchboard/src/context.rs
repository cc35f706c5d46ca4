use crate::component::ComponentId;
use crate::driver::{SleepFuture, WaitFor, WaitFuture};
use crate::engine::Engine;
use crate::error::RuntimeError;
use crate::event::{Event, EventId};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Handle given to handlers and tick hooks: the engine, seen from one
/// component.
///
/// Contexts are cheap to clone and `'static`, so suspended handlers move
/// them into their futures.
#[derive(Clone)]
pub struct Context {
    engine: Engine,
    component: ComponentId,
}

impl Context {
    pub(crate) fn new(engine: Engine, component: ComponentId) -> Self {
        Self { engine, component }
    }

    /// The component whose handler is running.
    pub fn component(&self) -> ComponentId {
        self.component
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Channel of the running component (`"*"` if it has gone away).
    pub fn channel(&self) -> String {
        self.engine
            .channel_of(self.component)
            .unwrap_or_else(|| crate::ANY.to_owned())
    }

    /// Queue an event on this component's tree.
    pub fn fire(&self, event: Event) -> Result<EventId, RuntimeError> {
        self.engine.fire(self.component, event)
    }

    /// Dispatch an event now, bypassing the queue.
    pub fn send(&self, event: Event) -> Result<Option<Value>, RuntimeError> {
        self.engine.send(self.component, event)
    }

    /// Queue an event on every tree linked to this component.
    pub fn fire_linked(&self, event: Event) -> Result<usize, RuntimeError> {
        self.engine.fire_linked(self.component, event)
    }

    /// Wait for a matching event to finish its handler chain.
    pub fn wait(&self, key: impl Into<WaitFor>, timeout: Option<Duration>) -> WaitFuture {
        self.engine.wait(key.into(), timeout)
    }

    /// Fire an event and wait for its value.
    pub fn call(&self, event: Event, timeout: Option<Duration>) -> WaitFuture {
        match self.fire(event) {
            Ok(id) => self.engine.wait(WaitFor::Event(id), timeout),
            Err(err) => WaitFuture::ready(Err(err)),
        }
    }

    pub fn sleep(&self, duration: Duration) -> SleepFuture {
        self.engine.sleep(duration)
    }

    /// Register `child` under this component.
    pub fn register(&self, child: ComponentId) -> Result<(), RuntimeError> {
        self.engine.register(child, self.component)
    }

    /// Detach this component from its parent.
    pub fn unregister(&self) -> Result<(), RuntimeError> {
        self.engine.unregister(self.component)
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Make sure the run loop ticks again by `at`.
    pub fn wake_at(&self, at: Instant) {
        self.engine.wake_at(at);
    }
}
