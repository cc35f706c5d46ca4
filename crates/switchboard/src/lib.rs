//! # Switchboard
//!
//! An in-process, event-driven component runtime. Components declare named
//! handlers, events are addressed to a `(target, channel)` pair, and one
//! dispatcher per engine delivers each event to the matching handlers in
//! priority order.
//!
//! ## Core Concepts
//!
//! - [`Component`] = a node of the tree that declares handlers once per type
//! - [`Event`] = a named message with a JSON payload and a route
//! - [`Engine`] = the arena, the queues and the run loop
//! - [`Context`] = what a handler sees: fire, send, wait, call, register
//!
//! Components form trees. The **root** of each tree owns its event queue,
//! its handler table and its tick hooks; registering and unregistering
//! subtrees merges and splits those tables while events are in flight.
//!
//! ## Architecture
//!
//! ```text
//! Injector (other threads) ──┐
//!                            ▼
//! Engine.run() loop ──► tick() ──┬─► drain injector
//!                                ├─► expire waits / sleeps
//!                                ├─► resume ready handlers ──┐
//!                                ├─► tick hooks (Timer)      │
//!                                └─► flush() ─► dispatch_one │
//!                                                 │          │
//!                        handler table (root) ◄───┘          │
//!                                 │                          │
//!          priority / filter ordered chain ──► Reply::Suspend┘
//!                                 │
//!          Start / Success / Failure / Filter / End feedback
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single dispatch thread** - an engine is `!Send`; handlers and their
//!    futures only run on the thread that runs the engine
//! 2. **Priority order** - handlers run by priority, filters before
//!    listeners at equal priority, then in registration order
//! 3. **Flush snapshots** - events fired while flushing run on the next flush
//! 4. **Failures are events** - handler errors and panics become `Error`
//!    events; they never unwind through the dispatcher
//! 5. **Roots own state** - queue, handler table and tick hooks always live
//!    on the root of the tree that owns them
//!
//! ## Guarantees
//!
//! - **In-memory only**: queued events are lost when the process ends
//! - **No delivery guarantee** if the process terminates mid-dispatch
//! - **FIFO per root**: one flush dispatches its snapshot in order
//!
//! ## Example
//!
//! ```ignore
//! use switchboard_core::{Component, Context, Engine, EngineConfig, Event, HandlerSet, Payload};
//!
//! struct App;
//!
//! impl Component for App {
//!     fn channel(&self) -> &str {
//!         "app"
//!     }
//!
//!     fn handlers(set: &mut HandlerSet<Self>) {
//!         set.on("hello", |_, _, p: Payload<'_>| {
//!             format!("Hello {}!", p.str_arg(0).unwrap_or("World"))
//!         });
//!         set.on("started", |_, ctx: &Context, _: Payload<'_>| {
//!             ctx.fire(Event::new("Hello").arg("Switchboard"))?;
//!             anyhow::Ok(())
//!         })
//!         .target("*");
//!     }
//! }
//!
//! let engine = Engine::new(EngineConfig::default());
//! let app = engine.add(App);
//! engine.run().await?;
//! ```
//!
//! ## What This Is Not
//!
//! Switchboard is **not**:
//! - A distributed system or a message broker
//! - A durable queue
//! - An async executor for general I/O
//!
//! Switchboard **is**:
//! > A deterministic dispatcher for component trees, where handlers may
//! > suspend on each other's outcomes without leaving the dispatch thread.

// Core modules
mod component;
mod config;
mod context;
mod dispatch;
mod driver;
mod engine;
mod error;
mod event;
mod event_macro;
mod handler;
mod registry;
mod tree;

// Lifecycle event constructors
pub mod events;

// Built-in components
pub mod debugger;
pub mod pool;
pub mod timer;


// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use component::{Component, ComponentId};
pub use context::Context;
pub use event::{ChannelSpec, Event, EventId, Feedback, FeedbackKind, Route, ANY};
pub use handler::{is_truthy, Declared, HandlerId, HandlerInfo, HandlerSet, IntoReply, Payload, Reply};

// Re-export engine types (primary entry point)
pub use config::{Capabilities, EngineConfig};
pub use engine::{Engine, EngineBuilder, EngineHandle, Injector};

// Re-export coroutine types
pub use driver::{SleepFuture, WaitFor, WaitFuture};

// Re-export error types
pub use error::RuntimeError;

// Re-export built-in components
pub use debugger::Debugger;
pub use pool::{Job, Pool};
pub use timer::Timer;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
