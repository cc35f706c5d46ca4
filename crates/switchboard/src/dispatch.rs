//! Queueing and the handler-chain dispatcher.
//!
//! ```text
//! fire() ──► root queue ──► flush() ──► dispatch_one()
//!                                           │
//!                    ┌──────────────────────┤ resolve (target, channel)
//!                    ▼                      │
//!              handler[i] ── Suspend ──► Driver (parked; resumed by waker)
//!                    │                      │
//!         Err ──► Error + Failure           │
//!         filter && truthy ──► Filter, halt │
//!         Ok ──► Success, next handler ─────┘
//!                    │
//!                    ▼
//!            End + resolve waits
//! ```
//!
//! ## Key Invariants
//!
//! 1. **No borrow across user code** - the arena is never borrowed while a
//!    handler, tick hook or future runs
//! 2. **One dispatch thread** - futures are polled only here
//! 3. **Flush is a snapshot** - events fired during a flush run on the next one
//! 4. **Failures never escape** - handler errors and panics become `Error` events

use crate::component::ComponentId;
use crate::context::Context;
use crate::driver::{self, Suspended, TaskId, WaitFor};
use crate::engine::Engine;
use crate::error::RuntimeError;
use crate::event::{Event, EventId, FeedbackKind, Route};
use crate::events;
use crate::handler::{is_truthy, HandlerInfo, Reply};
use crate::registry::Installed;
use crate::tree::Checkout;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};
use tracing::{debug, warn};

/// An event waiting on a root's queue.
pub(crate) struct Queued {
    pub(crate) event: Event,
    pub(crate) route: Route,
    pub(crate) origin: ComponentId,
}

/// A handler chain in progress.
pub(crate) struct DispatchRun {
    event: Event,
    route: Route,
    root: ComponentId,
    origin: ComponentId,
    handlers: Vec<Rc<Installed>>,
    index: usize,
    outcome: Outcome,
}

#[derive(Default)]
struct Outcome {
    value: Value,
    last: Option<HandlerInfo>,
    failed: Option<String>,
}

enum Flow {
    Continue,
    Halt,
}

#[derive(Debug, thiserror::Error)]
#[error("handler panicked: {0}")]
pub(crate) struct HandlerPanic(String);

pub(crate) fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    HandlerPanic(message).into()
}

/// `(type, message, stack)` as carried by `Error` and `Failure` events.
fn describe(err: &anyhow::Error) -> (String, String, Vec<Value>) {
    let kind = if err.downcast_ref::<HandlerPanic>().is_some() {
        "Panic".to_owned()
    } else if let Some(runtime) = err.downcast_ref::<RuntimeError>() {
        runtime.code().to_owned()
    } else {
        "Error".to_owned()
    };
    let stack = err
        .chain()
        .skip(1)
        .map(|cause| Value::from(cause.to_string()))
        .collect();
    (kind, err.to_string(), stack)
}

impl Engine {
    /// Queue `event` on the tree of `origin`. The route defaults to the
    /// lower-cased event name on `origin`'s channel.
    pub fn fire(&self, origin: ComponentId, mut event: Event) -> Result<EventId, RuntimeError> {
        let channel = self.state.borrow().node(origin)?.channel.clone();
        let route = event.resolve_route(&channel);
        self.enqueue_routed(origin, event, route, origin)
            .ok_or(RuntimeError::UnknownComponent(origin))
    }

    /// Dispatch `event` immediately. Returns its value, or `None` when a
    /// handler suspended and the chain is still in progress.
    pub fn send(&self, origin: ComponentId, mut event: Event) -> Result<Option<Value>, RuntimeError> {
        let (channel, root) = {
            let st = self.state.borrow();
            let node = st.node(origin)?;
            (node.channel.clone(), node.root)
        };
        let route = event.resolve_route(&channel);
        let mut wait = self.wait(WaitFor::Event(event.id()), None);
        self.dispatch_one(
            Queued {
                event,
                route,
                origin,
            },
            root,
        );
        match (&mut wait).now_or_never() {
            Some(result) => result.map(Some),
            None => {
                drop(wait);
                self.state.borrow_mut().driver.drop_abandoned();
                Ok(None)
            }
        }
    }

    /// Mark a queued event cancelled. Returns whether it was found.
    pub fn cancel(&self, id: EventId) -> bool {
        let mut st = self.state.borrow_mut();
        for node in st.nodes.iter_mut().flatten() {
            if let Some(queued) = node
                .root_state
                .queue
                .iter_mut()
                .find(|queued| queued.event.id() == id)
            {
                queued.event.cancel();
                return true;
            }
        }
        false
    }

    /// Dispatch everything queued on every root. Returns the number of
    /// events taken off the queues.
    pub fn flush(&self) -> usize {
        let roots: Vec<ComponentId> = {
            let st = self.state.borrow();
            st.roots()
                .into_iter()
                .filter(|root| st.node(*root).is_ok_and(|n| !n.root_state.queue.is_empty()))
                .collect()
        };
        roots.into_iter().map(|root| self.flush_root(root)).sum()
    }

    pub(crate) fn enqueue(&self, at: ComponentId, mut event: Event, origin: ComponentId) -> Option<EventId> {
        let channel = self.channel_of(origin).unwrap_or_default();
        let route = event.resolve_route(&channel);
        self.enqueue_routed(at, event, route, origin)
    }

    /// Push onto the queue of `at`'s tree.
    pub(crate) fn enqueue_routed(
        &self,
        at: ComponentId,
        event: Event,
        route: Route,
        origin: ComponentId,
    ) -> Option<EventId> {
        let id = event.id();
        {
            let mut st = self.state.borrow_mut();
            let Ok(root) = st.node(at).map(|node| node.root) else {
                debug!(component = %at, event = %event, "dropping event for missing component");
                return None;
            };
            st.node_mut(root)
                .ok()?
                .root_state
                .queue
                .push_back(Queued {
                    event,
                    route,
                    origin,
                });
        }
        self.shared.notify.notify_one();
        Some(id)
    }

    /// Queue an `Error` event describing `err` on `origin`'s tree.
    pub(crate) fn report_error(
        &self,
        origin: ComponentId,
        err: &anyhow::Error,
        handler: Option<&HandlerInfo>,
        fevent: Option<&Event>,
    ) {
        let (kind, message, stack) = describe(err);
        let event = events::error(&kind, &message, stack, handler, fevent);
        self.enqueue(origin, event, origin);
    }

    fn flush_root(&self, root: ComponentId) -> usize {
        let batch = {
            let mut st = self.state.borrow_mut();
            match st.node_mut(root) {
                Ok(node) => std::mem::take(&mut node.root_state.queue),
                Err(_) => return 0,
            }
        };
        let count = batch.len();
        for queued in batch {
            self.dispatch_one(queued, root);
        }
        count
    }

    fn dispatch_one(&self, queued: Queued, root: ComponentId) {
        let Queued {
            event,
            route,
            origin,
        } = queued;
        if event.is_cancelled() {
            debug!(event = %event, "skipping cancelled event");
            self.state.borrow_mut().driver.cancel(event.id());
            return;
        }

        let root = self.root_of(root).unwrap_or(root);
        let handlers = self
            .state
            .borrow()
            .node(root)
            .map(|node| node.root_state.table.resolve(&route.target, &route.channel))
            .unwrap_or_default();
        debug!(event = %event, %route, handlers = handlers.len(), "dispatching");
        if handlers.is_empty() && event.name() == events::ERROR {
            warn!(error = %event, "unhandled error event");
        }

        let run = DispatchRun {
            event,
            route,
            root,
            origin,
            handlers,
            index: 0,
            outcome: Outcome::default(),
        };
        self.emit_feedback(&run, FeedbackKind::Start, Vec::new(), None);
        self.continue_dispatch(run);
    }

    fn continue_dispatch(&self, mut run: DispatchRun) {
        while run.index < run.handlers.len() {
            let installed = run.handlers[run.index].clone();
            run.index += 1;
            run.event.set_handler(Some(installed.info.clone()));

            let result = match self.invoke(&installed, &mut run.event) {
                None => continue,
                Some(Ok(Reply::Value(value))) => Ok(value),
                Some(Ok(Reply::Suspend(mut future))) => {
                    let task = self.state.borrow_mut().driver.next_task_id();
                    match self.poll_task(task, &mut future) {
                        Poll::Ready(result) => result,
                        Poll::Pending => {
                            debug!(handler = %installed.info, event = %run.event, "handler suspended");
                            self.state
                                .borrow_mut()
                                .driver
                                .park(task, Suspended { future, run });
                            return;
                        }
                    }
                }
                Some(Err(err)) => Err(err),
            };

            if let Flow::Halt = self.apply(&mut run, &installed, result) {
                self.finish_dispatch(run, true);
                return;
            }
        }
        self.finish_dispatch(run, false);
    }

    /// Poll a parked handler again; continue its chain once it is done.
    pub(crate) fn resume(&self, task: TaskId, mut suspended: Suspended) {
        let result = match self.poll_task(task, &mut suspended.future) {
            Poll::Pending => {
                self.state.borrow_mut().driver.park(task, suspended);
                return;
            }
            Poll::Ready(result) => result,
        };

        let mut run = suspended.run;
        let Some(installed) = run.index.checked_sub(1).and_then(|i| run.handlers.get(i)).cloned() else {
            self.continue_dispatch(run);
            return;
        };
        debug!(handler = %installed.info, event = %run.event, "handler resumed");
        run.event.set_handler(Some(installed.info.clone()));
        match self.apply(&mut run, &installed, result) {
            Flow::Halt => self.finish_dispatch(run, true),
            Flow::Continue => self.continue_dispatch(run),
        }
    }

    fn apply(&self, run: &mut DispatchRun, installed: &Installed, result: anyhow::Result<Value>) -> Flow {
        let info = installed.info.clone();
        run.outcome.last = Some(info.clone());

        match result {
            Err(err) => {
                let (kind, message, stack) = describe(&err);
                debug!(handler = %info, error = %message, "handler failed");
                if run.event.name() == events::ERROR {
                    warn!(handler = %info, error = %message, "error handler failed");
                } else {
                    self.report_error(info.component, &err, Some(&info), Some(&run.event));
                }
                self.emit_feedback(
                    run,
                    FeedbackKind::Failure,
                    vec![Value::from(kind), Value::from(message.clone()), Value::Array(stack)],
                    Some(info),
                );
                run.outcome.failed.get_or_insert(message);
            }
            Ok(value) => {
                let truthy = is_truthy(&value);
                if !value.is_null() {
                    run.outcome.value = value.clone();
                }
                if info.filter && truthy {
                    debug!(handler = %info, event = %run.event, "filtered");
                    self.emit_feedback(run, FeedbackKind::Filter, vec![value], Some(info));
                    return Flow::Halt;
                }
                self.emit_feedback(run, FeedbackKind::Success, vec![value], Some(info));
            }
        }

        if run.event.is_stopped() {
            Flow::Halt
        } else {
            Flow::Continue
        }
    }

    fn finish_dispatch(&self, run: DispatchRun, halted: bool) {
        if !halted {
            let value = run.outcome.value.clone();
            let last = run.outcome.last.clone();
            self.emit_feedback(&run, FeedbackKind::End, vec![value], last);
        }
        let result = match &run.outcome.failed {
            Some(message) => Err(message.clone()),
            None => Ok(run.outcome.value.clone()),
        };
        self.state
            .borrow_mut()
            .driver
            .complete(run.event.id(), &run.route.channel, result);
    }

    fn emit_feedback(
        &self,
        run: &DispatchRun,
        kind: FeedbackKind,
        args: Vec<Value>,
        handler: Option<HandlerInfo>,
    ) {
        let Some(spec) = run.event.feedback().get(kind) else {
            return;
        };
        let target = spec
            .target
            .clone()
            .unwrap_or_else(|| run.route.target.clone());
        let mut event = Event::new(kind.name())
            .target(target)
            .channel(spec.channel.clone());
        event.args = args;
        event.set_handler(handler);
        event.set_source(run.event.clone());
        let route = event.resolve_route("");
        self.enqueue_routed(run.root, event, route, run.origin);
    }

    fn invoke(&self, installed: &Installed, event: &mut Event) -> Option<anyhow::Result<Reply>> {
        let component = installed.info.component;
        let mut state = match self.checkout(component) {
            Ok(state) => state,
            Err(Checkout::Gone) => {
                debug!(handler = %installed.info, "component removed, skipping handler");
                return None;
            }
            Err(Checkout::Busy) => return Some(Err(RuntimeError::ComponentBusy(component).into())),
        };

        let ctx = Context::new(self.clone(), component);
        let result = catch_unwind(AssertUnwindSafe(|| {
            (installed.callable)(state.as_mut(), &ctx, event)
        }));
        self.checkin(component, state);
        Some(result.unwrap_or_else(|panic| Err(panic_error(panic))))
    }

    fn poll_task(
        &self,
        task: TaskId,
        future: &mut LocalBoxFuture<'static, anyhow::Result<Value>>,
    ) -> Poll<anyhow::Result<Value>> {
        let waker = driver::waker(task, self.shared.clone());
        let mut cx = TaskContext::from_waker(&waker);
        catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
            .unwrap_or_else(|panic| Poll::Ready(Err(panic_error(panic))))
    }
}
