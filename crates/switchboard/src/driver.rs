//! Suspended handlers, waits and sleeps.
//!
//! A handler that returns [`Reply::Suspend`](crate::Reply::Suspend) becomes a
//! task: its future is parked here together with the rest of its event's
//! handler chain. Futures are only ever polled on the dispatch thread. Their
//! wakers are `Send` and simply mark the task ready and nudge the run loop,
//! so a worker thread completing a result can resume a handler safely.
//!
//! Waits are plain oneshot registrations keyed by channel or event id. The
//! dispatcher resolves them when a matching event finishes its chain; the
//! tick expires those whose deadline has passed.

use crate::dispatch::DispatchRun;
use crate::error::RuntimeError;
use crate::event::{Event, EventId};
use dashmap::DashSet;
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::task::ArcWake;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(u64);

/// State shared with other threads: the ready set and the run-loop nudge.
#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) ready: DashSet<TaskId>,
    pub(crate) notify: Notify,
}

impl Shared {
    pub(crate) fn take_ready(&self) -> Vec<TaskId> {
        let ids: Vec<TaskId> = self.ready.iter().map(|id| *id).collect();
        for id in &ids {
            self.ready.remove(id);
        }
        ids
    }
}

struct TaskWaker {
    id: TaskId,
    shared: Arc<Shared>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.shared.ready.insert(arc_self.id);
        arc_self.shared.notify.notify_one();
    }
}

pub(crate) fn waker(id: TaskId, shared: Arc<Shared>) -> Waker {
    futures::task::waker(Arc::new(TaskWaker { id, shared }))
}

/// What a wait is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitFor {
    /// The next event to finish on this channel.
    Channel(String),
    /// One specific event instance.
    Event(EventId),
}

impl From<&str> for WaitFor {
    fn from(channel: &str) -> Self {
        Self::Channel(channel.to_owned())
    }
}

impl From<String> for WaitFor {
    fn from(channel: String) -> Self {
        Self::Channel(channel)
    }
}

impl From<EventId> for WaitFor {
    fn from(id: EventId) -> Self {
        Self::Event(id)
    }
}

impl From<&Event> for WaitFor {
    fn from(event: &Event) -> Self {
        Self::Event(event.id())
    }
}

impl WaitFor {
    fn matches(&self, id: EventId, channel: &str) -> bool {
        match self {
            Self::Channel(c) => c == channel,
            Self::Event(e) => *e == id,
        }
    }
}

type WaitResult = Result<Value, RuntimeError>;

struct WaitEntry {
    key: WaitFor,
    sender: oneshot::Sender<WaitResult>,
    deadline: Option<Instant>,
}

/// Resolves with the awaited event's value, or the reason it never came.
#[must_use = "futures do nothing unless awaited"]
pub struct WaitFuture {
    inner: WaitInner,
}

enum WaitInner {
    Pending(oneshot::Receiver<WaitResult>),
    Ready(Option<WaitResult>),
}

impl WaitFuture {
    pub(crate) fn ready(result: WaitResult) -> Self {
        Self {
            inner: WaitInner::Ready(Some(result)),
        }
    }
}

impl Future for WaitFuture {
    type Output = WaitResult;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<WaitResult> {
        match &mut self.get_mut().inner {
            WaitInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(RuntimeError::WaitCancelled))),
            WaitInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(RuntimeError::WaitCancelled)))
            }
        }
    }
}

/// Resolves once its deadline has been reached by a tick.
#[must_use = "futures do nothing unless awaited"]
pub struct SleepFuture {
    rx: oneshot::Receiver<()>,
}

impl Future for SleepFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|_| ())
    }
}

/// A parked handler and the chain it interrupted.
pub(crate) struct Suspended {
    pub(crate) future: LocalBoxFuture<'static, anyhow::Result<Value>>,
    pub(crate) run: DispatchRun,
}

#[derive(Default)]
pub(crate) struct Driver {
    next_task: u64,
    tasks: HashMap<TaskId, Suspended>,
    waits: Vec<WaitEntry>,
    sleeps: Vec<(Instant, oneshot::Sender<()>)>,
    wake_hint: Option<Instant>,
}

impl Driver {
    pub(crate) fn next_task_id(&mut self) -> TaskId {
        self.next_task += 1;
        TaskId(self.next_task)
    }

    pub(crate) fn park(&mut self, id: TaskId, suspended: Suspended) {
        self.tasks.insert(id, suspended);
    }

    pub(crate) fn unpark(&mut self, id: TaskId) -> Option<Suspended> {
        self.tasks.remove(&id)
    }

    pub(crate) fn suspended(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn pending_waits(&self) -> usize {
        self.waits.len()
    }

    pub(crate) fn wait(&mut self, key: WaitFor, timeout: Option<Duration>) -> WaitFuture {
        let (sender, rx) = oneshot::channel();
        self.waits.push(WaitEntry {
            key,
            sender,
            deadline: timeout.map(|t| Instant::now() + t),
        });
        WaitFuture {
            inner: WaitInner::Pending(rx),
        }
    }

    pub(crate) fn sleep(&mut self, duration: Duration) -> SleepFuture {
        let (sender, rx) = oneshot::channel();
        self.sleeps.push((Instant::now() + duration, sender));
        SleepFuture { rx }
    }

    /// Ask the run loop to tick no later than `at`.
    pub(crate) fn wake_at(&mut self, at: Instant) {
        self.wake_hint = Some(self.wake_hint.map_or(at, |hint| hint.min(at)));
    }

    /// Resolve every wait matching a finished event.
    pub(crate) fn complete(&mut self, id: EventId, channel: &str, result: Result<Value, String>) {
        let (matched, rest): (Vec<WaitEntry>, Vec<WaitEntry>) = std::mem::take(&mut self.waits)
            .into_iter()
            .partition(|wait| wait.key.matches(id, channel));
        self.waits = rest;

        for wait in matched {
            let outcome = match &result {
                Ok(value) => Ok(value.clone()),
                Err(message) => Err(RuntimeError::HandlerFailed(message.clone())),
            };
            // The waiter may have been dropped; nothing to deliver then.
            let _ = wait.sender.send(outcome);
        }
    }

    /// Forget waits whose future has been dropped.
    pub(crate) fn drop_abandoned(&mut self) {
        self.waits.retain(|wait| !wait.sender.is_canceled());
    }

    /// Drop the waits on a cancelled event; their futures see
    /// [`RuntimeError::WaitCancelled`].
    pub(crate) fn cancel(&mut self, id: EventId) {
        self.waits.retain(|wait| wait.key != WaitFor::Event(id));
    }

    /// Time out expired waits and finish due sleeps.
    pub(crate) fn expire(&mut self, now: Instant) -> usize {
        let (expired, rest): (Vec<WaitEntry>, Vec<WaitEntry>) = std::mem::take(&mut self.waits)
            .into_iter()
            .partition(|wait| wait.deadline.is_some_and(|d| d <= now));
        self.waits = rest;

        let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sleeps)
            .into_iter()
            .partition(|(deadline, _)| *deadline <= now);
        self.sleeps = rest;

        if self.wake_hint.is_some_and(|hint| hint <= now) {
            self.wake_hint = None;
        }

        let count = expired.len() + due.len();
        for wait in expired {
            let _ = wait.sender.send(Err(RuntimeError::Timeout));
        }
        for (_, sender) in due {
            let _ = sender.send(());
        }
        count
    }

    /// Earliest instant at which a tick has something to do.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.waits
            .iter()
            .filter_map(|wait| wait.deadline)
            .chain(self.sleeps.iter().map(|(deadline, _)| *deadline))
            .chain(self.wake_hint)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    #[test]
    fn completion_resolves_matching_waits_only() {
        let mut driver = Driver::default();
        let event = Event::new("Hello");
        let by_id = driver.wait(WaitFor::from(&event), None);
        let by_channel = driver.wait("hello".into(), None);
        let unrelated = driver.wait("other".into(), None);

        driver.complete(event.id(), "hello", Ok(json!("hi")));
        assert_eq!(by_id.now_or_never(), Some(Ok(json!("hi"))));
        assert_eq!(by_channel.now_or_never(), Some(Ok(json!("hi"))));
        assert_eq!(driver.pending_waits(), 1);
        drop(unrelated);
    }

    #[test]
    fn failures_surface_as_handler_failed() {
        let mut driver = Driver::default();
        let id = EventId::new();
        let wait = driver.wait(id.into(), None);
        driver.complete(id, "x", Err("boom".into()));
        assert_eq!(
            wait.now_or_never(),
            Some(Err(RuntimeError::HandlerFailed("boom".into())))
        );
    }

    #[test]
    fn zero_timeout_expires_on_next_check() {
        let mut driver = Driver::default();
        let mut wait = driver.wait("never".into(), Some(Duration::ZERO));
        assert!((&mut wait).now_or_never().is_none());
        assert_eq!(driver.expire(Instant::now()), 1);
        assert_eq!(wait.now_or_never(), Some(Err(RuntimeError::Timeout)));
        assert_eq!(driver.pending_waits(), 0);
    }

    #[test]
    fn sleeps_finish_at_their_deadline() {
        let mut driver = Driver::default();
        let start = Instant::now();
        let mut sleep = driver.sleep(Duration::from_secs(60));
        assert_eq!(driver.expire(start), 0);
        assert!((&mut sleep).now_or_never().is_none());
        assert_eq!(driver.expire(start + Duration::from_secs(61)), 1);
        assert_eq!(sleep.now_or_never(), Some(()));
    }

    #[test]
    fn next_deadline_is_the_earliest_of_all_sources() {
        let mut driver = Driver::default();
        assert_eq!(driver.next_deadline(), None);
        let now = Instant::now();
        let _w = driver.wait("x".into(), Some(Duration::from_secs(30)));
        let _s = driver.sleep(Duration::from_secs(20));
        driver.wake_at(now + Duration::from_secs(5));
        let next = driver.next_deadline().expect("deadline");
        assert!(next <= now + Duration::from_secs(6));
    }

    #[test]
    fn dropped_registration_cancels_the_wait() {
        let mut driver = Driver::default();
        let wait = driver.wait("x".into(), None);
        driver.waits.clear();
        assert_eq!(wait.now_or_never(), Some(Err(RuntimeError::WaitCancelled)));
    }

    #[test]
    fn abandoned_waits_are_forgotten() {
        let mut driver = Driver::default();
        let kept = driver.wait("x".into(), None);
        let dropped = driver.wait("y".into(), None);
        drop(dropped);
        driver.drop_abandoned();
        assert_eq!(driver.pending_waits(), 1);
        drop(kept);
    }

    #[test]
    fn wakers_mark_tasks_ready() {
        let shared = Arc::new(Shared::default());
        let mut driver = Driver::default();
        let id = driver.next_task_id();
        waker(id, shared.clone()).wake();
        assert_eq!(shared.take_ready(), vec![id]);
        assert!(shared.take_ready().is_empty());
    }
}
