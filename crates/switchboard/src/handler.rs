//! Handler declarations.
//!
//! A component type lists its handlers once, in [`Component::handlers`],
//! through a [`HandlerSet`]. Each declaration carries the metadata the
//! dispatcher orders and routes by: channels, target, priority, and whether
//! the handler is a filter.
//!
//! # Overrides
//!
//! Sets compose with [`HandlerSet::include`] / [`HandlerSet::include_from`]
//! (the replacement for class inheritance). Entries are resolved in
//! declaration order:
//!
//! - an entry marked [`Declared::overrides`] removes every earlier entry with
//!   the same `(target, channels)` key;
//! - an included entry whose key matches an override already in the set is
//!   dropped.
//!
//! So an override wins whether the base set is included before or after it,
//! and two plain entries with the same key are both kept.

use crate::component::{Component, ComponentId};
use crate::context::Context;
use crate::event::Event;
use anyhow::anyhow;
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::{smallvec, SmallVec};
use std::any::{type_name, Any};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::rc::Rc;

pub(crate) type HandlerFn = Rc<dyn Fn(&mut dyn Any, &Context, &mut Event) -> anyhow::Result<Reply>>;
pub(crate) type TickFn = Rc<dyn Fn(&mut dyn Any, &Context) -> anyhow::Result<()>>;

/// Identity of an installed handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub(crate) u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Description of an installed handler, attached to events while they are
/// being processed and to the feedback events that report on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub id: HandlerId,
    pub component: ComponentId,
    pub name: String,
    pub target: String,
    pub channels: Vec<String>,
    pub priority: f64,
    pub filter: bool,
    /// Receives the whole event rather than its payload.
    pub accepts_event: bool,
}

impl fmt::Display for HandlerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<handler[{}][{}] {}{} ({})>",
            self.target,
            self.channels.join(","),
            self.name,
            if self.filter { " filter" } else { "" },
            self.component
        )
    }
}

/// Read-only view of an event's payload, passed to handlers that do not
/// take the whole event.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
}

impl<'a> Payload<'a> {
    pub(crate) fn of(event: &'a Event) -> Self {
        Self {
            args: &event.args,
            kwargs: &event.kwargs,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&'a Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&'a Value> {
        self.kwargs.get(key)
    }

    pub fn str_arg(&self, index: usize) -> Option<&'a str> {
        self.arg(index).and_then(Value::as_str)
    }

    pub fn i64_arg(&self, index: usize) -> Option<i64> {
        self.arg(index).and_then(Value::as_i64)
    }
}

/// What a handler hands back to the dispatcher.
pub enum Reply {
    /// Finished with a value (`Null` for "nothing").
    Value(Value),
    /// Not finished: the dispatcher drives this future on the dispatch
    /// thread and resumes the handler chain when it completes.
    Suspend(LocalBoxFuture<'static, anyhow::Result<Value>>),
}

impl Reply {
    pub fn suspend<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + 'static,
    {
        Self::Suspend(Box::pin(future))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Suspend(_) => f.write_str("Suspend(..)"),
        }
    }
}

/// Conversion of handler return values.
pub trait IntoReply {
    fn into_reply(self) -> anyhow::Result<Reply>;
}

impl IntoReply for Reply {
    fn into_reply(self) -> anyhow::Result<Reply> {
        Ok(self)
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> anyhow::Result<Reply> {
        Ok(Reply::Value(self))
    }
}

impl IntoReply for () {
    fn into_reply(self) -> anyhow::Result<Reply> {
        Ok(Reply::Value(Value::Null))
    }
}

macro_rules! into_reply_via_value {
    ($($ty:ty),*) => {
        $(
            impl IntoReply for $ty {
                fn into_reply(self) -> anyhow::Result<Reply> {
                    Ok(Reply::Value(Value::from(self)))
                }
            }
        )*
    };
}

into_reply_via_value!(bool, i64, u64, f64, String, &'static str);

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<anyhow::Error>,
{
    fn into_reply(self) -> anyhow::Result<Reply> {
        self.map_err(Into::into)?.into_reply()
    }
}

/// Truthiness of a handler value, as filters are judged.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// One type-erased handler declaration.
#[derive(Clone)]
pub(crate) struct HandlerSpec {
    pub(crate) name: String,
    pub(crate) channels: SmallVec<[String; 2]>,
    pub(crate) target: Option<String>,
    pub(crate) priority: f64,
    pub(crate) filter: bool,
    pub(crate) overrides: bool,
    pub(crate) accepts_event: bool,
    pub(crate) global: bool,
    pub(crate) inherited: bool,
    pub(crate) callable: HandlerFn,
}

impl HandlerSpec {
    fn key(&self) -> (Option<&str>, SmallVec<[&str; 2]>) {
        let mut channels: SmallVec<[&str; 2]> = self.channels.iter().map(String::as_str).collect();
        channels.sort_unstable();
        (self.target.as_deref(), channels)
    }
}

/// Builder handle for the declaration just added to a [`HandlerSet`].
pub struct Declared<'a> {
    spec: &'a mut HandlerSpec,
}

impl Declared<'_> {
    /// Listen on these channels instead of the handler name.
    pub fn channels<I, S>(self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Bind under this target instead of the component's channel.
    pub fn target(self, target: impl Into<String>) -> Self {
        self.spec.target = Some(target.into());
        self
    }

    /// Higher runs first.
    pub fn priority(self, priority: f64) -> Self {
        self.spec.priority = priority;
        self
    }

    /// Run before listeners of equal priority; a truthy return ends the chain.
    pub fn filter(self) -> Self {
        self.spec.filter = true;
        self
    }

    /// Replace earlier (inherited) entries with the same key.
    pub fn overrides(self) -> Self {
        self.spec.overrides = true;
        self
    }

    /// Receive every event regardless of route.
    pub fn global(self) -> Self {
        self.spec.global = true;
        self
    }
}

/// The handler table of one component type.
pub struct HandlerSet<C> {
    entries: Vec<HandlerSpec>,
    ticks: Vec<TickFn>,
    _marker: PhantomData<fn(&mut C)>,
}

impl<C: 'static> Default for HandlerSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<C: 'static>(state: &mut dyn Any) -> anyhow::Result<&mut C> {
    state
        .downcast_mut::<C>()
        .ok_or_else(|| anyhow!("component state is not a {}", type_name::<C>()))
}

impl<C: 'static> HandlerSet<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            ticks: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Declare a handler that receives the event payload.
    pub fn on<F, R>(&mut self, name: &str, f: F) -> Declared<'_>
    where
        F: Fn(&mut C, &Context, Payload<'_>) -> R + 'static,
        R: IntoReply,
    {
        let callable: HandlerFn = Rc::new(move |state, ctx, event| {
            let this = downcast::<C>(state)?;
            f(this, ctx, Payload::of(event)).into_reply()
        });
        self.push(name, callable, false)
    }

    /// Declare a handler that receives the whole (mutable) event.
    pub fn on_event<F, R>(&mut self, name: &str, f: F) -> Declared<'_>
    where
        F: Fn(&mut C, &Context, &mut Event) -> R + 'static,
        R: IntoReply,
    {
        let callable: HandlerFn = Rc::new(move |state, ctx, event| {
            let this = downcast::<C>(state)?;
            f(this, ctx, event).into_reply()
        });
        self.push(name, callable, true)
    }

    /// Declare a hook run once per engine tick while the component is alive.
    pub fn on_tick<F>(&mut self, f: F)
    where
        F: Fn(&mut C, &Context) -> anyhow::Result<()> + 'static,
    {
        self.ticks.push(Rc::new(move |state, ctx| {
            let this = downcast::<C>(state)?;
            f(this, ctx)
        }));
    }

    /// Merge a base set for the same type.
    pub fn include(&mut self, base: HandlerSet<C>) {
        self.entries.extend(base.entries.into_iter().map(|mut spec| {
            spec.inherited = true;
            spec
        }));
        self.ticks.extend(base.ticks);
    }

    /// Merge the handlers of an embedded component `B`, reached through
    /// `project`.
    pub fn include_from<B: Component>(&mut self, project: fn(&mut C) -> &mut B) {
        let mut base = HandlerSet::<B>::new();
        B::handlers(&mut base);

        for mut spec in base.entries {
            let inner = spec.callable.clone();
            spec.callable = Rc::new(move |state, ctx, event| {
                let this = downcast::<C>(state)?;
                inner(project(this), ctx, event)
            });
            spec.inherited = true;
            self.entries.push(spec);
        }
        for tick in base.ticks {
            self.ticks.push(Rc::new(move |state, ctx| {
                let this = downcast::<C>(state)?;
                tick(project(this), ctx)
            }));
        }
    }

    /// Channel names this set listens on, private (`_`-prefixed) ones excluded.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .resolved()
            .iter()
            .flat_map(|spec| spec.channels.iter().cloned())
            .filter(|name| !name.starts_with('_'))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Whether every name is handled by this set.
    pub fn handles(&self, names: &[&str]) -> bool {
        let events = self.events();
        names.iter().all(|name| events.iter().any(|e| e == name))
    }

    /// Number of declarations after override resolution.
    pub fn len(&self) -> usize {
        self.resolved().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, name: &str, callable: HandlerFn, accepts_event: bool) -> Declared<'_> {
        self.entries.push(HandlerSpec {
            name: name.to_owned(),
            channels: smallvec![name.to_owned()],
            target: None,
            priority: 0.0,
            filter: false,
            overrides: false,
            accepts_event,
            global: false,
            inherited: false,
            callable,
        });
        let index = self.entries.len() - 1;
        Declared {
            spec: &mut self.entries[index],
        }
    }

    fn resolved(&self) -> Vec<HandlerSpec> {
        let mut resolved: Vec<HandlerSpec> = Vec::with_capacity(self.entries.len());
        for spec in &self.entries {
            if spec.overrides {
                resolved.retain(|kept| kept.key() != spec.key());
                resolved.push(spec.clone());
            } else if spec.inherited
                && resolved
                    .iter()
                    .any(|kept| kept.overrides && kept.key() == spec.key())
            {
                continue;
            } else {
                resolved.push(spec.clone());
            }
        }
        resolved
    }

    pub(crate) fn into_parts(self) -> (Vec<HandlerSpec>, Vec<TickFn>) {
        (self.resolved(), self.ticks)
    }
}
