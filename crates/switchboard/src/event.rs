//! Events: named messages with a positional/keyword payload and routing
//! metadata.
//!
//! An event is addressed to a `(target, channel)` pair. Either half may be
//! left unset and is filled in when the event is fired:
//!
//! - `channel` defaults to the lower-cased event name (`Hello` -> `hello`),
//! - `target` defaults to the firing component's channel, or `"*"`.
//!
//! Feedback channels (`start`, `success`, `failure`, `filter`, `end`) ask the
//! dispatcher to fire a synthetic event describing how processing went.

use crate::error::RuntimeError;
use crate::handler::HandlerInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::ops::{Index, IndexMut};
use uuid::Uuid;

/// The wildcard target/channel.
pub const ANY: &str = "*";

/// Identity of one event instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fully resolved `(target, channel)` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub target: String,
    pub channel: String,
}

impl Route {
    pub fn new(target: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target, self.channel)
    }
}

/// A feedback destination. The target falls back to the originating
/// event's target when unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub target: Option<String>,
    pub channel: String,
}

impl From<&str> for ChannelSpec {
    fn from(channel: &str) -> Self {
        Self {
            target: None,
            channel: channel.to_owned(),
        }
    }
}

impl From<String> for ChannelSpec {
    fn from(channel: String) -> Self {
        Self {
            target: None,
            channel,
        }
    }
}

impl From<(&str, &str)> for ChannelSpec {
    fn from((target, channel): (&str, &str)) -> Self {
        Self {
            target: Some(target.to_owned()),
            channel: channel.to_owned(),
        }
    }
}

/// The five kinds of synthetic outcome events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackKind {
    Start,
    Success,
    Failure,
    Filter,
    End,
}

impl FeedbackKind {
    /// Event name of the synthetic event.
    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Filter => "Filter",
            Self::End => "End",
        }
    }
}

/// Feedback channels declared by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feedback {
    pub start: Option<ChannelSpec>,
    pub success: Option<ChannelSpec>,
    pub failure: Option<ChannelSpec>,
    pub filter: Option<ChannelSpec>,
    pub end: Option<ChannelSpec>,
}

impl Feedback {
    pub fn get(&self, kind: FeedbackKind) -> Option<&ChannelSpec> {
        match kind {
            FeedbackKind::Start => self.start.as_ref(),
            FeedbackKind::Success => self.success.as_ref(),
            FeedbackKind::Failure => self.failure.as_ref(),
            FeedbackKind::Filter => self.filter.as_ref(),
            FeedbackKind::End => self.end.as_ref(),
        }
    }

    fn slot(&mut self, kind: FeedbackKind) -> &mut Option<ChannelSpec> {
        match kind {
            FeedbackKind::Start => &mut self.start,
            FeedbackKind::Success => &mut self.success,
            FeedbackKind::Failure => &mut self.failure,
            FeedbackKind::Filter => &mut self.filter,
            FeedbackKind::End => &mut self.end,
        }
    }
}

/// A message fired into a component tree.
///
/// Equality compares name, route, args and kwargs only; identity, feedback
/// configuration and attachments are ignored.
pub struct Event {
    id: EventId,
    name: Cow<'static, str>,
    /// Positional payload.
    pub args: Vec<Value>,
    /// Named payload.
    pub kwargs: Map<String, Value>,
    target: Option<String>,
    channel: Option<String>,
    feedback: Feedback,
    handler: Option<HandlerInfo>,
    source: Option<Box<Event>>,
    attachment: Option<Box<dyn Any + Send>>,
    stopped: bool,
    cancelled: bool,
}

impl Event {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            target: None,
            channel: None,
            feedback: Feedback::default(),
            handler: None,
            source: None,
            attachment: None,
            stopped: false,
            cancelled: false,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Address the event to `channel`.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Address the event to components on `target`.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn on_start(self, spec: impl Into<ChannelSpec>) -> Self {
        self.with_feedback(FeedbackKind::Start, spec)
    }

    pub fn on_success(self, spec: impl Into<ChannelSpec>) -> Self {
        self.with_feedback(FeedbackKind::Success, spec)
    }

    pub fn on_failure(self, spec: impl Into<ChannelSpec>) -> Self {
        self.with_feedback(FeedbackKind::Failure, spec)
    }

    pub fn on_filter(self, spec: impl Into<ChannelSpec>) -> Self {
        self.with_feedback(FeedbackKind::Filter, spec)
    }

    pub fn on_end(self, spec: impl Into<ChannelSpec>) -> Self {
        self.with_feedback(FeedbackKind::End, spec)
    }

    pub fn with_feedback(mut self, kind: FeedbackKind, spec: impl Into<ChannelSpec>) -> Self {
        *self.feedback.slot(kind) = Some(spec.into());
        self
    }

    /// Attach an opaque payload. Attachments are moved, never cloned.
    pub fn with_attachment<T: Any + Send>(mut self, value: T) -> Self {
        self.attachment = Some(Box::new(value));
        self
    }

    /// Take the attachment out if it has type `T`.
    pub fn take_attachment<T: Any + Send>(&mut self) -> Option<T> {
        match self.attachment.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.attachment = Some(other);
                None
            }
        }
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_name(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// The route, once both halves are known (always true after firing).
    pub fn route(&self) -> Option<Route> {
        match (&self.target, &self.channel) {
            (Some(target), Some(channel)) => Some(Route::new(target.clone(), channel.clone())),
            _ => None,
        }
    }

    pub fn feedback(&self) -> &Feedback {
        &self.feedback
    }

    /// The handler processing this event, or for feedback events the
    /// handler whose outcome they report.
    pub fn handler(&self) -> Option<&HandlerInfo> {
        self.handler.as_ref()
    }

    /// For feedback events, the event they describe.
    pub fn source(&self) -> Option<&Event> {
        self.source.as_deref()
    }

    /// Stop further handlers from seeing this event.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Skip this event if it is still waiting in a queue.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Read a payload slot by a dynamic key: an integer indexes `args`, a
    /// string indexes `kwargs`.
    pub fn get_item(&self, key: &Value) -> Result<&Value, RuntimeError> {
        match key {
            Value::Number(n) => {
                let index = n
                    .as_u64()
                    .ok_or_else(|| RuntimeError::InvalidKey(key.to_string()))?;
                usize::try_from(index)
                    .ok()
                    .and_then(|i| self.args.get(i))
                    .ok_or_else(|| RuntimeError::KeyNotFound(key.to_string()))
            }
            Value::String(s) => self
                .kwargs
                .get(s)
                .ok_or_else(|| RuntimeError::KeyNotFound(s.clone())),
            other => Err(RuntimeError::InvalidKey(other.to_string())),
        }
    }

    /// Write a payload slot by a dynamic key. String keys insert; integer
    /// keys must address an existing position.
    pub fn set_item(&mut self, key: &Value, value: Value) -> Result<(), RuntimeError> {
        match key {
            Value::Number(n) => {
                let slot = n
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(|| RuntimeError::InvalidKey(key.to_string()))?;
                let arg = self
                    .args
                    .get_mut(slot)
                    .ok_or_else(|| RuntimeError::KeyNotFound(key.to_string()))?;
                *arg = value;
                Ok(())
            }
            Value::String(s) => {
                self.kwargs.insert(s.clone(), value);
                Ok(())
            }
            other => Err(RuntimeError::InvalidKey(other.to_string())),
        }
    }

    /// Copy with a fresh identity; used by timers that fire the same
    /// template repeatedly.
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        copy.id = EventId::new();
        copy.stopped = false;
        copy.cancelled = false;
        copy
    }

    pub(crate) fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    /// Fill in the unset halves of the route and return it.
    pub(crate) fn resolve_route(&mut self, default_target: &str) -> Route {
        let channel = self
            .channel
            .get_or_insert_with(|| self.name.to_lowercase())
            .clone();
        let target = self
            .target
            .get_or_insert_with(|| {
                if default_target.is_empty() {
                    ANY.to_owned()
                } else {
                    default_target.to_owned()
                }
            })
            .clone();
        Route { target, channel }
    }

    pub(crate) fn set_handler(&mut self, handler: Option<HandlerInfo>) {
        self.handler = handler;
    }

    pub(crate) fn set_source(&mut self, source: Event) {
        self.source = Some(Box::new(source));
    }
}

impl Clone for Event {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            target: self.target.clone(),
            channel: self.channel.clone(),
            feedback: self.feedback.clone(),
            handler: self.handler.clone(),
            source: self.source.clone(),
            attachment: None,
            stopped: self.stopped,
            cancelled: self.cancelled,
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.target == other.target
            && self.channel == other.channel
            && self.args == other.args
            && self.kwargs == other.kwargs
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target", &self.target)
            .field("channel", &self.channel)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("handler", &self.handler.as_ref().map(|h| &h.name))
            .field("attachment", &self.attachment.is_some())
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let route = match (&self.target, &self.channel) {
            (Some(t), Some(c)) => format!("{t}:{c}"),
            (None, Some(c)) => c.clone(),
            _ => String::new(),
        };
        let args = self
            .args
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let kwargs = self
            .kwargs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "<{}[{}] ({}; {})>", self.name, route, args, kwargs)
    }
}

impl Index<usize> for Event {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.args[index]
    }
}

impl IndexMut<usize> for Event {
    fn index_mut(&mut self, index: usize) -> &mut Value {
        &mut self.args[index]
    }
}

impl Index<&str> for Event {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        &self.kwargs[key]
    }
}

impl IndexMut<&str> for Event {
    fn index_mut(&mut self, key: &str) -> &mut Value {
        self.kwargs.entry(key.to_owned()).or_insert(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_defaults_to_lowercased_name() {
        let mut event = Event::new("HelloWorld");
        let route = event.resolve_route("app");
        assert_eq!(route, Route::new("app", "helloworld"));
        assert_eq!(event.route(), Some(route));
    }

    #[test]
    fn explicit_route_wins_over_defaults() {
        let mut event = Event::new("Hello").channel("greet").target("b");
        assert_eq!(event.resolve_route("a"), Route::new("b", "greet"));
    }

    #[test]
    fn empty_default_target_becomes_wildcard() {
        let mut event = Event::new("Hello");
        assert_eq!(event.resolve_route(""), Route::new(ANY, "hello"));
    }

    #[test]
    fn index_reads_and_writes_args_and_kwargs() {
        let mut event = Event::new("Sum").arg(1).arg(2).kwarg("scale", 10);
        assert_eq!(event[0], json!(1));
        assert_eq!(event["scale"], json!(10));

        event[1] = json!(5);
        event["scale"] = json!(3);
        event["offset"] = json!(7);
        assert_eq!(event.args, vec![json!(1), json!(5)]);
        assert_eq!(event.kwargs["offset"], json!(7));
    }

    #[test]
    fn dynamic_keys_reject_other_types() {
        let mut event = Event::new("Sum").arg(1).kwarg("k", "v");
        assert_eq!(event.get_item(&json!(0)).unwrap(), &json!(1));
        assert_eq!(event.get_item(&json!("k")).unwrap(), &json!("v"));
        assert!(matches!(
            event.get_item(&json!(true)),
            Err(RuntimeError::InvalidKey(_))
        ));
        assert!(matches!(
            event.get_item(&json!(-1)),
            Err(RuntimeError::InvalidKey(_))
        ));
        assert!(matches!(
            event.get_item(&json!(4)),
            Err(RuntimeError::KeyNotFound(_))
        ));
        assert!(matches!(
            event.set_item(&json!([1]), json!(0)),
            Err(RuntimeError::InvalidKey(_))
        ));
        event.set_item(&json!(0), json!(9)).unwrap();
        assert_eq!(event[0], json!(9));
    }

    #[test]
    fn equality_ignores_identity_and_feedback() {
        let a = Event::new("Hello").arg(1).on_success("done");
        let b = Event::new("Hello").arg(1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, b);
        assert_ne!(a, Event::new("Hello").arg(2));
        assert_ne!(a, Event::new("Hello").arg(1).channel("x"));
    }

    #[test]
    fn attachments_are_taken_by_type_and_not_cloned() {
        let mut event = Event::new("Task").with_attachment(41_u32);
        assert!(event.clone().take_attachment::<u32>().is_none());
        assert!(event.take_attachment::<String>().is_none());
        assert_eq!(event.take_attachment::<u32>(), Some(41));
        assert!(!event.has_attachment());
    }

    #[test]
    fn duplicate_gets_fresh_identity() {
        let event = Event::new("Tick").arg(1);
        let copy = event.duplicate();
        assert_ne!(event.id(), copy.id());
        assert_eq!(event, copy);
    }

    #[test]
    fn display_shows_route_and_payload() {
        let mut event = Event::new("Hello").arg("x").kwarg("n", 1);
        event.resolve_route("app");
        assert_eq!(event.to_string(), r#"<Hello[app:hello] ("x"; n=1)>"#);
    }
}
