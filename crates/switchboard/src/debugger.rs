//! Event tracing component.

use crate::component::Component;
use crate::context::Context;
use crate::event::{Event, ANY};
use crate::handler::{HandlerSet, Payload};
use tracing::{debug, error};

/// Logs every event it sees at `debug` level and every `Error` event at
/// `error` level.
///
/// Register it anywhere in a tree: its event handler is global, so it sees
/// every event dispatched on that tree, ahead of other handlers
/// (priority 101; the error handler runs at 100).
pub struct Debugger {
    events: bool,
    errors: bool,
    ignore_events: Vec<String>,
    ignore_channels: Vec<String>,
    prefix: Option<String>,
    trim: Option<usize>,
}

impl Default for Debugger {
    fn default() -> Self {
        Self {
            events: true,
            errors: true,
            ignore_events: Vec::new(),
            ignore_channels: Vec::new(),
            prefix: None,
            trim: None,
        }
    }
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(mut self, enabled: bool) -> Self {
        self.events = enabled;
        self
    }

    pub fn errors(mut self, enabled: bool) -> Self {
        self.errors = enabled;
        self
    }

    /// Skip events with this name.
    pub fn ignore_event(mut self, name: impl Into<String>) -> Self {
        self.ignore_events.push(name.into());
        self
    }

    /// Skip events routed on this channel.
    pub fn ignore_channel(mut self, channel: impl Into<String>) -> Self {
        self.ignore_channels.push(channel.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Cut each logged line after `chars` characters.
    pub fn trim(mut self, chars: usize) -> Self {
        self.trim = Some(chars);
        self
    }

    /// The line logged for `event`, or `None` if it is filtered out.
    pub fn render(&self, event: &Event) -> Option<String> {
        if !self.events || self.ignore_events.iter().any(|n| n == event.name()) {
            return None;
        }
        if event
            .channel_name()
            .is_some_and(|c| self.ignore_channels.iter().any(|i| i == c))
        {
            return None;
        }

        let mut line = event.to_string();
        if let Some(prefix) = &self.prefix {
            line = format!("{prefix}: {line}");
        }
        if let Some(limit) = self.trim {
            if line.chars().count() > limit {
                line = format!("{} ...>", line.chars().take(limit).collect::<String>());
            }
        }
        Some(line)
    }

    fn on_event(&mut self, _ctx: &Context, event: &mut Event) {
        if let Some(line) = self.render(event) {
            debug!(target: "switchboard::debugger", "{line}");
        }
    }

    fn on_error(&mut self, _ctx: &Context, payload: Payload<'_>) {
        if !self.errors {
            return;
        }
        let kind = payload.str_arg(0).unwrap_or("Error");
        let message = payload.str_arg(1).unwrap_or_default();
        let handler = payload
            .kwarg("handler")
            .and_then(|h| h.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("");
        let fevent = payload
            .kwarg("fevent")
            .and_then(|e| e.as_str())
            .unwrap_or("");
        let stack = payload.arg(2).map(|s| s.to_string()).unwrap_or_default();
        error!(
            target: "switchboard::debugger",
            kind, handler, fevent, stack = %stack,
            "ERROR {message}"
        );
    }
}

impl Component for Debugger {
    fn handlers(set: &mut HandlerSet<Self>) {
        set.on_event("event", Debugger::on_event)
            .channels([ANY])
            .target(ANY)
            .priority(101.0);
        set.on("error", Debugger::on_error)
            .target(ANY)
            .priority(100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routed(name: &'static str, channel: &str) -> Event {
        let mut event = Event::new(name).channel(channel);
        event.resolve_route("app");
        event
    }

    #[test]
    fn renders_events_with_prefix() {
        let debugger = Debugger::new().prefix("app");
        assert_eq!(
            debugger.render(&routed("Hello", "hello")).as_deref(),
            Some("app: <Hello[app:hello] (; )>")
        );
    }

    #[test]
    fn ignore_lists_filter_by_name_and_channel() {
        let debugger = Debugger::new()
            .ignore_event("Tick")
            .ignore_channel("noise");
        assert!(debugger.render(&routed("Tick", "tick")).is_none());
        assert!(debugger.render(&routed("Hello", "noise")).is_none());
        assert!(debugger.render(&routed("Hello", "hello")).is_some());
        assert!(Debugger::new().events(false).render(&routed("Hello", "hello")).is_none());
    }

    #[test]
    fn trim_cuts_long_lines() {
        let debugger = Debugger::new().trim(6);
        assert_eq!(
            debugger.render(&routed("Hello", "hello")).as_deref(),
            Some("<Hello ...>")
        );
    }
}
