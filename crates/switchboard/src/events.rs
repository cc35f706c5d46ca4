//! Lifecycle events raised by the runtime itself.
//!
//! | Event | Args | Route |
//! |-------|------|-------|
//! | `Registered` | `[component, manager]` | `(component channel, "registered")` |
//! | `Unregistered` | `[component, manager]` | `(component channel, "unregistered")` |
//! | `Started` | `[component, mode]` | `("*", "started")` |
//! | `Stopped` | `[component]` | `("*", "stopped")` |
//! | `Signal` | `[number, context]` | `("*", "signal")` |
//! | `Error` | `[type, message, stack]` + `handler`, `fevent` | `("*", "error")` |
//!
//! Components travel as JSON integers; read them back with [`component_arg`].

use crate::component::ComponentId;
use crate::event::{Event, ANY};
use crate::handler::HandlerInfo;
use serde_json::Value;

pub const REGISTERED: &str = "Registered";
pub const UNREGISTERED: &str = "Unregistered";
pub const STARTED: &str = "Started";
pub const STOPPED: &str = "Stopped";
pub const SIGNAL: &str = "Signal";
pub const ERROR: &str = "Error";

pub fn registered(component: ComponentId, manager: ComponentId) -> Event {
    Event::new(REGISTERED)
        .arg(component.to_value())
        .arg(manager.to_value())
}

pub fn unregistered(component: ComponentId, manager: ComponentId) -> Event {
    Event::new(UNREGISTERED)
        .arg(component.to_value())
        .arg(manager.to_value())
}

pub fn started(component: ComponentId, mode: &str) -> Event {
    Event::new(STARTED)
        .arg(component.to_value())
        .arg(mode)
        .target(ANY)
}

pub fn stopped(component: ComponentId) -> Event {
    Event::new(STOPPED).arg(component.to_value()).target(ANY)
}

pub fn signal(number: i32, context: &str) -> Event {
    Event::new(SIGNAL).arg(number).arg(context).target(ANY)
}

pub fn error(
    kind: &str,
    message: &str,
    stack: Vec<Value>,
    handler: Option<&HandlerInfo>,
    fevent: Option<&Event>,
) -> Event {
    let mut event = Event::new(ERROR)
        .arg(kind)
        .arg(message)
        .arg(Value::Array(stack))
        .target(ANY);
    if let Some(handler) = handler {
        event = event.kwarg(
            "handler",
            serde_json::to_value(handler).unwrap_or(Value::Null),
        );
        event.set_handler(Some(handler.clone()));
    }
    if let Some(fevent) = fevent {
        event = event.kwarg("fevent", fevent.to_string());
    }
    event
}

/// Component reference at `index` of a lifecycle event.
pub fn component_arg(event: &Event, index: usize) -> Option<ComponentId> {
    event.args.get(index).and_then(ComponentId::from_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_events_carry_integer_component_ids() {
        let event = registered(ComponentId::from_index(3), ComponentId::from_index(1));
        assert_eq!(event.args, vec![json!(3), json!(1)]);
        assert_eq!(component_arg(&event, 0), Some(ComponentId::from_index(3)));
        assert_eq!(component_arg(&event, 1), Some(ComponentId::from_index(1)));
        assert_eq!(component_arg(&event, 2), None);
    }

    #[test]
    fn broadcast_events_target_everything() {
        let root = ComponentId::from_index(0);
        for event in [started(root, "run"), stopped(root), signal(2, "os")] {
            assert_eq!(event.target_name(), Some(ANY));
        }
        assert_eq!(registered(root, root).target_name(), None);
    }

    #[test]
    fn error_event_describes_the_failure() {
        let source = Event::new("Hello");
        let event = error("Panic", "boom", vec![json!("cause")], None, Some(&source));
        assert_eq!(event.args, vec![json!("Panic"), json!("boom"), json!(["cause"])]);
        assert_eq!(event.kwargs["fevent"], json!(source.to_string()));
        assert!(event.handler().is_none());
    }
}
