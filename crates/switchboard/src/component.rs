//! The component contract.

use crate::event::ANY;
use crate::handler::HandlerSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;

/// Index of a component in the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(usize);

impl ComponentId {
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    /// Lifecycle events carry component references as JSON integers.
    pub fn from_value(value: &Value) -> Option<Self> {
        value
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .map(Self)
    }

    pub fn to_value(self) -> Value {
        Value::from(self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node of the component tree.
///
/// Handlers are declared once per type in [`Component::handlers`]; there is
/// no discovery by method name. The channel is read once, when the component
/// is added to an engine.
///
/// ```ignore
/// struct App;
///
/// impl Component for App {
///     fn channel(&self) -> &str { "app" }
///
///     fn handlers(set: &mut HandlerSet<Self>) {
///         set.on("hello", |_, _, _| "Hello World!");
///     }
/// }
/// ```
pub trait Component: Any {
    /// Addressing name of this component.
    fn channel(&self) -> &str {
        ANY
    }

    /// Declare this type's handlers and tick hooks.
    fn handlers(set: &mut HandlerSet<Self>)
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn component_ids_round_trip_through_json_integers() {
        let id = ComponentId::from_index(7);
        assert_eq!(id.to_value(), json!(7));
        assert_eq!(ComponentId::from_value(&json!(7)), Some(id));
        assert_eq!(ComponentId::from_value(&json!("7")), None);
        assert_eq!(id.to_string(), "#7");
    }
}
