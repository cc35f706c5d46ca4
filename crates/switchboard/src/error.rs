//! Runtime errors.
//!
//! Structural operations (registration, firing from an unknown component,
//! dynamic key access) return [`RuntimeError`]. Handler bodies return
//! `anyhow::Result` and their failures never surface here: the dispatcher
//! turns them into `Error` events.
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`RuntimeError::UnknownComponent`] | `RUNTIME_UNKNOWN_COMPONENT` | No |
//! | [`RuntimeError::ComponentBusy`] | `RUNTIME_COMPONENT_BUSY` | Yes |
//! | [`RuntimeError::Cycle`] | `RUNTIME_CYCLE` | No |
//! | [`RuntimeError::InvalidKey`] | `RUNTIME_INVALID_KEY` | No |
//! | [`RuntimeError::KeyNotFound`] | `RUNTIME_KEY_NOT_FOUND` | No |
//! | [`RuntimeError::Timeout`] | `RUNTIME_TIMEOUT` | Yes |
//! | [`RuntimeError::HandlerFailed`] | `RUNTIME_HANDLER_FAILED` | No |
//! | [`RuntimeError::WaitCancelled`] | `RUNTIME_WAIT_CANCELLED` | No |
//! | [`RuntimeError::EngineClosed`] | `RUNTIME_ENGINE_CLOSED` | No |
//! | [`RuntimeError::Config`] | `RUNTIME_CONFIG` | No |
//! | [`RuntimeError::Pool`] | `RUNTIME_POOL` | No |
//! | [`RuntimeError::TypeMismatch`] | `RUNTIME_TYPE_MISMATCH` | No |
//! | [`RuntimeError::Spawn`] | `RUNTIME_SPAWN` | No |

use crate::component::ComponentId;
use thiserror::Error;

/// Errors produced by the runtime itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// The component id does not name a live arena slot.
    #[error("unknown component: {0}")]
    UnknownComponent(ComponentId),

    /// A handler of this component is already on the stack (re-entrant `send`).
    #[error("component {0} is already executing a handler")]
    ComponentBusy(ComponentId),

    /// Registering `child` under `parent` would make a component its own ancestor.
    #[error("cannot register {child} under {parent}: would create a cycle")]
    Cycle {
        child: ComponentId,
        parent: ComponentId,
    },

    /// Dynamic event indexing with a key that is neither an integer nor a string.
    #[error("expected integer or string key, got {0}")]
    InvalidKey(String),

    /// Dynamic event indexing with a missing position or name.
    #[error("event key not found: {0}")]
    KeyNotFound(String),

    /// A `wait`/`call` deadline expired before the awaited event completed.
    #[error("wait timed out")]
    Timeout,

    /// The awaited event completed, but one of its handlers failed.
    #[error("handler failed: {0}")]
    HandlerFailed(String),

    /// The engine dropped the wait registration without resolving it.
    #[error("wait cancelled")]
    WaitCancelled,

    /// The engine is gone; injected events can no longer be delivered.
    #[error("engine closed")]
    EngineClosed,

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Worker pool failure (no job attached, worker gone).
    #[error("worker pool: {0}")]
    Pool(String),

    /// `with_component` asked for a type the component is not.
    #[error("component {id} is not a {expected}")]
    TypeMismatch {
        id: ComponentId,
        expected: &'static str,
    },

    /// An engine thread could not be started or ended abnormally.
    #[error("engine thread: {0}")]
    Spawn(String),
}

impl RuntimeError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownComponent(_) => "RUNTIME_UNKNOWN_COMPONENT",
            Self::ComponentBusy(_) => "RUNTIME_COMPONENT_BUSY",
            Self::Cycle { .. } => "RUNTIME_CYCLE",
            Self::InvalidKey(_) => "RUNTIME_INVALID_KEY",
            Self::KeyNotFound(_) => "RUNTIME_KEY_NOT_FOUND",
            Self::Timeout => "RUNTIME_TIMEOUT",
            Self::HandlerFailed(_) => "RUNTIME_HANDLER_FAILED",
            Self::WaitCancelled => "RUNTIME_WAIT_CANCELLED",
            Self::EngineClosed => "RUNTIME_ENGINE_CLOSED",
            Self::Config(_) => "RUNTIME_CONFIG",
            Self::Pool(_) => "RUNTIME_POOL",
            Self::TypeMismatch { .. } => "RUNTIME_TYPE_MISMATCH",
            Self::Spawn(_) => "RUNTIME_SPAWN",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ComponentBusy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<RuntimeError> {
        vec![
            RuntimeError::UnknownComponent(ComponentId::from_index(1)),
            RuntimeError::ComponentBusy(ComponentId::from_index(1)),
            RuntimeError::Cycle {
                child: ComponentId::from_index(1),
                parent: ComponentId::from_index(2),
            },
            RuntimeError::InvalidKey("true".into()),
            RuntimeError::KeyNotFound("x".into()),
            RuntimeError::Timeout,
            RuntimeError::HandlerFailed("boom".into()),
            RuntimeError::WaitCancelled,
            RuntimeError::EngineClosed,
            RuntimeError::Config("x".into()),
            RuntimeError::Pool("x".into()),
            RuntimeError::TypeMismatch {
                id: ComponentId::from_index(1),
                expected: "Pool",
            },
            RuntimeError::Spawn("x".into()),
        ]
    }

    #[test]
    fn codes_share_prefix_and_are_unique() {
        let variants = all_variants();
        let mut codes: Vec<_> = variants.iter().map(RuntimeError::code).collect();
        assert!(codes.iter().all(|c| c.starts_with("RUNTIME_")));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), variants.len());
    }

    #[test]
    fn only_timeout_and_busy_are_recoverable() {
        let recoverable: Vec<_> = all_variants()
            .into_iter()
            .filter(RuntimeError::is_recoverable)
            .collect();
        assert_eq!(
            recoverable,
            vec![
                RuntimeError::ComponentBusy(ComponentId::from_index(1)),
                RuntimeError::Timeout
            ]
        );
    }
}
